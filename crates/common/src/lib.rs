//! Common types for the account failover workspace

mod backoff;
mod clock;
mod cooldown;
mod error;
mod secret;

pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use cooldown::CooldownTracker;
pub use error::{Error, Result};
pub use secret::Secret;
