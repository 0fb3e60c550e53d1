//! Credential rotation and usage-aware failover
//!
//! Orchestrates a pool of AI-provider accounts: keeps OAuth tokens fresh,
//! polls per-account usage, proactively switches the active account before
//! a quota is exhausted, and reactively recovers from authentication
//! failures by rotating to a healthy alternative while avoiding swap
//! loops.
//!
//! Control flow per tick: `UsagePoller` → resolve active account → token
//! refresh → usage fetch + normalize → threshold check → (if exceeded or
//! auth failed) `ProfileSelector::select_best` → `SwapCoordinator::swap` →
//! operation restart → batched notifications.
//!
//! All state (cooldown maps, failure markers, the view cache) is
//! per-process and in-memory; cross-process coordination is explicitly out
//! of scope. Services are constructor-built instances passed by handle —
//! there are no globals — so tests isolate by building fresh instances
//! with fake collaborators.

pub mod accounts;
pub mod error;
pub mod events;
pub mod notify;
pub mod poller;
pub mod ratelimit;
pub mod registry;
pub mod selector;
pub mod swap;

pub use accounts::{AccountProfile, AccountStore, FileAccountStore, UsageWrite, resolve_active};
pub use error::{Error, Result};
pub use events::{AccountUsageEntry, AccountsUsageSummary, Event, EventBus};
pub use notify::{Notification, NotificationBatcher};
pub use poller::{PollerConfig, PollerDeps, UsagePoller, UsageSource};
pub use ratelimit::RateLimitTracker;
pub use registry::{
    InMemoryOperationRegistry, OperationRegistry, OperationSummary, RegisteredOperation,
};
pub use selector::{AccountAvailability, CandidateState, ProfileSelector};
pub use swap::SwapCoordinator;
