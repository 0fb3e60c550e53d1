//! Per-provider usage polling and normalization
//!
//! Fetches per-account usage from heterogeneous provider APIs and
//! normalizes the divergent response shapes into one canonical
//! `UsageSnapshot`:
//!
//! - the Claude OAuth family reports rolling five-hour/seven-day windows
//!   on its own usage path (nested window objects, or a legacy flat shape)
//! - the quota-limit family reports a `limits[]` array with a token-quota
//!   item and a time-quota item on a shared path
//!
//! Outbound hostnames are restricted to an explicit allow-list of known
//! provider hosts. An HTTP 401/403 (or a body matching known auth-error
//! text) escapes as `AuthFailure` — the one error callers must handle;
//! every other failure records an api-failure cooldown for the account and
//! yields `None` rather than a fake zero-usage snapshot.

pub mod error;
pub mod fetch;
pub mod normalize;
pub mod provider;
pub mod snapshot;

pub use error::AuthFailure;
pub use fetch::{UsageFetcher, UsageTarget};
pub use normalize::{WindowUsage, normalize_oauth_usage, normalize_quota_limits};
pub use provider::{ProviderFamily, host_allowed, resolve_endpoint};
pub use snapshot::{LimitType, RawUsage, UsageSnapshot, WindowLabels};
