//! Account credential management and OAuth token refresh
//!
//! Provides the credential model (OAuth and API-key accounts), the
//! `CredentialStore` interface with a file-backed implementation, and the
//! `TokenRefreshEngine` that keeps OAuth access tokens fresh.
//!
//! Refresh flow:
//! 1. Poller calls `TokenRefreshEngine::ensure_valid(account_id)`
//! 2. Engine checks staleness (absent/past/near expiry) against the clock
//! 3. Stale tokens are refreshed via the `TokenEndpoint` transport with
//!    bounded exponential backoff on transient failures
//! 4. Refreshed tokens are persisted via `CredentialStore::set`; a failed
//!    persist still returns the in-memory token, flagged so callers can
//!    warn that re-authentication is needed after restart
//! 5. On an observed 401/403 despite a valid-looking expiry, callers use
//!    `force_refresh` to bypass the staleness check

pub mod constants;
pub mod credentials;
pub mod error;
pub mod refresh;
pub mod token;

pub use constants::*;
pub use credentials::{BoxFuture, Credential, CredentialKind, CredentialStore, FileCredentialStore};
pub use error::{Error, Result};
pub use refresh::{TokenRefreshEngine, ValidToken};
pub use token::{HttpTokenEndpoint, TokenEndpoint, TokenResponse, TransportError};
