//! Usage fetch error types

/// Authentication rejected by the provider (HTTP 401/403 or a body
/// matching known auth-error text).
///
/// This is the only error allowed to escape a usage fetch — it drives the
/// caller's recovery state machine. Everything else is handled locally:
/// logged, cooldown recorded, `None` returned.
#[derive(Debug, Clone, thiserror::Error)]
#[error("authentication failure: {message}")]
pub struct AuthFailure {
    /// HTTP status when the failure came from a status code
    pub status: Option<u16>,
    pub message: String,
}
