//! Error types for failover operations

/// Errors from swap and account-state operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("account store error: {0}")]
    Store(String),

    #[error("swap failed: {0}")]
    SwapFailed(String),
}

/// Result alias for failover operations.
pub type Result<T> = std::result::Result<T, Error>;
