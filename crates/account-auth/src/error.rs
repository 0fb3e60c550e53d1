//! Error types for credential and refresh operations

/// Errors from credential storage and token refresh.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// OAuth credential is stale but carries no refresh token. Fails
    /// before any network call.
    #[error("no refresh token available")]
    MissingRefreshToken,

    /// The refresh token is permanently dead (revoked or rotated away).
    /// The account needs human re-authentication.
    #[error("refresh token rejected (invalid_grant): {0}")]
    InvalidGrant(String),

    /// Connection failure or 5xx after the retry budget is spent.
    #[error("token endpoint unreachable: {0}")]
    Network(String),

    /// Any other non-success token endpoint response. Not retried.
    #[error("token endpoint error {code}: {message}")]
    TokenEndpoint { code: String, message: String },

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Stable machine-readable code for UI/event consumers.
    pub fn code(&self) -> &str {
        match self {
            Error::MissingRefreshToken => "missing_refresh_token",
            Error::InvalidGrant(_) => "invalid_grant",
            Error::Network(_) => "network_error",
            Error::TokenEndpoint { code, .. } => code,
            Error::CredentialParse(_) => "credential_parse",
            Error::Io(_) => "io_error",
            Error::NotFound(_) => "not_found",
        }
    }

    /// Whether this failure means the account cannot recover without a
    /// human re-authenticating it.
    pub fn needs_reauthentication(&self) -> bool {
        matches!(self, Error::InvalidGrant(_) | Error::MissingRefreshToken)
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
