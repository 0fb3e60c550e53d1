//! Token staleness detection and refresh with bounded backoff
//!
//! The engine decides when a credential needs refreshing and drives the
//! token endpoint through transient failures:
//!
//! - stale: `expires_at` absent, in the past, or inside the lookahead window
//! - transient (connection failure or 5xx): retried with exponential
//!   backoff, 3 attempts total
//! - `invalid_grant`: fails immediately, the refresh token is permanently
//!   dead and the account needs re-authentication
//! - any other non-success status: fails immediately with the provider code
//!
//! A successful refresh is persisted to the credential store; if the write
//! fails the in-memory token is still returned, flagged `persistence_failed`
//! so callers can warn that the session will not survive a restart.

use std::sync::Arc;
use std::time::Duration;

use common::{Backoff, Clock};
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialKind, CredentialStore};
use crate::error::{Error, Result};
use crate::token::{TokenEndpoint, TransportError};

/// Default staleness lookahead: refresh anything expiring within 30 minutes.
pub const DEFAULT_LOOKAHEAD: Duration = Duration::from_secs(30 * 60);

/// A credential ready for use.
#[derive(Debug, Clone)]
pub struct ValidToken {
    pub access_token: String,
    pub was_refreshed: bool,
    /// The refreshed token could not be persisted; it works for this
    /// session but re-authentication will be needed after restart.
    pub persistence_failed: bool,
}

/// Keeps OAuth access tokens fresh; passes API keys through untouched.
pub struct TokenRefreshEngine {
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    lookahead: Duration,
    backoff: Backoff,
}

impl TokenRefreshEngine {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            endpoint,
            store,
            clock,
            lookahead: DEFAULT_LOOKAHEAD,
            backoff: Backoff::default(),
        }
    }

    pub fn with_lookahead(mut self, lookahead: Duration) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a credential with this expiry needs refreshing now.
    ///
    /// Stale when `expires_at` is absent, in the past, or within the
    /// lookahead window (boundary inclusive).
    pub fn is_stale(&self, expires_at: Option<u64>) -> bool {
        match expires_at {
            None => true,
            Some(expires) => expires <= self.clock.now_millis() + self.lookahead.as_millis() as u64,
        }
    }

    /// Return a usable token for the account, refreshing if stale.
    pub async fn ensure_valid(&self, account_id: &str) -> Result<ValidToken> {
        let credential = self
            .store
            .get(account_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("no credential for account {account_id}")))?;

        match credential.kind {
            CredentialKind::ApiKey => Ok(ValidToken {
                access_token: credential.value,
                was_refreshed: false,
                persistence_failed: false,
            }),
            CredentialKind::OAuth => {
                if !self.is_stale(credential.expires_at) {
                    return Ok(ValidToken {
                        access_token: credential.value,
                        was_refreshed: false,
                        persistence_failed: false,
                    });
                }
                debug!(account_id, "token stale, refreshing");
                self.refresh_and_persist(account_id, credential).await
            }
        }
    }

    /// Refresh regardless of the cached expiry.
    ///
    /// Used when a 401/403 is observed despite a valid-looking expiry
    /// (clock skew or silent revocation). API-key credentials have nothing
    /// to refresh and pass through.
    pub async fn force_refresh(&self, account_id: &str) -> Result<ValidToken> {
        let credential = self
            .store
            .get(account_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("no credential for account {account_id}")))?;

        match credential.kind {
            CredentialKind::ApiKey => Ok(ValidToken {
                access_token: credential.value,
                was_refreshed: false,
                persistence_failed: false,
            }),
            CredentialKind::OAuth => {
                debug!(account_id, "forced refresh");
                self.refresh_and_persist(account_id, credential).await
            }
        }
    }

    /// Drive the token endpoint through the retry budget, then persist.
    async fn refresh_and_persist(
        &self,
        account_id: &str,
        credential: Credential,
    ) -> Result<ValidToken> {
        let refresh_token = match credential.refresh_token.as_deref() {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => return Err(Error::MissingRefreshToken),
        };

        let mut attempt = 0u32;
        let token_response = loop {
            match self.endpoint.refresh(&refresh_token).await {
                Ok(response) => break response,
                Err(e) => {
                    let transient = match &e {
                        TransportError::Network(_) => true,
                        TransportError::Status { status, .. } => *status >= 500,
                    };
                    if transient {
                        if let Some(delay) = self.backoff.delay_after(attempt) {
                            warn!(
                                account_id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "transient refresh failure, backing off"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(Error::Network(describe(&e)));
                    }
                    return Err(classify_permanent(e));
                }
            }
        };

        let expires_at = self.clock.now_millis() + token_response.expires_in * 1000;
        let updated = Credential {
            kind: CredentialKind::OAuth,
            value: token_response.access_token.clone(),
            refresh_token: Some(token_response.refresh_token),
            expires_at: Some(expires_at),
            email: credential.email,
            scopes: credential.scopes,
        };

        let persistence_failed = match self.store.set(account_id, updated).await {
            Ok(()) => false,
            Err(e) => {
                warn!(
                    account_id,
                    error = %e,
                    "refreshed token could not be persisted, session will need re-auth after restart"
                );
                true
            }
        };

        info!(account_id, persistence_failed, "token refresh succeeded");
        Ok(ValidToken {
            access_token: token_response.access_token,
            was_refreshed: true,
            persistence_failed,
        })
    }
}

fn describe(error: &TransportError) -> String {
    match error {
        TransportError::Network(msg) => msg.clone(),
        TransportError::Status {
            status, message, ..
        } => format!("status {status}: {message}"),
    }
}

fn classify_permanent(error: TransportError) -> Error {
    match error {
        TransportError::Status {
            code: Some(code),
            message,
            ..
        } if code == "invalid_grant" => Error::InvalidGrant(message),
        TransportError::Status {
            status,
            code,
            message,
        } => Error::TokenEndpoint {
            code: code.unwrap_or_else(|| format!("http_{status}")),
            message,
        },
        TransportError::Network(msg) => Error::Network(msg),
    }
}
