//! Token endpoint transport
//!
//! One HTTPS POST: the refresh-token grant. The transport is a trait so the
//! refresh engine's retry and classification logic is exercised against
//! fakes; `HttpTokenEndpoint` is the production implementation.
//!
//! The token endpoint is the provider's console host, not the inference
//! API host.

use serde::{Deserialize, Serialize};

use crate::constants::{ANTHROPIC_CLIENT_ID, TOKEN_ENDPOINT};
use crate::credentials::BoxFuture;

/// Successful response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. The refresh
/// engine converts this to an absolute unix millisecond timestamp when
/// storing the credential.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

/// Error body shape returned by the token endpoint on failure.
#[derive(Debug, Default, Deserialize)]
pub struct OAuthErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "errorDescription")]
    pub error_description: Option<String>,
}

/// Transport-level outcome of a refresh call, before the engine's
/// retry/no-retry classification.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Connection-level failure (DNS, TLS, timeout, reset)
    Network(String),
    /// Non-success HTTP status with the parsed OAuth error code, if any
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },
}

/// The refresh-token grant, abstracted for dyn-compatibility
/// (`Arc<dyn TokenEndpoint>`).
pub trait TokenEndpoint: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, std::result::Result<TokenResponse, TransportError>>;
}

/// Production transport: POSTs the refresh-token grant as a form body.
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    url: String,
    client_id: String,
}

impl HttpTokenEndpoint {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            url: TOKEN_ENDPOINT.to_string(),
            client_id: ANTHROPIC_CLIENT_ID.to_string(),
        }
    }

    /// Override the endpoint URL (non-default token hosts).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, std::result::Result<TokenResponse, TransportError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", &self.client_id),
                ])
                .send()
                .await
                .map_err(|e| TransportError::Network(format!("token refresh request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                let parsed: OAuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    code: parsed.error,
                    message: parsed
                        .error_description
                        .unwrap_or_else(|| format!("token endpoint returned {status}: {body}")),
                });
            }

            response
                .json::<TokenResponse>()
                .await
                .map_err(|e| TransportError::Network(format!("invalid refresh response: {e}")))
        })
    }
}
