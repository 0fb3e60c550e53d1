//! Usage fetch against provider endpoints
//!
//! One bearer-authenticated GET per account per poll. Auth rejections
//! (401/403 or a body matching known auth-error text) escape as
//! `AuthFailure`; every other failure — unreachable host, unexpected
//! status, unparseable or unrecognized body — records an api-failure
//! cooldown for the account and yields `Ok(None)`.

use std::sync::Arc;

use common::{Clock, CooldownTracker};
use tracing::{debug, warn};

use crate::error::AuthFailure;
use crate::normalize::{normalize_oauth_usage, normalize_quota_limits};
use crate::provider::{OAUTH_BETA_HEADER, ProviderFamily, host_allowed, resolve_endpoint};
use crate::snapshot::UsageSnapshot;

/// Auth-error phrases some providers return with a 200 or generic status.
const AUTH_BODY_PATTERNS: &[&str] = &[
    "authentication_error",
    "invalid api key",
    "invalid access token",
    "token expired",
    "oauth token has been revoked",
    "unauthorized",
];

/// The account identity a fetch runs on behalf of.
#[derive(Debug, Clone)]
pub struct UsageTarget {
    pub account_id: String,
    pub account_name: String,
    pub account_email: Option<String>,
    /// Logical provider id (e.g. "claude", "zai")
    pub provider: String,
    pub base_url: String,
}

/// Per-provider usage HTTP client plus normalization.
pub struct UsageFetcher {
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    api_cooldown: Arc<CooldownTracker>,
}

impl UsageFetcher {
    pub fn new(
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
        api_cooldown: Arc<CooldownTracker>,
    ) -> Self {
        Self {
            http,
            clock,
            api_cooldown,
        }
    }

    /// Fetch and normalize usage for one account.
    ///
    /// `Ok(None)` means no data this tick (unknown provider, blocked host,
    /// fetch failure, or a body matching no known shape); a cooldown is
    /// recorded for everything except an unknown provider id, which never
    /// issues a request.
    pub async fn fetch(
        &self,
        target: &UsageTarget,
        token: &str,
    ) -> Result<Option<UsageSnapshot>, AuthFailure> {
        let Some((family, path)) = resolve_endpoint(&target.provider) else {
            debug!(
                account_id = target.account_id,
                provider = target.provider,
                "no usage endpoint for provider"
            );
            return Ok(None);
        };

        let raw_url = format!("{}{}", target.base_url.trim_end_matches('/'), path);
        let url = match reqwest::Url::parse(&raw_url) {
            Ok(url) => url,
            Err(e) => {
                warn!(account_id = target.account_id, url = raw_url, error = %e, "invalid usage URL");
                self.api_cooldown.record_failure(&target.account_id);
                return Ok(None);
            }
        };

        if !host_allowed(&url) {
            warn!(
                account_id = target.account_id,
                host = url.host_str().unwrap_or("<none>"),
                "blocked outbound request to non-allow-listed host"
            );
            self.api_cooldown.record_failure(&target.account_id);
            return Ok(None);
        }

        let mut request = self.http.get(url).bearer_auth(token);
        if family == ProviderFamily::ClaudeOAuth {
            request = request.header(OAUTH_BETA_HEADER.0, OAUTH_BETA_HEADER.1);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(account_id = target.account_id, error = %e, "usage fetch failed");
                self.api_cooldown.record_failure(&target.account_id);
                return Ok(None);
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AuthFailure {
                status: Some(status.as_u16()),
                message: truncate(&body, 200),
            });
        }

        if matches_auth_pattern(&body) {
            return Err(AuthFailure {
                status: None,
                message: truncate(&body, 200),
            });
        }

        if !status.is_success() {
            warn!(
                account_id = target.account_id,
                status = status.as_u16(),
                "usage endpoint returned error status"
            );
            self.api_cooldown.record_failure(&target.account_id);
            return Ok(None);
        }

        let parsed: serde_json::Value = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(e) => {
                warn!(account_id = target.account_id, error = %e, "usage response is not JSON");
                self.api_cooldown.record_failure(&target.account_id);
                return Ok(None);
            }
        };

        let now = self.clock.now_millis();
        let window = match family {
            ProviderFamily::ClaudeOAuth => normalize_oauth_usage(&parsed),
            ProviderFamily::QuotaLimits => normalize_quota_limits(&parsed, now),
        };

        match window {
            Some(window) => Ok(Some(UsageSnapshot::new(
                target.account_id.clone(),
                target.account_name.clone(),
                target.account_email.clone(),
                window,
                now,
            ))),
            None => {
                warn!(
                    account_id = target.account_id,
                    provider = target.provider,
                    "usage response matched no known shape"
                );
                self.api_cooldown.record_failure(&target.account_id);
                Ok(None)
            }
        }
    }
}

/// Whether a response body matches a known auth-error phrase.
pub fn matches_auth_pattern(body: &str) -> bool {
    let lower = body.to_lowercase();
    AUTH_BODY_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ManualClock;
    use std::time::Duration;

    fn fetcher() -> (Arc<CooldownTracker>, UsageFetcher) {
        let clock = Arc::new(ManualClock::new(1_754_400_000_000));
        let cooldown = Arc::new(CooldownTracker::new(
            Duration::from_secs(120),
            clock.clone(),
        ));
        let fetcher = UsageFetcher::new(reqwest::Client::new(), clock, cooldown.clone());
        (cooldown, fetcher)
    }

    fn target(provider: &str, base_url: &str) -> UsageTarget {
        UsageTarget {
            account_id: "acct-1".into(),
            account_name: "Personal".into(),
            account_email: None,
            provider: provider.into(),
            base_url: base_url.into(),
        }
    }

    #[tokio::test]
    async fn unknown_provider_yields_none_without_request_or_cooldown() {
        let (cooldown, fetcher) = fetcher();
        let result = fetcher
            .fetch(&target("openai", "https://api.anthropic.com"), "tok")
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(cooldown.is_ready("acct-1"), "no cooldown for unknown provider");
    }

    #[tokio::test]
    async fn disallowed_host_is_rejected_and_cooled_down() {
        let (cooldown, fetcher) = fetcher();
        let result = fetcher
            .fetch(&target("claude", "https://evil.example.com"), "tok")
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(!cooldown.is_ready("acct-1"), "egress rejection records cooldown");
    }

    #[tokio::test]
    async fn unparseable_base_url_is_rejected() {
        let (cooldown, fetcher) = fetcher();
        let result = fetcher.fetch(&target("claude", "not a url"), "tok").await.unwrap();
        assert!(result.is_none());
        assert!(!cooldown.is_ready("acct-1"));
    }

    #[test]
    fn auth_patterns_match_case_insensitively() {
        assert!(matches_auth_pattern(
            r#"{"type":"error","error":{"type":"authentication_error"}}"#
        ));
        assert!(matches_auth_pattern("OAuth token has been REVOKED"));
        assert!(matches_auth_pattern("Invalid API key provided"));
        assert!(!matches_auth_pattern(r#"{"five_hour":{"utilization":10}}"#));
        assert!(!matches_auth_pattern(""));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 200), "short");
        let long = "é".repeat(300);
        let cut = truncate(&long, 199);
        assert!(cut.len() <= 202); // 199 bounded down + ellipsis
        assert!(cut.ends_with('…'));
    }
}
