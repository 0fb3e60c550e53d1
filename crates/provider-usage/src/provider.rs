//! Provider endpoint resolution and egress control
//!
//! Maps a logical provider id to the fixed usage path on that account's
//! base URL. The Claude OAuth family has its own usage endpoint (and
//! requires the oauth beta header); the remaining providers share a
//! quota/limit endpoint. Unknown provider ids resolve to nothing and no
//! request is made.
//!
//! Before any outbound call the resolved hostname must appear on the
//! allow-list of known provider hosts. This is a deliberate egress
//! control: a misconfigured base URL must not leak bearer tokens to an
//! arbitrary host.

/// Known provider hosts. Subdomains of an entry are allowed.
pub const ALLOWED_HOSTS: &[&str] = &[
    "api.anthropic.com",
    "console.anthropic.com",
    "claude.ai",
    "api.z.ai",
    "open.bigmodel.cn",
];

/// Usage path for the Claude OAuth provider family.
pub const OAUTH_USAGE_PATH: &str = "/api/oauth/usage";

/// Shared quota/limit path for the remaining provider family.
pub const QUOTA_LIMIT_PATH: &str = "/api/monitor/usage/quota/limit";

/// Extra header required on the OAuth usage endpoint.
pub const OAUTH_BETA_HEADER: (&str, &str) = ("anthropic-beta", "oauth-2025-04-20");

/// Which response shape a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    /// Nested five-hour/seven-day windows (or the legacy flat shape)
    ClaudeOAuth,
    /// `limits[]` array with token-quota and time-quota items
    QuotaLimits,
}

/// Resolve a logical provider id to its family and usage path suffix.
pub fn resolve_endpoint(provider_id: &str) -> Option<(ProviderFamily, &'static str)> {
    match provider_id {
        "claude" | "anthropic" => Some((ProviderFamily::ClaudeOAuth, OAUTH_USAGE_PATH)),
        "zai" | "glm" | "bigmodel" => Some((ProviderFamily::QuotaLimits, QUOTA_LIMIT_PATH)),
        _ => None,
    }
}

/// Whether a resolved URL's host is on the provider allow-list.
pub fn host_allowed(url: &reqwest::Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    ALLOWED_HOSTS
        .iter()
        .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_family_resolves_to_oauth_usage_path() {
        let (family, path) = resolve_endpoint("claude").unwrap();
        assert_eq!(family, ProviderFamily::ClaudeOAuth);
        assert_eq!(path, "/api/oauth/usage");

        let (family, _) = resolve_endpoint("anthropic").unwrap();
        assert_eq!(family, ProviderFamily::ClaudeOAuth);
    }

    #[test]
    fn quota_family_shares_limit_path() {
        for id in ["zai", "glm", "bigmodel"] {
            let (family, path) = resolve_endpoint(id).unwrap();
            assert_eq!(family, ProviderFamily::QuotaLimits, "provider {id}");
            assert_eq!(path, "/api/monitor/usage/quota/limit");
        }
    }

    #[test]
    fn unknown_provider_resolves_to_none() {
        assert!(resolve_endpoint("openai").is_none());
        assert!(resolve_endpoint("").is_none());
    }

    #[test]
    fn allow_list_accepts_known_hosts_and_subdomains() {
        let ok = [
            "https://api.anthropic.com/api/oauth/usage",
            "https://open.bigmodel.cn/api/monitor/usage/quota/limit",
            "https://usage.api.z.ai/api/monitor/usage/quota/limit",
        ];
        for url in ok {
            assert!(host_allowed(&reqwest::Url::parse(url).unwrap()), "{url}");
        }
    }

    #[test]
    fn allow_list_rejects_unknown_and_lookalike_hosts() {
        let bad = [
            "https://evil.example.com/api/oauth/usage",
            "https://api.anthropic.com.evil.example/api/oauth/usage",
            "https://notclaude.ai/api/oauth/usage",
        ];
        for url in bad {
            assert!(!host_allowed(&reqwest::Url::parse(url).unwrap()), "{url}");
        }
    }
}
