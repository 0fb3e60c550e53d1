//! OAuth client constants
//!
//! Public OAuth client configuration for the Claude provider family. These
//! values are not secrets — they identify the public client application.
//! The actual secrets (access/refresh tokens) live in the credential store.

/// Anthropic's public OAuth client ID (same as Claude CLI)
pub const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Token endpoint for refresh-token grants
pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// OAuth scopes carried by stored credentials.
pub const SCOPES: &str = "user:profile user:inference user:sessions:claude_code";
