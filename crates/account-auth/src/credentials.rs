//! Credential model and storage
//!
//! `CredentialStore` is the interface the refresh engine and poller consume;
//! the secure store itself is an external collaborator. `FileCredentialStore`
//! is the file-backed implementation used by the daemon and tests: a JSON
//! file mapping account IDs to credentials, written atomically (temp file +
//! rename, 0600) with a tokio Mutex serializing concurrent writers.
//!
//! Credentials are mutated only by the refresh engine after a successful
//! refresh; everything else reads.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boxed future alias for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How an account authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    OAuth,
    ApiKey,
}

/// A single account's credential.
///
/// `value` holds the access token for OAuth accounts and the raw key for
/// API-key accounts. `expires_at` is a unix timestamp in milliseconds
/// (absolute, not a delta) — computed at storage time from the token
/// endpoint's `expires_in` seconds delta plus the current time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "type")]
    pub kind: CredentialKind,
    /// Access token (OAuth) or API key
    pub value: String,
    /// Refresh token for obtaining new access tokens (OAuth only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiration as unix timestamp in milliseconds (OAuth only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Account email, when the provider reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Granted OAuth scopes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Keyed credential storage consumed by the refresh engine and poller.
///
/// Uses boxed-future methods for dyn-compatibility (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    /// Get a clone of an account's credential.
    fn get<'a>(&'a self, account_id: &'a str) -> BoxFuture<'a, Option<Credential>>;

    /// Add or replace an account's credential.
    fn set<'a>(&'a self, account_id: &'a str, credential: Credential) -> BoxFuture<'a, Result<()>>;

    /// Remove an account's credential.
    fn clear<'a>(&'a self, account_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Thread-safe file-backed credential store.
///
/// The Mutex serializes all writes. Reads acquire the lock briefly to clone
/// the in-memory state, so poll-time reads don't block on refresh writes.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Credential>>,
}

impl FileCredentialStore {
    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// accounts).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let credentials: HashMap<String, Credential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), accounts = credentials.len(), "loaded credentials");
            credentials
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let store = HashMap::new();
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// List all account IDs with stored credentials.
    pub async fn account_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.keys().cloned().collect()
    }

    /// Number of stored credentials.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for FileCredentialStore {
    fn get<'a>(&'a self, account_id: &'a str) -> BoxFuture<'a, Option<Credential>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            state.get(account_id).cloned()
        })
    }

    fn set<'a>(&'a self, account_id: &'a str, credential: Credential) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(account_id.to_string(), credential);
            debug!(account_id, "stored credential");
            write_atomic(&self.path, &state).await
        })
    }

    fn clear<'a>(&'a self, account_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(account_id).is_some() {
                debug!(account_id, "cleared credential");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. This prevents corruption if the process crashes mid-write.
/// Sets file permissions to 0600 (owner read/write only) since the file
/// contains tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, Credential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    // Set 0600 permissions (unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth_credential(suffix: &str) -> Credential {
        Credential {
            kind: CredentialKind::OAuth,
            value: format!("at_{suffix}"),
            refresh_token: Some(format!("rt_{suffix}")),
            expires_at: Some(1_735_500_000_000),
            email: Some(format!("{suffix}@example.com")),
            scopes: vec!["user:inference".into()],
        }
    }

    fn apikey_credential(suffix: &str) -> Credential {
        Credential {
            kind: CredentialKind::ApiKey,
            value: format!("sk_{suffix}"),
            refresh_token: None,
            expires_at: None,
            email: None,
            scopes: vec![],
        }
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store
            .set("claude-max-1", oauth_credential("1"))
            .await
            .unwrap();

        let store2 = FileCredentialStore::load(path).await.unwrap();
        let cred = store2.get("claude-max-1").await.unwrap();
        assert_eq!(cred.value, "at_1");
        assert_eq!(cred.refresh_token.as_deref(), Some("rt_1"));
        assert_eq!(cred.kind, CredentialKind::OAuth);
        assert_eq!(cred.email.as_deref(), Some("1@example.com"));
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        assert!(!path.exists());
        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        assert!(store.is_empty().await);
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, Credential> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn apikey_credential_omits_oauth_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.set("work-key", apikey_credential("w")).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains(r#""type": "apikey""#));
        assert!(!contents.contains("refresh_token"));
        assert!(!contents.contains("expires_at"));
    }

    #[tokio::test]
    async fn set_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::load(path).await.unwrap();
        store.set("acct-1", oauth_credential("1")).await.unwrap();
        store.set("acct-2", oauth_credential("2")).await.unwrap();
        assert_eq!(store.len().await, 2);

        store.clear("acct-1").await.unwrap();
        assert_eq!(store.len().await, 1);
        assert!(store.get("acct-1").await.is_none());

        // Clearing an absent account is a no-op
        store.clear("acct-1").await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn set_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::load(path).await.unwrap();
        store.set("acct-1", oauth_credential("old")).await.unwrap();

        let mut updated = oauth_credential("new");
        updated.expires_at = Some(9_999_999_999_999);
        store.set("acct-1", updated).await.unwrap();

        let cred = store.get("acct-1").await.unwrap();
        assert_eq!(cred.value, "at_new");
        assert_eq!(cred.expires_at, Some(9_999_999_999_999));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.set("acct-1", oauth_credential("1")).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = std::sync::Arc::new(FileCredentialStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set(&format!("acct-{i}"), oauth_credential(&i.to_string()))
                    .await
                    .unwrap();
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.len().await, 10);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, Credential> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
