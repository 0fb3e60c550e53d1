//! Account profiles and storage
//!
//! `AccountStore` is the interface onto the account storage owned by the
//! embedding client; the failover engine reads profiles from it, flips the
//! active flag on swap, and writes back cached usage percentages.
//! `FileAccountStore` is the file-backed implementation used by the daemon
//! and tests.
//!
//! `save_usage` takes a whole batch in one call: the consolidated view
//! fans out fetches in parallel and merges every percentage update into a
//! single write, so concurrent fetches cannot interleave torn writes.

use std::path::{Path, PathBuf};

use account_auth::{BoxFuture, CredentialKind};
use provider_usage::UsageTarget;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One account as the failover engine sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Logical provider id (e.g. "claude", "zai")
    pub provider: String,
    pub base_url: String,
    pub kind: CredentialKind,
    /// Explicit failover priority; lower wins ties. Absent means
    /// kind-based tie-breaking (OAuth before API-key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default)]
    pub active: bool,
    /// Cached short-window utilization from the last poll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_percent: Option<u8>,
    /// Cached long-window utilization from the last poll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_percent: Option<u8>,
}

impl AccountProfile {
    pub fn usage_target(&self) -> UsageTarget {
        UsageTarget {
            account_id: self.id.clone(),
            account_name: self.name.clone(),
            account_email: self.email.clone(),
            provider: self.provider.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

/// One account's cached percentages, written back after a poll.
#[derive(Debug, Clone)]
pub struct UsageWrite {
    pub account_id: String,
    pub session_percent: Option<u8>,
    pub weekly_percent: Option<u8>,
}

/// Resolve the account the poller should run on.
///
/// An active API-key account outranks an active OAuth account.
pub fn resolve_active(accounts: &[AccountProfile]) -> Option<&AccountProfile> {
    accounts
        .iter()
        .find(|a| a.active && a.kind == CredentialKind::ApiKey)
        .or_else(|| {
            accounts
                .iter()
                .find(|a| a.active && a.kind == CredentialKind::OAuth)
        })
}

/// Account storage consumed by the poller and swap coordinator.
pub trait AccountStore: Send + Sync {
    fn list(&self) -> BoxFuture<'_, Vec<AccountProfile>>;

    /// Make `account_id` the sole active account.
    fn set_active<'a>(&'a self, account_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Persist cached usage percentages for a batch of accounts in one write.
    fn save_usage<'a>(&'a self, batch: &'a [UsageWrite]) -> BoxFuture<'a, Result<()>>;

    /// Drop an account's cached percentages.
    fn clear_usage<'a>(&'a self, account_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// File-backed account store (JSON array, atomic temp-file + rename).
pub struct FileAccountStore {
    path: PathBuf,
    state: Mutex<Vec<AccountProfile>>,
}

impl FileAccountStore {
    /// Load accounts from the given file path; missing file means no
    /// accounts yet.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading account file: {e}")))?;
            let accounts: Vec<AccountProfile> = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing account file: {e}")))?;
            info!(path = %path.display(), accounts = accounts.len(), "loaded accounts");
            accounts
        } else {
            info!(path = %path.display(), "account file not found, starting empty");
            let accounts = Vec::new();
            write_atomic(&path, &accounts).await?;
            accounts
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Add or replace a profile and persist.
    pub async fn upsert(&self, profile: AccountProfile) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.iter_mut().find(|a| a.id == profile.id) {
            Some(existing) => *existing = profile,
            None => state.push(profile),
        }
        write_atomic(&self.path, &state).await
    }
}

impl AccountStore for FileAccountStore {
    fn list(&self) -> BoxFuture<'_, Vec<AccountProfile>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn set_active<'a>(&'a self, account_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.iter().any(|a| a.id == account_id) {
                return Err(Error::NotFound(account_id.to_string()));
            }
            for account in state.iter_mut() {
                account.active = account.id == account_id;
            }
            debug!(account_id, "active account changed");
            write_atomic(&self.path, &state).await
        })
    }

    fn save_usage<'a>(&'a self, batch: &'a [UsageWrite]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if batch.is_empty() {
                return Ok(());
            }
            let mut state = self.state.lock().await;
            for write in batch {
                if let Some(account) = state.iter_mut().find(|a| a.id == write.account_id) {
                    account.session_percent = write.session_percent;
                    account.weekly_percent = write.weekly_percent;
                }
            }
            debug!(updates = batch.len(), "persisted usage percentages");
            write_atomic(&self.path, &state).await
        })
    }

    fn clear_usage<'a>(&'a self, account_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(account) = state.iter_mut().find(|a| a.id == account_id) {
                account.session_percent = None;
                account.weekly_percent = None;
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

/// Write accounts atomically (temp file + rename).
async fn write_atomic(path: &Path, data: &[AccountProfile]) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Store(format!("serializing accounts: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Store("account path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp account file: {e}")))?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp account file: {e}")))?;

    Ok(())
}
