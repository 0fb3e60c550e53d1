//! Timer-driven usage polling and swap orchestration
//!
//! One repeating timer drives `check_and_swap`: resolve the active account,
//! obtain a usable credential, fetch usage (gated by the api-failure
//! cooldown), persist and publish the snapshot, then compare against the
//! proactive-swap thresholds. An `AuthFailure` anywhere in the cycle
//! short-circuits into the recovery state machine instead.
//!
//! Re-entrancy: a single atomic flag guarantees at most one cycle per
//! process; a tick arriving while one is in flight is a silent no-op, not
//! queued. `stop()` only cancels the timer — an in-flight cycle completes
//! and its result is still applied.
//!
//! Recovery states: Normal → AuthFailureDetected → {RefreshAttempted →
//! Recovered | RefreshFailed} → MarkedFailed → {SwapAttempted | SwapSkipped}.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use account_auth::{BoxFuture, CredentialKind, CredentialStore, TokenRefreshEngine};
use common::{Clock, CooldownTracker};
use futures_util::future::join_all;
use provider_usage::{AuthFailure, LimitType, UsageFetcher, UsageSnapshot, UsageTarget};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accounts::{AccountProfile, AccountStore, UsageWrite, resolve_active};
use crate::events::{AccountUsageEntry, AccountsUsageSummary, Event, EventBus};
use crate::notify::{Notification, NotificationBatcher};
use crate::ratelimit::RateLimitTracker;
use crate::registry::OperationRegistry;
use crate::selector::{CandidateState, ProfileSelector};
use crate::swap::SwapCoordinator;

/// Usage fetch interface the poller consumes (implemented by
/// `UsageFetcher`, substituted by fakes in tests).
pub trait UsageSource: Send + Sync {
    fn fetch<'a>(
        &'a self,
        target: &'a UsageTarget,
        token: &'a str,
    ) -> BoxFuture<'a, std::result::Result<Option<UsageSnapshot>, AuthFailure>>;
}

impl UsageSource for UsageFetcher {
    fn fetch<'a>(
        &'a self,
        target: &'a UsageTarget,
        token: &'a str,
    ) -> BoxFuture<'a, std::result::Result<Option<UsageSnapshot>, AuthFailure>> {
        Box::pin(UsageFetcher::fetch(self, target, token))
    }
}

/// Poller tuning. Defaults match the shipped behavior.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    /// Session-window percentage that triggers a proactive swap
    pub session_threshold: u8,
    /// Weekly-window percentage that triggers a proactive swap
    pub weekly_threshold: u8,
    pub proactive_swap: bool,
    /// Per-account cache TTL in the consolidated all-accounts view
    pub all_accounts_ttl: Duration,
    pub notify_window: Duration,
    pub notify_cap: usize,
    /// Consecutive auth failures that bar an account from selection
    pub max_consecutive_failures: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            session_threshold: 95,
            weekly_threshold: 99,
            proactive_swap: true,
            all_accounts_ttl: Duration::from_secs(60),
            notify_window: Duration::from_secs(2),
            notify_cap: 5,
            max_consecutive_failures: 3,
        }
    }
}

/// Constructor-injected collaborators.
pub struct PollerDeps {
    pub accounts: Arc<dyn AccountStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub refresh: Arc<TokenRefreshEngine>,
    pub usage: Arc<dyn UsageSource>,
    pub api_cooldown: Arc<CooldownTracker>,
    pub auth_cooldown: Arc<CooldownTracker>,
    pub rate_limits: Arc<RateLimitTracker>,
    pub registry: Arc<dyn OperationRegistry>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
}

struct CachedEntry {
    snapshot: UsageSnapshot,
    fetched_at: u64,
}

enum TokenOutcome {
    Token(String),
    AuthFailed,
    Unavailable,
}

/// The orchestration loop. One instance per process.
pub struct UsagePoller {
    inner: Arc<PollerInner>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct PollerInner {
    cfg: PollerConfig,
    accounts: Arc<dyn AccountStore>,
    credentials: Arc<dyn CredentialStore>,
    refresh: Arc<TokenRefreshEngine>,
    usage: Arc<dyn UsageSource>,
    api_cooldown: Arc<CooldownTracker>,
    auth_cooldown: Arc<CooldownTracker>,
    registry: Arc<dyn OperationRegistry>,
    selector: ProfileSelector,
    swap: SwapCoordinator,
    notifier: NotificationBatcher,
    events: EventBus,
    clock: Arc<dyn Clock>,
    needs_reauth: std::sync::Mutex<HashSet<String>>,
    cycle_running: AtomicBool,
    view_cache: tokio::sync::Mutex<HashMap<String, CachedEntry>>,
}

/// Resets the re-entrancy flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl UsagePoller {
    pub fn new(cfg: PollerConfig, deps: PollerDeps) -> Self {
        let selector = ProfileSelector::new(
            deps.auth_cooldown.clone(),
            deps.rate_limits.clone(),
            cfg.max_consecutive_failures,
        );
        let notifier =
            NotificationBatcher::new(deps.events.clone(), cfg.notify_window, cfg.notify_cap);
        let swap = SwapCoordinator::new(
            deps.accounts.clone(),
            deps.registry.clone(),
            deps.events.clone(),
            notifier.clone(),
            deps.clock.clone(),
        );

        Self {
            inner: Arc::new(PollerInner {
                cfg,
                accounts: deps.accounts,
                credentials: deps.credentials,
                refresh: deps.refresh,
                usage: deps.usage,
                api_cooldown: deps.api_cooldown,
                auth_cooldown: deps.auth_cooldown,
                registry: deps.registry,
                selector,
                swap,
                notifier,
                events: deps.events,
                clock: deps.clock,
                needs_reauth: std::sync::Mutex::new(HashSet::new()),
                cycle_running: AtomicBool::new(false),
                view_cache: tokio::sync::Mutex::new(HashMap::new()),
            }),
            timer: std::sync::Mutex::new(None),
        }
    }

    /// Arm the repeating timer with an immediate first check. Idempotent.
    pub fn start(&self) {
        let mut timer = self.timer.lock().unwrap();
        if timer.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let interval = inner.cfg.poll_interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                // Each cycle runs as its own task so stopping the timer
                // never cancels an in-flight cycle
                let cycle = inner.clone();
                tokio::spawn(async move {
                    cycle.check_and_swap().await;
                });
            }
        }));
        info!(interval_secs = interval.as_secs(), "usage poller started");
    }

    /// Cancel the timer. An in-flight cycle completes and its result is
    /// still applied.
    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
            info!("usage poller stopped");
        }
    }

    /// Run one poll cycle now (also what every timer tick runs).
    pub async fn check_and_swap(&self) {
        self.inner.check_and_swap().await;
    }

    /// Consolidated usage view across every account.
    pub async fn refresh_all_accounts(&self) -> AccountsUsageSummary {
        self.inner.refresh_all_accounts().await
    }
}

impl PollerInner {
    async fn check_and_swap(&self) {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("poll cycle already in flight, skipping");
            return;
        }
        let _guard = CycleGuard(&self.cycle_running);
        metrics::counter!("usage_poll_cycles_total").increment(1);

        let accounts = self.accounts.list().await;
        let Some(active) = resolve_active(&accounts).cloned() else {
            debug!("no active account to poll");
            return;
        };

        let token = match self.obtain_token(&active).await {
            TokenOutcome::Token(token) => token,
            TokenOutcome::AuthFailed => {
                // Refresh already concluded the credential is dead; don't
                // burn another call on it
                self.recover_auth_failure(&active, &accounts, false).await;
                return;
            }
            TokenOutcome::Unavailable => return,
        };

        if !self.api_cooldown.is_ready(&active.id) {
            debug!(
                account_id = active.id,
                "account in api-failure cooldown, skipping fetch"
            );
            return;
        }

        let snapshot = match self.usage.fetch(&active.usage_target(), &token).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(failure) => {
                warn!(account_id = active.id, error = %failure, "auth failure during usage fetch");
                self.recover_auth_failure(&active, &accounts, true).await;
                return;
            }
        };

        if let Err(e) = self
            .accounts
            .save_usage(&[UsageWrite {
                account_id: active.id.clone(),
                session_percent: Some(snapshot.session_percent),
                weekly_percent: Some(snapshot.weekly_percent),
            }])
            .await
        {
            warn!(account_id = active.id, error = %e, "failed to persist usage percentages");
        }

        self.view_cache.lock().await.insert(
            active.id.clone(),
            CachedEntry {
                snapshot: snapshot.clone(),
                fetched_at: self.clock.now_millis(),
            },
        );

        self.events.emit(Event::UsageUpdated(snapshot.clone()));

        if active.kind == CredentialKind::OAuth && self.cfg.proactive_swap {
            let over_session = snapshot.session_percent >= self.cfg.session_threshold;
            let over_weekly = snapshot.weekly_percent >= self.cfg.weekly_threshold;
            if over_session || over_weekly {
                let limit_type = if over_session && over_weekly {
                    snapshot.limit_type()
                } else if over_weekly {
                    LimitType::Weekly
                } else {
                    LimitType::Session
                };
                info!(
                    account_id = active.id,
                    session = snapshot.session_percent,
                    weekly = snapshot.weekly_percent,
                    limit_type = limit_type.as_str(),
                    "usage threshold exceeded, attempting proactive swap"
                );
                self.attempt_swap(&active, &accounts, Some(limit_type), "usage_threshold")
                    .await;
            }
        }
    }

    /// Resolve a usable credential for the active account.
    async fn obtain_token(&self, active: &AccountProfile) -> TokenOutcome {
        match active.kind {
            CredentialKind::ApiKey => match self.credentials.get(&active.id).await {
                Some(credential) => TokenOutcome::Token(credential.value),
                None => {
                    warn!(
                        account_id = active.id,
                        "active api-key account has no stored credential"
                    );
                    TokenOutcome::Unavailable
                }
            },
            CredentialKind::OAuth => match self.refresh.ensure_valid(&active.id).await {
                Ok(token) => {
                    if token.persistence_failed {
                        warn!(
                            account_id = active.id,
                            "refreshed token held in memory only; re-authentication needed after restart"
                        );
                    }
                    if token.was_refreshed {
                        self.clear_auth_state(&active.id);
                    }
                    TokenOutcome::Token(token.access_token)
                }
                Err(e) if e.needs_reauthentication() => {
                    warn!(
                        account_id = active.id,
                        code = e.code(),
                        "token refresh requires re-authentication"
                    );
                    self.mark_needs_reauth(&active.id);
                    TokenOutcome::AuthFailed
                }
                Err(e) => {
                    warn!(account_id = active.id, code = e.code(), error = %e, "token refresh failed");
                    self.api_cooldown.record_failure(&active.id);
                    TokenOutcome::Unavailable
                }
            },
        }
    }

    /// Auth-failure recovery: forced refresh first, then mark failed and
    /// swap away unless this account already failed within the cooldown
    /// window (swap-loop protection).
    async fn recover_auth_failure(
        &self,
        active: &AccountProfile,
        accounts: &[AccountProfile],
        try_refresh: bool,
    ) {
        metrics::counter!("auth_failures_total").increment(1);

        if active.kind != CredentialKind::OAuth {
            warn!(
                account_id = active.id,
                "auth failure on api-key account; manual intervention required"
            );
            return;
        }

        // An account flagged for re-authentication is excluded from
        // further refresh attempts until a human intervenes
        let try_refresh = try_refresh && !self.needs_reauth.lock().unwrap().contains(&active.id);
        if try_refresh {
            match self.refresh.force_refresh(&active.id).await {
                Ok(_) => {
                    info!(
                        account_id = active.id,
                        "forced refresh recovered the account"
                    );
                    // Next tick retries with the fresh token
                    self.clear_auth_state(&active.id);
                    return;
                }
                Err(e) => {
                    warn!(
                        account_id = active.id,
                        code = e.code(),
                        "forced refresh failed"
                    );
                    if e.needs_reauthentication() {
                        self.mark_needs_reauth(&active.id);
                    }
                }
            }
        }

        self.auth_cooldown.prune_expired();
        let already_failed = !self.auth_cooldown.is_ready(&active.id);
        self.auth_cooldown.record_failure(&active.id);
        if already_failed {
            debug!(
                account_id = active.id,
                "auth failure within existing cooldown, skipping swap attempt"
            );
            return;
        }

        if self.cfg.proactive_swap {
            self.attempt_swap(active, accounts, None, "auth_failure").await;
        }
    }

    async fn attempt_swap(
        &self,
        active: &AccountProfile,
        accounts: &[AccountProfile],
        limit_type: Option<LimitType>,
        reason: &str,
    ) {
        let candidates = self.candidate_states(accounts).await;
        match self.selector.select_best(&candidates, Some(&active.id)) {
            Some(best) => {
                let target = best.profile.clone();
                if let Err(e) = self.swap.swap(active, &target, limit_type).await {
                    warn!(from = active.id, to = target.id, error = %e, "swap execution failed");
                    metrics::counter!("failover_swap_failures_total").increment(1);
                    self.events.emit(Event::SwapFailed {
                        reason: e.to_string(),
                        current_account: active.id.clone(),
                        excluded_accounts: Vec::new(),
                    });
                }
            }
            None => {
                let excluded = self.auth_cooldown.active_keys();
                warn!(
                    account_id = active.id,
                    reason, "no healthy alternative account available"
                );
                metrics::counter!("failover_swap_failures_total").increment(1);
                self.events.emit(Event::SwapFailed {
                    reason: format!("no_available_accounts ({reason})"),
                    current_account: active.id.clone(),
                    excluded_accounts: excluded,
                });
                self.notifier.enqueue(Notification::Blocked {
                    reason: "no_available_accounts".into(),
                    operation_id: None,
                });
            }
        }
    }

    async fn candidate_states(&self, accounts: &[AccountProfile]) -> Vec<CandidateState> {
        let summary = self.registry.summary().await;
        let needs_reauth = self.needs_reauth.lock().unwrap().clone();
        let mut candidates = Vec::with_capacity(accounts.len());
        for profile in accounts {
            let has_credential = self.credentials.get(&profile.id).await.is_some();
            candidates.push(CandidateState {
                has_credential,
                needs_reauth: needs_reauth.contains(&profile.id),
                in_flight_ops: summary.by_account.get(&profile.id).copied().unwrap_or(0),
                profile: profile.clone(),
            });
        }
        candidates
    }

    /// Consolidated view across all accounts: every inactive account is
    /// fetched fully in parallel (each with its own proactive refresh),
    /// cached with a short TTL, and all percentage updates merge into a
    /// single batched persistence write.
    async fn refresh_all_accounts(&self) -> AccountsUsageSummary {
        let accounts = self.accounts.list().await;
        let active_id = resolve_active(&accounts).map(|a| a.id.clone());
        let now = self.clock.now_millis();
        let ttl = self.cfg.all_accounts_ttl.as_millis() as u64;

        let mut to_fetch: Vec<AccountProfile> = Vec::new();
        {
            let cache = self.view_cache.lock().await;
            for account in &accounts {
                // The active account's data comes from the regular poll
                if Some(&account.id) == active_id.as_ref() {
                    continue;
                }
                let fresh = cache
                    .get(&account.id)
                    .map(|e| now.saturating_sub(e.fetched_at) < ttl)
                    .unwrap_or(false);
                if !fresh {
                    to_fetch.push(account.clone());
                }
            }
        }

        let results = join_all(to_fetch.iter().map(|account| self.fetch_for_view(account))).await;

        let mut batch = Vec::new();
        {
            let mut cache = self.view_cache.lock().await;
            for (account, snapshot) in to_fetch.iter().zip(results) {
                if let Some(snapshot) = snapshot {
                    batch.push(UsageWrite {
                        account_id: account.id.clone(),
                        session_percent: Some(snapshot.session_percent),
                        weekly_percent: Some(snapshot.weekly_percent),
                    });
                    cache.insert(
                        account.id.clone(),
                        CachedEntry {
                            snapshot,
                            fetched_at: now,
                        },
                    );
                }
            }
        }
        if !batch.is_empty() {
            if let Err(e) = self.accounts.save_usage(&batch).await {
                warn!(error = %e, "failed to persist consolidated usage");
            }
        }

        // Re-read so availability scores see the percentages just saved
        let accounts = self.accounts.list().await;
        let candidates = self.candidate_states(&accounts).await;
        let cache = self.view_cache.lock().await;
        let entries = candidates
            .iter()
            .map(|candidate| AccountUsageEntry {
                availability: self.selector.availability(candidate),
                snapshot: cache
                    .get(&candidate.profile.id)
                    .map(|e| e.snapshot.clone()),
            })
            .collect();
        drop(cache);

        let summary = AccountsUsageSummary {
            accounts: entries,
            generated_at: now,
        };
        self.events
            .emit(Event::AllAccountsUsageUpdated(summary.clone()));
        summary
    }

    /// One account's fetch in the consolidated view. Failures here never
    /// trigger recovery — the view is read-only and best-effort.
    async fn fetch_for_view(&self, account: &AccountProfile) -> Option<UsageSnapshot> {
        if !self.api_cooldown.is_ready(&account.id) {
            return None;
        }
        let token = match account.kind {
            CredentialKind::ApiKey => self.credentials.get(&account.id).await?.value,
            CredentialKind::OAuth => match self.refresh.ensure_valid(&account.id).await {
                Ok(token) => token.access_token,
                Err(e) => {
                    debug!(
                        account_id = account.id,
                        code = e.code(),
                        "skipping account in consolidated view"
                    );
                    if e.needs_reauthentication() {
                        self.mark_needs_reauth(&account.id);
                    }
                    return None;
                }
            },
        };
        match self.usage.fetch(&account.usage_target(), &token).await {
            Ok(snapshot) => snapshot,
            Err(failure) => {
                warn!(account_id = account.id, error = %failure, "auth failure in consolidated view");
                None
            }
        }
    }

    fn mark_needs_reauth(&self, account_id: &str) {
        self.needs_reauth
            .lock()
            .unwrap()
            .insert(account_id.to_string());
    }

    fn clear_auth_state(&self, account_id: &str) {
        self.auth_cooldown.clear(account_id);
        self.needs_reauth.lock().unwrap().remove(account_id);
    }
}
