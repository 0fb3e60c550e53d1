//! Failover candidate scoring and selection
//!
//! Every poll recomputes an availability score per account; the selector
//! ranks the healthy alternatives when a swap is needed. Exclusion is
//! strict — an account in auth cooldown or over the consecutive-failure
//! ceiling is never a swap target no matter its score.

use std::sync::Arc;

use account_auth::CredentialKind;
use common::CooldownTracker;
use provider_usage::LimitType;
use serde::Serialize;

use crate::accounts::AccountProfile;
use crate::ratelimit::RateLimitTracker;

/// Ephemeral per-account health, recomputed every poll. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct AccountAvailability {
    pub account_id: String,
    pub account_name: String,
    pub is_authenticated: bool,
    pub is_rate_limited: bool,
    pub rate_limit_type: Option<LimitType>,
    pub availability_score: f64,
    pub needs_reauthentication: bool,
}

/// Selector input for one account, assembled by the poller.
#[derive(Debug, Clone)]
pub struct CandidateState {
    pub profile: AccountProfile,
    pub has_credential: bool,
    pub needs_reauth: bool,
    /// Operations currently bound to this account
    pub in_flight_ops: usize,
}

impl CandidateState {
    fn is_authenticated(&self) -> bool {
        self.has_credential && !self.needs_reauth
    }
}

/// Scores and ranks alternative accounts for failover.
pub struct ProfileSelector {
    auth_cooldown: Arc<CooldownTracker>,
    rate_limits: Arc<RateLimitTracker>,
    max_consecutive_failures: u32,
}

impl ProfileSelector {
    pub fn new(
        auth_cooldown: Arc<CooldownTracker>,
        rate_limits: Arc<RateLimitTracker>,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            auth_cooldown,
            rate_limits,
            max_consecutive_failures,
        }
    }

    /// Availability score: base 100, heavy penalties for rate-limit and
    /// auth problems, light pressure from usage, current load, and
    /// rate-limit history.
    pub fn score(&self, candidate: &CandidateState) -> f64 {
        let id = &candidate.profile.id;
        let mut score = 100.0;

        match self.rate_limits.current(id) {
            Some(LimitType::Session) => score -= 500.0,
            Some(LimitType::Weekly) => score -= 1000.0,
            None => {}
        }
        if !candidate.is_authenticated() {
            score -= 500.0;
        }
        score -= 0.5 * f64::from(candidate.profile.weekly_percent.unwrap_or(0));
        score -= 0.2 * f64::from(candidate.profile.session_percent.unwrap_or(0));
        score -= 15.0 * candidate.in_flight_ops as f64;
        score -= 5.0 * f64::from(self.rate_limits.prior_count(id));

        score
    }

    /// Availability view for one account (computed even for accounts the
    /// selection below would exclude).
    pub fn availability(&self, candidate: &CandidateState) -> AccountAvailability {
        let rate_limit_type = self.rate_limits.current(&candidate.profile.id);
        AccountAvailability {
            account_id: candidate.profile.id.clone(),
            account_name: candidate.profile.name.clone(),
            is_authenticated: candidate.is_authenticated(),
            is_rate_limited: rate_limit_type.is_some(),
            rate_limit_type,
            availability_score: self.score(candidate),
            needs_reauthentication: candidate.needs_reauth,
        }
    }

    /// Pick the best healthy alternative, or `None` when every account is
    /// excluded. Callers must not retry synchronously — the next poll tick
    /// retries naturally.
    pub fn select_best<'a>(
        &self,
        candidates: &'a [CandidateState],
        exclude_id: Option<&str>,
    ) -> Option<&'a CandidateState> {
        let mut best: Option<(&CandidateState, f64)> = None;

        for candidate in candidates {
            let id = &candidate.profile.id;
            if Some(id.as_str()) == exclude_id {
                continue;
            }
            if !candidate.is_authenticated() {
                continue;
            }
            if self.rate_limits.current(id).is_some() {
                continue;
            }
            if !self.auth_cooldown.is_ready(id) {
                continue;
            }
            if self.auth_cooldown.failure_count(id) >= self.max_consecutive_failures {
                continue;
            }

            let score = self.score(candidate);
            best = match best {
                None => Some((candidate, score)),
                Some((incumbent, incumbent_score)) => {
                    if score > incumbent_score
                        || (score == incumbent_score && wins_tie(candidate, incumbent))
                    {
                        Some((candidate, score))
                    } else {
                        Some((incumbent, incumbent_score))
                    }
                }
            };
        }

        best.map(|(candidate, _)| candidate)
    }
}

/// Tie-break: configured priority (lower wins) when present, else OAuth
/// accounts before API-key accounts.
fn wins_tie(challenger: &CandidateState, incumbent: &CandidateState) -> bool {
    match (challenger.profile.priority, incumbent.profile.priority) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => {
            challenger.profile.kind == CredentialKind::OAuth
                && incumbent.profile.kind == CredentialKind::ApiKey
        }
    }
}
