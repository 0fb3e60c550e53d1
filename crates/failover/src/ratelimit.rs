//! Per-account rate-limit ledger
//!
//! The embedding client reports hard rate-limits it observes on API
//! traffic; the selector scores against the current state and the
//! lifetime count. A current limit expires on its own once `until` passes;
//! counts never reset for the life of the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::Clock;
use provider_usage::LimitType;
use tracing::info;

#[derive(Debug, Clone, Copy, Default)]
struct State {
    active_until: Option<u64>,
    limit_type: Option<LimitType>,
    total: u32,
}

/// Current and historical rate-limit state per account.
pub struct RateLimitTracker {
    clock: Arc<dyn Clock>,
    state: Mutex<HashMap<String, State>>,
}

impl RateLimitTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record a rate-limit against `account_id`, active until `until_ms`.
    pub fn record(&self, account_id: &str, limit_type: LimitType, until_ms: u64) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(account_id.to_string()).or_default();
        entry.active_until = Some(until_ms);
        entry.limit_type = Some(limit_type);
        entry.total += 1;
        info!(
            account_id,
            limit_type = limit_type.as_str(),
            until_ms,
            "rate limit recorded"
        );
    }

    /// The window currently rate-limiting `account_id`, if any.
    pub fn current(&self, account_id: &str) -> Option<LimitType> {
        let state = self.state.lock().unwrap();
        let entry = state.get(account_id)?;
        let until = entry.active_until?;
        if self.clock.now_millis() < until {
            entry.limit_type
        } else {
            None
        }
    }

    /// Lifetime count of rate-limits recorded against `account_id`.
    pub fn prior_count(&self, account_id: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state.get(account_id).map(|e| e.total).unwrap_or(0)
    }

    /// Drop the currently-active limit (keeps the count).
    pub fn clear_current(&self, account_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.get_mut(account_id) {
            entry.active_until = None;
            entry.limit_type = None;
        }
    }
}
