//! Typed event fan-out
//!
//! Consumers (the UI layer, the daemon's event logger) subscribe to a
//! broadcast channel of typed events. Dropping the receiver is the
//! unsubscribe — deterministic and idempotent. Emitting never blocks and
//! never fails: with no subscribers the event is simply dropped.

use provider_usage::{LimitType, UsageSnapshot};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::selector::AccountAvailability;

/// One account's entry in the consolidated view.
#[derive(Debug, Clone, Serialize)]
pub struct AccountUsageEntry {
    pub availability: AccountAvailability,
    pub snapshot: Option<UsageSnapshot>,
}

/// Consolidated usage across every account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountsUsageSummary {
    pub accounts: Vec<AccountUsageEntry>,
    pub generated_at: u64,
}

/// Events emitted by the failover engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    UsageUpdated(UsageSnapshot),
    AllAccountsUsageUpdated(AccountsUsageSummary),
    SwapCompleted {
        from: String,
        to: String,
        /// The window that drove a proactive swap; absent for reactive
        /// (auth-failure) swaps.
        limit_type: Option<LimitType>,
        timestamp: u64,
    },
    SwapFailed {
        reason: String,
        current_account: String,
        excluded_accounts: Vec<String>,
    },
    OperationsRestarted {
        from: String,
        to: String,
        count: usize,
    },
    QueueBlocked {
        reason: String,
        operation_id: Option<String>,
    },
}

/// Broadcast-backed publish/subscribe bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all subsequent events. Drop the receiver to
    /// unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: Event) {
        trace!(?event, "event emitted");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
