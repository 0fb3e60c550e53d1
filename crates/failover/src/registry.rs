//! In-flight operation registry
//!
//! Tracks work bound to an account. The selector reads the summary as a
//! load penalty; the swap coordinator rebinds operations from the old
//! account to the new one after a switch. The registry itself is owned by
//! the embedding client — `InMemoryOperationRegistry` is the
//! implementation the daemon and tests use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use account_auth::BoxFuture;
use common::Clock;
use tracing::{debug, info};

/// One piece of in-flight work bound to an account.
#[derive(Debug, Clone)]
pub struct RegisteredOperation {
    pub id: String,
    pub account_id: String,
    pub op_type: String,
    pub started_at: u64,
    pub last_activity_at: u64,
    pub session_ref: Option<String>,
}

/// Aggregate view of running operations.
#[derive(Debug, Clone, Default)]
pub struct OperationSummary {
    pub total_running: usize,
    pub by_account: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
}

/// Registry interface consumed by the selector and swap coordinator.
pub trait OperationRegistry: Send + Sync {
    fn summary(&self) -> BoxFuture<'_, OperationSummary>;

    /// Rebind every operation on `old_id` to the new account and restart
    /// it there. Returns the number of operations restarted.
    fn restart_on_account<'a>(
        &'a self,
        old_id: &'a str,
        new_id: &'a str,
        new_name: &'a str,
    ) -> BoxFuture<'a, usize>;
}

/// Process-local registry implementation.
pub struct InMemoryOperationRegistry {
    clock: Arc<dyn Clock>,
    operations: Mutex<HashMap<String, RegisteredOperation>>,
}

impl InMemoryOperationRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new operation; returns its id.
    pub fn register(
        &self,
        account_id: &str,
        op_type: &str,
        session_ref: Option<String>,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now_millis();
        let operation = RegisteredOperation {
            id: id.clone(),
            account_id: account_id.to_string(),
            op_type: op_type.to_string(),
            started_at: now,
            last_activity_at: now,
            session_ref,
        };
        self.operations.lock().unwrap().insert(id.clone(), operation);
        debug!(operation_id = id, account_id, op_type, "operation registered");
        id
    }

    /// Bump an operation's activity timestamp.
    pub fn touch(&self, operation_id: &str) {
        let now = self.clock.now_millis();
        if let Some(op) = self.operations.lock().unwrap().get_mut(operation_id) {
            op.last_activity_at = now;
        }
    }

    /// Remove a completed operation.
    pub fn complete(&self, operation_id: &str) {
        self.operations.lock().unwrap().remove(operation_id);
    }
}

impl OperationRegistry for InMemoryOperationRegistry {
    fn summary(&self) -> BoxFuture<'_, OperationSummary> {
        Box::pin(async move {
            let operations = self.operations.lock().unwrap();
            let mut summary = OperationSummary {
                total_running: operations.len(),
                ..Default::default()
            };
            for op in operations.values() {
                *summary.by_account.entry(op.account_id.clone()).or_default() += 1;
                *summary.by_type.entry(op.op_type.clone()).or_default() += 1;
            }
            summary
        })
    }

    fn restart_on_account<'a>(
        &'a self,
        old_id: &'a str,
        new_id: &'a str,
        new_name: &'a str,
    ) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let now = self.clock.now_millis();
            let mut operations = self.operations.lock().unwrap();
            let mut count = 0usize;
            for op in operations.values_mut() {
                if op.account_id == old_id {
                    op.account_id = new_id.to_string();
                    op.last_activity_at = now;
                    count += 1;
                }
            }
            if count > 0 {
                info!(
                    from = old_id,
                    to = new_id,
                    to_name = new_name,
                    count,
                    "operations rebound to new account"
                );
            }
            count
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ManualClock;

    fn registry() -> InMemoryOperationRegistry {
        InMemoryOperationRegistry::new(Arc::new(ManualClock::new(1_000_000)))
    }

    #[tokio::test]
    async fn summary_counts_by_account_and_type() {
        let registry = registry();
        registry.register("a", "session", None);
        registry.register("a", "session", Some("term-1".into()));
        registry.register("b", "export", None);

        let summary = registry.summary().await;
        assert_eq!(summary.total_running, 3);
        assert_eq!(summary.by_account.get("a"), Some(&2));
        assert_eq!(summary.by_account.get("b"), Some(&1));
        assert_eq!(summary.by_type.get("session"), Some(&2));
    }

    #[tokio::test]
    async fn restart_rebinds_only_matching_operations() {
        let registry = registry();
        registry.register("a", "session", None);
        registry.register("a", "session", None);
        registry.register("b", "session", None);

        let count = registry.restart_on_account("a", "c", "Account C").await;
        assert_eq!(count, 2);

        let summary = registry.summary().await;
        assert_eq!(summary.by_account.get("a"), None);
        assert_eq!(summary.by_account.get("c"), Some(&2));
        assert_eq!(summary.by_account.get("b"), Some(&1));
    }

    #[tokio::test]
    async fn complete_removes_operation() {
        let registry = registry();
        let id = registry.register("a", "session", None);
        registry.complete(&id);

        let summary = registry.summary().await;
        assert_eq!(summary.total_running, 0);
    }

    #[tokio::test]
    async fn touch_updates_activity() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = InMemoryOperationRegistry::new(clock.clone());
        let id = registry.register("a", "session", None);

        clock.advance(5_000);
        registry.touch(&id);

        let op = registry.operations.lock().unwrap().get(&id).cloned().unwrap();
        assert_eq!(op.started_at, 1_000_000);
        assert_eq!(op.last_activity_at, 1_005_000);
    }
}
