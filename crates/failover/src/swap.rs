//! Account swap execution
//!
//! A swap makes the target account active, drops the old account's cached
//! usage, rebinds in-flight operations onto the new account, and emits the
//! completion events. The swap notice itself goes through the notification
//! batcher; the operations-restarted event is diagnostic and emits
//! directly.

use std::sync::Arc;

use common::Clock;
use provider_usage::LimitType;
use tracing::{info, warn};

use crate::accounts::{AccountProfile, AccountStore};
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::notify::{Notification, NotificationBatcher};
use crate::registry::OperationRegistry;

/// Executes account switches and their side effects.
pub struct SwapCoordinator {
    accounts: Arc<dyn AccountStore>,
    registry: Arc<dyn OperationRegistry>,
    events: EventBus,
    notifier: NotificationBatcher,
    clock: Arc<dyn Clock>,
}

impl SwapCoordinator {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        registry: Arc<dyn OperationRegistry>,
        events: EventBus,
        notifier: NotificationBatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            registry,
            events,
            notifier,
            clock,
        }
    }

    /// Switch the active account from `from` to `to`.
    ///
    /// `limit_type` names the window that drove a proactive swap; reactive
    /// (auth-failure) swaps pass `None`.
    pub async fn swap(
        &self,
        from: &AccountProfile,
        to: &AccountProfile,
        limit_type: Option<LimitType>,
    ) -> Result<()> {
        self.accounts.set_active(&to.id).await?;

        // The old account's cached percentages are stale the moment it
        // stops being polled
        if let Err(e) = self.accounts.clear_usage(&from.id).await {
            warn!(account_id = from.id, error = %e, "failed to clear cached usage");
        }

        let count = self.registry.restart_on_account(&from.id, &to.id, &to.name).await;
        self.events.emit(Event::OperationsRestarted {
            from: from.id.clone(),
            to: to.id.clone(),
            count,
        });

        self.notifier.enqueue(Notification::Swap {
            from: from.id.clone(),
            to: to.id.clone(),
            limit_type,
            timestamp: self.clock.now_millis(),
        });

        metrics::counter!("failover_swaps_total").increment(1);
        info!(
            from = from.id,
            to = to.id,
            limit_type = limit_type.map(|l| l.as_str()).unwrap_or("none"),
            operations_restarted = count,
            "account swap completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::FileAccountStore;
    use crate::registry::InMemoryOperationRegistry;
    use account_auth::CredentialKind;
    use common::ManualClock;
    use std::time::Duration;

    fn profile(id: &str, active: bool) -> AccountProfile {
        AccountProfile {
            id: id.into(),
            name: format!("Account {id}"),
            email: None,
            provider: "claude".into(),
            base_url: "https://api.anthropic.com".into(),
            kind: CredentialKind::OAuth,
            priority: None,
            active,
            session_percent: Some(96),
            weekly_percent: Some(50),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn swap_flips_active_clears_usage_and_restarts_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            FileAccountStore::load(dir.path().join("accounts.json"))
                .await
                .unwrap(),
        );
        store.upsert(profile("a", true)).await.unwrap();
        store.upsert(profile("b", false)).await.unwrap();

        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let registry = Arc::new(InMemoryOperationRegistry::new(clock.clone()));
        registry.register("a", "session", None);
        registry.register("a", "session", None);

        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let notifier = NotificationBatcher::new(bus.clone(), Duration::from_secs(2), 5);
        let coordinator =
            SwapCoordinator::new(store.clone(), registry, bus, notifier, clock);

        let from = profile("a", true);
        let to = profile("b", false);
        coordinator
            .swap(&from, &to, Some(LimitType::Session))
            .await
            .unwrap();

        let accounts = store.list().await;
        let a = accounts.iter().find(|x| x.id == "a").unwrap();
        let b = accounts.iter().find(|x| x.id == "b").unwrap();
        assert!(!a.active);
        assert!(b.active);
        assert_eq!(a.session_percent, None, "old usage cache must be cleared");

        match rx.recv().await.unwrap() {
            Event::OperationsRestarted { from, to, count } => {
                assert_eq!(from, "a");
                assert_eq!(to, "b");
                assert_eq!(count, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The swap notice arrives after the batch window
        match rx.recv().await.unwrap() {
            Event::SwapCompleted {
                from,
                to,
                limit_type,
                timestamp,
            } => {
                assert_eq!(from, "a");
                assert_eq!(to, "b");
                assert_eq!(limit_type, Some(LimitType::Session));
                assert_eq!(timestamp, 1_700_000_000_000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn swap_to_unknown_account_errors_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            FileAccountStore::load(dir.path().join("accounts.json"))
                .await
                .unwrap(),
        );
        store.upsert(profile("a", true)).await.unwrap();

        let clock = Arc::new(ManualClock::new(0));
        let registry = Arc::new(InMemoryOperationRegistry::new(clock.clone()));
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let notifier = NotificationBatcher::new(bus.clone(), Duration::from_secs(2), 5);
        let coordinator =
            SwapCoordinator::new(store.clone(), registry, bus, notifier, clock);

        let from = profile("a", true);
        let to = profile("ghost", false);
        assert!(coordinator.swap(&from, &to, None).await.is_err());

        let accounts = store.list().await;
        assert!(accounts.iter().find(|x| x.id == "a").unwrap().active);
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }
}
