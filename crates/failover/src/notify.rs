//! Swap/blocked notification batching
//!
//! Rapid cascading failures can produce a burst of swap and blocked
//! events; forwarding each one would churn the UI. Notices are queued and
//! flushed together once a window elapses (default 2s) or the queue hits a
//! cap (default 5). Swap notices flush in arrival order; only the most
//! recent blocked notice in a window survives — earlier ones are
//! superseded, not duplicated.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use provider_usage::LimitType;
use tracing::debug;

use crate::events::{Event, EventBus};

/// A notice queued for batched delivery.
#[derive(Debug, Clone)]
pub enum Notification {
    Swap {
        from: String,
        to: String,
        limit_type: Option<LimitType>,
        timestamp: u64,
    },
    Blocked {
        reason: String,
        operation_id: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct SwapNotice {
    from: String,
    to: String,
    limit_type: Option<LimitType>,
    timestamp: u64,
}

#[derive(Debug, Clone)]
struct BlockedNotice {
    reason: String,
    operation_id: Option<String>,
}

#[derive(Default)]
struct BatchState {
    swaps: Vec<SwapNotice>,
    blocked: Option<BlockedNotice>,
    flush_armed: bool,
}

impl BatchState {
    fn queued(&self) -> usize {
        self.swaps.len() + usize::from(self.blocked.is_some())
    }

    fn take(&mut self) -> (Vec<SwapNotice>, Option<BlockedNotice>) {
        self.flush_armed = false;
        (std::mem::take(&mut self.swaps), self.blocked.take())
    }
}

/// Coalesces swap/blocked notices to bound UI update frequency.
#[derive(Clone)]
pub struct NotificationBatcher {
    inner: Arc<Inner>,
}

struct Inner {
    events: EventBus,
    window: Duration,
    cap: usize,
    state: Mutex<BatchState>,
}

impl NotificationBatcher {
    pub fn new(events: EventBus, window: Duration, cap: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                events,
                window,
                cap,
                state: Mutex::new(BatchState::default()),
            }),
        }
    }

    /// Queue a notice. Flushes immediately at the cap, otherwise arms the
    /// flush timer if not already armed.
    pub fn enqueue(&self, notification: Notification) {
        let mut flush_now = None;
        let mut arm_timer = false;
        {
            let mut state = self.inner.state.lock().unwrap();
            match notification {
                Notification::Swap {
                    from,
                    to,
                    limit_type,
                    timestamp,
                } => state.swaps.push(SwapNotice {
                    from,
                    to,
                    limit_type,
                    timestamp,
                }),
                Notification::Blocked {
                    reason,
                    operation_id,
                } => {
                    // Latest blocked notice supersedes earlier ones
                    state.blocked = Some(BlockedNotice {
                        reason,
                        operation_id,
                    });
                }
            }

            if state.queued() >= self.inner.cap {
                flush_now = Some(state.take());
            } else if !state.flush_armed {
                state.flush_armed = true;
                arm_timer = true;
            }
        }

        if let Some((swaps, blocked)) = flush_now {
            debug!("notification cap reached, flushing");
            self.emit(swaps, blocked);
        }
        if arm_timer {
            let batcher = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(batcher.inner.window).await;
                batcher.flush();
            });
        }
    }

    /// Flush whatever is queued right now.
    pub fn flush(&self) {
        let (swaps, blocked) = self.inner.state.lock().unwrap().take();
        self.emit(swaps, blocked);
    }

    fn emit(&self, swaps: Vec<SwapNotice>, blocked: Option<BlockedNotice>) {
        for swap in swaps {
            self.inner.events.emit(Event::SwapCompleted {
                from: swap.from,
                to: swap.to,
                limit_type: swap.limit_type,
                timestamp: swap.timestamp,
            });
        }
        if let Some(blocked) = blocked {
            self.inner.events.emit(Event::QueueBlocked {
                reason: blocked.reason,
                operation_id: blocked.operation_id,
            });
        }
    }
}
