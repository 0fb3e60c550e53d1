//! Per-key failure cooldown windows
//!
//! One parameterized tracker backs every suppression window in the
//! workspace: API-failure cooldowns gate usage fetches, auth-failure
//! cooldowns provide swap-loop protection. An entry logically expires once
//! `now - last_failure >= window` (inclusive boundary); `is_ready` observes
//! expiry without mutating, `prune_expired` drops expired entries and
//! their counts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_failure_ms: u64,
    count: u32,
}

/// Timestamped per-key suppression windows with failure counts.
pub struct CooldownTracker {
    window: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl CooldownTracker {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` now. Increments the consecutive count.
    pub fn record_failure(&self, key: &str) {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            last_failure_ms: now,
            count: 0,
        });
        entry.last_failure_ms = now;
        entry.count += 1;
    }

    /// Whether `key` is outside its cooldown window.
    ///
    /// True when no failure is recorded, or once the window has fully
    /// elapsed (boundary inclusive).
    pub fn is_ready(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            None => true,
            Some(entry) => {
                let elapsed = self.clock.now_millis().saturating_sub(entry.last_failure_ms);
                elapsed >= self.window.as_millis() as u64
            }
        }
    }

    /// Consecutive failures recorded for `key` (0 when unknown).
    pub fn failure_count(&self, key: &str) -> u32 {
        let entries = self.entries.lock().unwrap();
        entries.get(key).map(|e| e.count).unwrap_or(0)
    }

    /// Forget `key` entirely (successful recovery).
    pub fn clear(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Drop every entry whose window has elapsed.
    pub fn prune_expired(&self) {
        let now = self.clock.now_millis();
        let window = self.window.as_millis() as u64;
        self.entries
            .lock()
            .unwrap()
            .retain(|_, e| now.saturating_sub(e.last_failure_ms) < window);
    }

    /// Keys currently inside their cooldown window.
    pub fn active_keys(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        let window = self.window.as_millis() as u64;
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_failure_ms) < window)
            .map(|(k, _)| k.clone())
            .collect()
    }
}
