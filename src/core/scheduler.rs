use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::key_store::{now_millis, KeyStore};

#[derive(Debug, Clone)]
pub enum ScheduledActionKind {
    SuspendKey,
    RevokeKey,
    AddCredits(u64),
}

/// A future-dated action on a key, queued by an admin and executed by
/// the scheduler's tick once due — e.g. "suspend this trial key in 24h".
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub key_full: String,
    pub at: i64,
    pub kind: ScheduledActionKind,
}

/// Holds admin-scheduled future actions until their `at` time arrives.
pub struct ActionQueue {
    pending: Mutex<Vec<ScheduledAction>>,
}

impl ActionQueue {
    pub fn new() -> Self {
        ActionQueue {
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn schedule(&self, action: ScheduledAction) {
        self.pending.lock().push(action);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Executes every action whose `at` has passed, against `key_store`.
    /// Returns the number of actions executed.
    pub async fn execute_due(&self, key_store: &KeyStore, now: i64) -> usize {
        let due: Vec<ScheduledAction> = {
            let mut pending = self.pending.lock();
            let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending).into_iter().partition(|a| a.at <= now);
            *pending = rest;
            due
        };

        for action in &due {
            let Some(handle) = key_store.resolve(&action.key_full) else {
                continue;
            };
            let mut rec = handle.lock().await;
            match &action.kind {
                ScheduledActionKind::SuspendKey => {
                    rec.suspended = true;
                    tracing::info!(key = %action.key_full, "scheduler: scheduled suspend executed");
                }
                ScheduledActionKind::RevokeKey => {
                    rec.active = false;
                    tracing::info!(key = %action.key_full, "scheduler: scheduled revoke executed");
                }
                ScheduledActionKind::AddCredits(n) => {
                    rec.credits += *n as i64;
                    tracing::info!(key = %action.key_full, credits = n, "scheduler: scheduled credit grant executed");
                }
            }
        }

        due.len()
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The background ticker: one periodic loop driving scheduled-action
/// execution, webhook/OTLP flush, and any other per-tick housekeeping the
/// caller wires in via `on_tick`. A single ticker is sufficient as long as
/// the period stays at or under a second — see DESIGN.md for the open
/// question this resolves.
pub struct Scheduler {
    tick: Duration,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Scheduler {
            tick,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Runs until `shutdown` is notified, invoking `on_tick` with the
    /// current epoch millis on every tick.
    pub async fn run<F, Fut>(&self, mut on_tick: F)
    where
        F: FnMut(i64) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    on_tick(now_millis()).await;
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key_store::KeyRecord;

    #[tokio::test]
    async fn due_action_suspends_key() {
        let store = KeyStore::new();
        store.create_key("k1".into(), KeyRecord::new("alice"));
        let queue = ActionQueue::new();
        queue.schedule(ScheduledAction {
            key_full: "k1".into(),
            at: 1000,
            kind: ScheduledActionKind::SuspendKey,
        });

        let executed = queue.execute_due(&store, 500).await;
        assert_eq!(executed, 0);
        assert_eq!(queue.pending_count(), 1);

        let executed = queue.execute_due(&store, 1500).await;
        assert_eq!(executed, 1);
        assert_eq!(queue.pending_count(), 0);

        let handle = store.resolve("k1").unwrap();
        assert!(handle.lock().await.suspended);
    }

    #[tokio::test]
    async fn add_credits_action_increments_balance() {
        let store = KeyStore::new();
        let mut rec = KeyRecord::new("alice");
        rec.credits = 10;
        store.create_key("k1".into(), rec);

        let queue = ActionQueue::new();
        queue.schedule(ScheduledAction {
            key_full: "k1".into(),
            at: 0,
            kind: ScheduledActionKind::AddCredits(50),
        });
        queue.execute_due(&store, 0).await;

        let handle = store.resolve("k1").unwrap();
        assert_eq!(handle.lock().await.credits, 60);
    }

    #[tokio::test]
    async fn missing_key_is_skipped_not_errored() {
        let store = KeyStore::new();
        let queue = ActionQueue::new();
        queue.schedule(ScheduledAction {
            key_full: "ghost".into(),
            at: 0,
            kind: ScheduledActionKind::RevokeKey,
        });
        let executed = queue.execute_due(&store, 0).await;
        assert_eq!(executed, 1);
    }
}
