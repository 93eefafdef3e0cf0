use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

const WINDOW_MS: i64 = 60_000;
const GC_MAX_ENTRIES: usize = 100_000;

/// Outcome of a `check`. Mirrors the `allowed`/`denied` result-shape
/// convention used across every L1 limiter — never an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowResult {
    Allowed { remaining: u64 },
    Denied { retry_after_ms: i64 },
}

struct WindowEntry {
    timestamps: Mutex<VecDeque<i64>>,
    last_access: AtomicU64,
}

/// Per-key sliding window over the last 60 seconds. On `check`, stale
/// timestamps are pruned before counting so the window never grows
/// unbounded. Keys idle past the GC horizon are evicted by a background
/// sweep so abandoned keys do not leak memory.
pub struct SlidingWindowLimiter {
    limit: u64,
    entries: DashMap<String, Arc<WindowEntry>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: u64) -> Self {
        SlidingWindowLimiter {
            limit,
            entries: DashMap::new(),
        }
    }

    pub async fn check(&self, key: &str, now: i64) -> WindowResult {
        if self.limit == 0 {
            return WindowResult::Allowed { remaining: u64::MAX };
        }
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(WindowEntry {
                    timestamps: Mutex::new(VecDeque::new()),
                    last_access: AtomicU64::new(now as u64),
                })
            })
            .clone();
        entry.last_access.store(now as u64, Ordering::Relaxed);

        let mut ts = entry.timestamps.lock().await;
        let horizon = now - WINDOW_MS;
        while matches!(ts.front(), Some(front) if *front <= horizon) {
            ts.pop_front();
        }

        if ts.len() as u64 >= self.limit {
            let window_start = *ts.front().unwrap_or(&now);
            let retry_after_ms = (window_start + WINDOW_MS - now).max(0);
            return WindowResult::Denied { retry_after_ms };
        }

        ts.push_back(now);
        let remaining = self.limit - ts.len() as u64;
        WindowResult::Allowed { remaining }
    }

    /// Evicts the least-recently-used entries down to `GC_MAX_ENTRIES`
    /// when the table grows past it.
    pub fn gc(&self, now: i64, idle_horizon_ms: i64) {
        if self.entries.len() <= GC_MAX_ENTRIES {
            return;
        }
        let mut ages: Vec<(String, i64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), now - e.value().last_access.load(Ordering::Relaxed) as i64))
            .collect();
        ages.sort_by(|a, b| b.1.cmp(&a.1));
        for (key, age) in ages {
            if self.entries.len() <= GC_MAX_ENTRIES {
                break;
            }
            if age >= idle_horizon_ms {
                self.entries.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let lim = SlidingWindowLimiter::new(2);
        assert!(matches!(lim.check("k", 0).await, WindowResult::Allowed { remaining: 1 }));
        assert!(matches!(lim.check("k", 10).await, WindowResult::Allowed { remaining: 0 }));
        match lim.check("k", 20).await {
            WindowResult::Denied { retry_after_ms } => assert!(retry_after_ms <= WINDOW_MS),
            other => panic!("expected denied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn window_slides_past_horizon() {
        let lim = SlidingWindowLimiter::new(1);
        assert!(matches!(lim.check("k", 0).await, WindowResult::Allowed { .. }));
        assert!(matches!(lim.check("k", 100).await, WindowResult::Denied { .. }));
        assert!(matches!(
            lim.check("k", WINDOW_MS + 1).await,
            WindowResult::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn zero_limit_means_unlimited() {
        let lim = SlidingWindowLimiter::new(0);
        for i in 0..1000 {
            assert!(matches!(lim.check("k", i).await, WindowResult::Allowed { .. }));
        }
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let lim = SlidingWindowLimiter::new(1);
        assert!(matches!(lim.check("a", 0).await, WindowResult::Allowed { .. }));
        assert!(matches!(lim.check("b", 0).await, WindowResult::Allowed { .. }));
    }
}
