use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

const GC_MAX_ENTRIES: usize = 100_000;

/// Outcome of a `consume`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketResult {
    Allowed { remaining: u64 },
    Denied { retry_after_ms: i64 },
}

struct BucketState {
    tokens: f64,
    last_refill: i64,
}

struct BucketEntry {
    state: Mutex<BucketState>,
    last_access: AtomicU64,
}

/// Per-key token bucket: `{tokens, lastRefill}` guarded by a per-entry
/// async mutex, following the teacher's rate limiter's move away from a
/// CAS loop — under contention, a CAS-based refill only lets the winner
/// refill, so the effective rate silently drops. A held lock serializes
/// refill-then-consume as one step instead. Keys idle past the GC horizon
/// are evicted by a background sweep, mirroring the sliding window limiter.
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_rate: f64,
    interval_ms: i64,
    buckets: DashMap<String, Arc<BucketEntry>>,
}

impl TokenBucketLimiter {
    pub fn new(capacity: u64, refill_rate: u64, interval_ms: i64) -> Self {
        TokenBucketLimiter {
            capacity: capacity as f64,
            refill_rate: refill_rate as f64,
            interval_ms: interval_ms.max(1),
            buckets: DashMap::new(),
        }
    }

    pub async fn consume(&self, key: &str, n: u64, now: i64) -> BucketResult {
        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(BucketEntry {
                    state: Mutex::new(BucketState {
                        tokens: self.capacity,
                        last_refill: now,
                    }),
                    last_access: AtomicU64::new(now as u64),
                })
            })
            .clone();
        entry.last_access.store(now as u64, Ordering::Relaxed);

        let mut state = entry.state.lock().await;
        let elapsed = (now - state.last_refill).max(0);
        let intervals = elapsed / self.interval_ms;
        if intervals > 0 {
            let refilled = intervals as f64 * self.refill_rate;
            state.tokens = (state.tokens + refilled).min(self.capacity);
            state.last_refill += intervals * self.interval_ms;
        }

        let n = n as f64;
        if state.tokens >= n {
            state.tokens -= n;
            BucketResult::Allowed {
                remaining: state.tokens.floor() as u64,
            }
        } else {
            let deficit = n - state.tokens;
            let intervals_needed = (deficit / self.refill_rate).ceil().max(0.0);
            let retry_after_ms = (intervals_needed as i64) * self.interval_ms;
            BucketResult::Denied { retry_after_ms }
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Evicts the least-recently-used entries down to `GC_MAX_ENTRIES`
    /// when the table grows past it.
    pub fn gc(&self, now: i64, idle_horizon_ms: i64) {
        if self.buckets.len() <= GC_MAX_ENTRIES {
            return;
        }
        let mut ages: Vec<(String, i64)> = self
            .buckets
            .iter()
            .map(|e| (e.key().clone(), now - e.value().last_access.load(Ordering::Relaxed) as i64))
            .collect();
        ages.sort_by(|a, b| b.1.cmp(&a.1));
        for (key, age) in ages {
            if self.buckets.len() <= GC_MAX_ENTRIES {
                break;
            }
            if age >= idle_horizon_ms {
                self.buckets.remove(&key);
            }
        }
    }
}
