use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

struct Counters {
    by_key: HashMap<String, u32>,
    by_tool: HashMap<String, u32>,
    by_key_tool: HashMap<(String, String), u32>,
}

/// Three counter maps tracking in-flight calls by key, by tool, and by the
/// `(key, tool)` pair, so both per-key and per-tool caps can be enforced
/// from the same acquire/release pair. Never blocks: a failed `acquire`
/// is the caller's signal to translate into a denial.
///
/// The key cap and the tool cap are checked together and all three maps
/// bumped together under one lock. Checking either cap against a stale
/// read and only then incrementing would let two concurrent callers both
/// observe room under the limit and both proceed, overrunning it by one —
/// the whole check-then-increment step has to be one critical section.
pub struct ConcurrencyLimiter {
    per_key_limit: u32,
    per_tool_limit: u32,
    counters: Mutex<Counters>,
}

impl ConcurrencyLimiter {
    pub fn new(per_key_limit: u32, per_tool_limit: u32) -> Self {
        ConcurrencyLimiter {
            per_key_limit,
            per_tool_limit,
            counters: Mutex::new(Counters {
                by_key: HashMap::new(),
                by_tool: HashMap::new(),
                by_key_tool: HashMap::new(),
            }),
        }
    }

    /// Attempts to acquire one in-flight slot for `(key, tool)`. Returns
    /// `false` without mutating anything if either cap would be exceeded.
    pub fn acquire(&self, key: &str, tool: &str) -> bool {
        let mut counters = self.counters.lock();

        let key_count = *counters.by_key.get(key).unwrap_or(&0);
        if self.per_key_limit != 0 && key_count >= self.per_key_limit {
            return false;
        }
        let tool_count = *counters.by_tool.get(tool).unwrap_or(&0);
        if self.per_tool_limit != 0 && tool_count >= self.per_tool_limit {
            return false;
        }

        *counters.by_key.entry(key.to_string()).or_insert(0) += 1;
        *counters.by_tool.entry(tool.to_string()).or_insert(0) += 1;
        *counters
            .by_key_tool
            .entry((key.to_string(), tool.to_string()))
            .or_insert(0) += 1;
        true
    }

    /// Releases a previously acquired slot. Deletes map entries that reach
    /// zero so the tables stay proportional to in-flight traffic, not
    /// historical traffic.
    pub fn release(&self, key: &str, tool: &str) {
        let mut counters = self.counters.lock();
        decrement_or_remove(&mut counters.by_key, key);
        decrement_or_remove(&mut counters.by_tool, tool);
        let key_tool = (key.to_string(), tool.to_string());
        decrement_or_remove(&mut counters.by_key_tool, &key_tool);
    }

    pub fn in_flight_for_key(&self, key: &str) -> u32 {
        *self.counters.lock().by_key.get(key).unwrap_or(&0)
    }

    pub fn in_flight_for_tool(&self, tool: &str) -> u32 {
        *self.counters.lock().by_tool.get(tool).unwrap_or(&0)
    }

    /// True when every counter is back to zero — used to assert
    /// conservation in tests after a mix of acquire/release pairs.
    pub fn all_zero(&self) -> bool {
        let counters = self.counters.lock();
        counters.by_key.is_empty() && counters.by_tool.is_empty() && counters.by_key_tool.is_empty()
    }
}

fn decrement_or_remove<K, Q>(map: &mut HashMap<K, u32>, key: &Q)
where
    K: Hash + Eq + Borrow<Q>,
    Q: Hash + Eq + ?Sized,
{
    let mut remove = false;
    if let Some(entry) = map.get_mut(key) {
        if *entry <= 1 {
            remove = true;
        } else {
            *entry -= 1;
        }
    }
    if remove {
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquires_and_releases() {
        let lim = ConcurrencyLimiter::new(2, 0);
        assert!(lim.acquire("k1", "search"));
        assert!(lim.acquire("k1", "search"));
        assert!(!lim.acquire("k1", "search"));
        lim.release("k1", "search");
        assert!(lim.acquire("k1", "search"));
    }

    #[test]
    fn per_tool_cap_is_independent_of_key() {
        let lim = ConcurrencyLimiter::new(0, 1);
        assert!(lim.acquire("k1", "search"));
        assert!(!lim.acquire("k2", "search"));
        lim.release("k1", "search");
        assert!(lim.acquire("k2", "search"));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let lim = ConcurrencyLimiter::new(0, 0);
        for _ in 0..1000 {
            assert!(lim.acquire("k", "t"));
        }
    }

    #[test]
    fn conservation_after_balanced_acquire_release() {
        let lim = ConcurrencyLimiter::new(0, 0);
        for _ in 0..50 {
            assert!(lim.acquire("k", "t"));
        }
        for _ in 0..50 {
            lim.release("k", "t");
        }
        assert!(lim.all_zero());
    }

    /// Many threads race to acquire the same key+tool against a tight cap;
    /// the count of winners must exactly match the cap, never overshoot it.
    #[test]
    fn concurrent_acquire_never_overruns_cap() {
        let lim = Arc::new(ConcurrencyLimiter::new(4, 0));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let lim = lim.clone();
                thread::spawn(move || lim.acquire("shared-key", "search"))
            })
            .collect();
        let granted = handles.into_iter().filter(|h| h.join().unwrap()).count();
        assert_eq!(granted, 4);
        assert_eq!(lim.in_flight_for_key("shared-key"), 4);
    }
}
