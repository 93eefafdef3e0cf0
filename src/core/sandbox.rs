use std::collections::HashSet;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::DenyReason;

/// A named "try-before-buy" policy: a restricted tool set plus a windowed
/// call cap, assignable to a key independent of its main ACL/quota.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub name: String,
    pub allowed_tools: HashSet<String>,
    pub denied_tools: HashSet<String>,
    pub window_ms: i64,
    pub window_call_cap: u64,
}

#[derive(Default)]
struct WindowedCounter {
    window_start: i64,
    count: u64,
}

/// Registry of sandbox policies plus per-key windowed counters.
pub struct SandboxManager {
    policies: DashMap<String, SandboxPolicy>,
    counters: DashMap<String, Mutex<WindowedCounter>>,
}

impl SandboxManager {
    pub fn new() -> Self {
        SandboxManager {
            policies: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    pub fn register(&self, policy: SandboxPolicy) {
        self.policies.insert(policy.name.clone(), policy);
    }

    /// Evaluates the ACL and windowed counter for `key` under `policy_name`.
    /// A policy assigned but not registered is treated as a denial, not a
    /// pass — an admin misconfiguration must never silently widen access.
    pub fn check(&self, policy_name: &str, key: &str, tool: &str, now: i64) -> Result<(), DenyReason> {
        let Some(policy) = self.policies.get(policy_name) else {
            return Err(DenyReason::SandboxToolDenied(tool.to_string()));
        };

        if policy.denied_tools.contains(tool) {
            return Err(DenyReason::SandboxToolDenied(tool.to_string()));
        }
        if !policy.allowed_tools.is_empty() && !policy.allowed_tools.contains(tool) {
            return Err(DenyReason::SandboxToolNotAllowed(tool.to_string()));
        }

        if policy.window_call_cap == 0 {
            return Ok(());
        }

        let counter_key = format!("{}:{}", policy_name, key);
        let entry = self
            .counters
            .entry(counter_key)
            .or_insert_with(|| Mutex::new(WindowedCounter { window_start: now, count: 0 }));
        let mut counter = entry.lock();
        if now - counter.window_start >= policy.window_ms {
            counter.window_start = now;
            counter.count = 0;
        }
        if counter.count + 1 > policy.window_call_cap {
            return Err(DenyReason::SandboxQuotaExceeded);
        }
        counter.count += 1;
        Ok(())
    }
}

impl Default for SandboxManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SandboxPolicy {
        SandboxPolicy {
            name: "trial".into(),
            allowed_tools: ["search".to_string()].into_iter().collect(),
            denied_tools: HashSet::new(),
            window_ms: 60_000,
            window_call_cap: 2,
        }
    }

    #[test]
    fn denies_tool_not_in_allow_list() {
        let mgr = SandboxManager::new();
        mgr.register(policy());
        assert_eq!(
            mgr.check("trial", "k1", "delete", 0),
            Err(DenyReason::SandboxToolNotAllowed("delete".to_string()))
        );
    }

    #[test]
    fn windowed_cap_denies_after_limit() {
        let mgr = SandboxManager::new();
        mgr.register(policy());
        assert!(mgr.check("trial", "k1", "search", 0).is_ok());
        assert!(mgr.check("trial", "k1", "search", 0).is_ok());
        assert_eq!(mgr.check("trial", "k1", "search", 0), Err(DenyReason::SandboxQuotaExceeded));
    }

    #[test]
    fn window_resets_after_elapsed() {
        let mgr = SandboxManager::new();
        mgr.register(policy());
        assert!(mgr.check("trial", "k1", "search", 0).is_ok());
        assert!(mgr.check("trial", "k1", "search", 0).is_ok());
        assert!(mgr.check("trial", "k1", "search", 70_000).is_ok());
    }

    #[test]
    fn unregistered_policy_denies() {
        let mgr = SandboxManager::new();
        assert!(mgr.check("ghost", "k1", "search", 0).is_err());
    }
}
