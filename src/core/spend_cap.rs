use dashmap::DashMap;
use parking_lot::Mutex;

use crate::core::calendar::{day_key, hour_key};
use crate::core::key_store::QuotaConfig;
use crate::error::DenyReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachAction {
    Deny,
    Suspend,
}

#[derive(Debug, Clone)]
pub struct SpendCapConfig {
    pub server_daily_call_cap: u64,
    pub server_daily_credit_cap: u64,
    pub breach_action: BreachAction,
    pub auto_resume_after_secs: u64,
}

impl Default for SpendCapConfig {
    fn default() -> Self {
        SpendCapConfig {
            server_daily_call_cap: 0,
            server_daily_credit_cap: 0,
            breach_action: BreachAction::Deny,
            auto_resume_after_secs: 0,
        }
    }
}

#[derive(Debug, Default)]
struct ServerDailyState {
    daily_calls: u64,
    daily_credits: u64,
    reset_day: String,
}

#[derive(Debug, Default)]
struct HourlyState {
    hour: String,
    hourly_calls: u64,
    hourly_credits: u64,
}

/// Server-wide daily caps plus per-key hourly caps, with optional
/// auto-suspend on breach.
pub struct SpendCapManager {
    config: SpendCapConfig,
    server: Mutex<ServerDailyState>,
    hourly: DashMap<String, Mutex<HourlyState>>,
    auto_suspended: DashMap<String, i64>,
}

impl SpendCapManager {
    pub fn new(config: SpendCapConfig) -> Self {
        SpendCapManager {
            config,
            server: Mutex::new(ServerDailyState::default()),
            hourly: DashMap::new(),
            auto_suspended: DashMap::new(),
        }
    }

    pub fn check_server_cap(&self, cost: u64, now: i64) -> Result<(), DenyReason> {
        let today = day_key(now);
        let mut state = self.server.lock();
        if state.reset_day != today {
            state.daily_calls = 0;
            state.daily_credits = 0;
            state.reset_day = today;
        }
        if self.config.server_daily_call_cap != 0 && state.daily_calls + 1 > self.config.server_daily_call_cap {
            return Err(DenyReason::ServerDailyCallCap);
        }
        if self.config.server_daily_credit_cap != 0
            && state.daily_credits + cost > self.config.server_daily_credit_cap
        {
            return Err(DenyReason::ServerDailyCreditCap);
        }
        Ok(())
    }

    pub fn record_server(&self, cost: u64, now: i64) {
        let today = day_key(now);
        let mut state = self.server.lock();
        if state.reset_day != today {
            state.daily_calls = 0;
            state.daily_credits = 0;
            state.reset_day = today;
        }
        state.daily_calls += 1;
        state.daily_credits += cost;
    }

    pub fn check_hourly_cap(&self, key: &str, cost: u64, quota: &QuotaConfig, now: i64) -> Result<(), DenyReason> {
        if quota.hourly_call_limit == 0 && quota.hourly_credit_limit == 0 {
            return Ok(());
        }
        let bucket = hour_key(now);
        let entry = self
            .hourly
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(HourlyState::default()));
        let mut state = entry.lock();
        if state.hour != bucket {
            state.hourly_calls = 0;
            state.hourly_credits = 0;
            state.hour = bucket;
        }
        if quota.hourly_call_limit != 0 && state.hourly_calls + 1 > quota.hourly_call_limit {
            return Err(DenyReason::HourlyCallCapExceeded);
        }
        if quota.hourly_credit_limit != 0 && state.hourly_credits + cost > quota.hourly_credit_limit {
            return Err(DenyReason::HourlyCreditCapExceeded);
        }
        Ok(())
    }

    pub fn record_hourly(&self, key: &str, cost: u64, now: i64) {
        let bucket = hour_key(now);
        let entry = self
            .hourly
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(HourlyState::default()));
        let mut state = entry.lock();
        if state.hour != bucket {
            state.hourly_calls = 0;
            state.hourly_credits = 0;
            state.hour = bucket;
        }
        state.hourly_calls += 1;
        state.hourly_credits += cost;
    }

    pub fn unrecord_hourly(&self, key: &str, cost: u64) {
        if let Some(entry) = self.hourly.get(key) {
            let mut state = entry.lock();
            state.hourly_calls = state.hourly_calls.saturating_sub(1);
            state.hourly_credits = state.hourly_credits.saturating_sub(cost);
        }
    }

    /// Marks `key` suspended if the configured breach action is `Suspend`.
    /// Called by the gate when a hourly/server cap check denies.
    pub fn maybe_suspend(&self, key: &str, now: i64) {
        if self.config.breach_action == BreachAction::Suspend {
            self.auto_suspended.insert(key.to_string(), now);
            tracing::warn!(key = %key, "spend_cap: auto-suspended after breach");
        }
    }

    /// True while `key` remains auto-suspended. Transitioning to `false`
    /// (auto-resume) removes the entry and logs a notification — the
    /// configurable sink this crate ships is `tracing`.
    pub fn is_auto_suspended(&self, key: &str, now: i64) -> bool {
        let Some(entry) = self.auto_suspended.get(key) else {
            return false;
        };
        let suspended_at = *entry;
        drop(entry);
        if self.config.auto_resume_after_secs == 0 {
            return true;
        }
        let elapsed_secs = (now - suspended_at) / 1000;
        if elapsed_secs >= self.config.auto_resume_after_secs as i64 {
            self.auto_suspended.remove(key);
            tracing::info!(key = %key, "spend_cap: auto-resumed");
            false
        } else {
            true
        }
    }

    pub fn clear_suspension(&self, key: &str) {
        self.auto_suspended.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_cap_denies_with_credit_cap_reason() {
        let mgr = SpendCapManager::new(SpendCapConfig {
            server_daily_credit_cap: 10,
            ..Default::default()
        });
        mgr.record_server(10, 0);
        let err = mgr.check_server_cap(1, 0).unwrap_err();
        assert!(err.to_string().contains("server_daily_credit_cap"));
    }

    #[test]
    fn hourly_cap_enforced_per_key() {
        let mgr = SpendCapManager::new(SpendCapConfig::default());
        let quota = QuotaConfig {
            hourly_call_limit: 1,
            ..Default::default()
        };
        assert!(mgr.check_hourly_cap("k1", 1, &quota, 0).is_ok());
        mgr.record_hourly("k1", 1, 0);
        assert!(mgr.check_hourly_cap("k1", 1, &quota, 0).is_err());
        assert!(mgr.check_hourly_cap("k2", 1, &quota, 0).is_ok());
    }

    #[test]
    fn suspend_breach_action_marks_key() {
        let mgr = SpendCapManager::new(SpendCapConfig {
            breach_action: BreachAction::Suspend,
            auto_resume_after_secs: 60,
            ..Default::default()
        });
        assert!(!mgr.is_auto_suspended("k1", 0));
        mgr.maybe_suspend("k1", 0);
        assert!(mgr.is_auto_suspended("k1", 1000));
        assert!(!mgr.is_auto_suspended("k1", 61_000));
    }

    #[test]
    fn permanent_suspend_never_auto_resumes() {
        let mgr = SpendCapManager::new(SpendCapConfig {
            breach_action: BreachAction::Suspend,
            auto_resume_after_secs: 0,
            ..Default::default()
        });
        mgr.maybe_suspend("k1", 0);
        assert!(mgr.is_auto_suspended("k1", 1_000_000_000));
    }

    #[test]
    fn hourly_rollback_is_idempotent_safe() {
        let mgr = SpendCapManager::new(SpendCapConfig::default());
        let quota = QuotaConfig {
            hourly_credit_limit: 100,
            ..Default::default()
        };
        mgr.record_hourly("k1", 10, 0);
        mgr.unrecord_hourly("k1", 10);
        assert!(mgr.check_hourly_cap("k1", 100, &quota, 0).is_ok());
    }
}
