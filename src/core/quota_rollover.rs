use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::DenyReason;

/// Length of one rollover period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Daily,
    Monthly,
    Custom { ms: i64 },
}

impl Period {
    fn duration_ms(&self) -> i64 {
        match self {
            Period::Daily => 86_400_000,
            Period::Monthly => 30 * 86_400_000,
            Period::Custom { ms } => *ms,
        }
    }
}

/// One key's rollover-quota state, mirroring spec's
/// `{limit, period, used, rollover, periodStart, periodEnd, rolloverPercent,
/// maxRollover, periodsCompleted}`.
#[derive(Debug, Clone)]
pub struct RolloverState {
    pub limit: u64,
    pub period: Period,
    pub used: u64,
    pub rollover: u64,
    pub period_start: i64,
    pub period_end: i64,
    pub rollover_percent: u8,
    pub max_rollover: u64,
    pub periods_completed: u64,
}

impl RolloverState {
    pub fn new(limit: u64, period: Period, rollover_percent: u8, max_rollover: u64, now: i64) -> Self {
        let duration = period.duration_ms();
        RolloverState {
            limit,
            period,
            used: 0,
            rollover: 0,
            period_start: now,
            period_end: now + duration,
            rollover_percent,
            max_rollover,
            periods_completed: 0,
        }
    }

    fn capacity(&self) -> u64 {
        self.limit + self.rollover
    }

    pub fn remaining(&self) -> u64 {
        self.capacity().saturating_sub(self.used)
    }

    /// Advances past any elapsed periods, folding unused quota into the
    /// rollover allowance per period: `new_rollover = min(floor(unused *
    /// p / 100), maxRollover)`.
    fn advance_if_due(&mut self, now: i64) {
        while now >= self.period_end {
            let unused = self.capacity().saturating_sub(self.used);
            let carried = (unused * self.rollover_percent as u64 / 100).min(self.max_rollover);
            self.rollover = carried;
            self.used = 0;
            self.period_start = self.period_end;
            self.period_end = self.period_start + self.period.duration_ms();
            self.periods_completed += 1;
        }
    }
}

/// Registry of per-key rollover-quota state, separate from the simpler
/// daily/monthly counters on `KeyRecord` itself — this tracks an
/// independent configurable period with percent carry-over.
pub struct QuotaRolloverManager {
    states: DashMap<String, Arc<Mutex<RolloverState>>>,
}

impl QuotaRolloverManager {
    pub fn new() -> Self {
        QuotaRolloverManager {
            states: DashMap::new(),
        }
    }

    pub fn create(&self, key: &str, state: RolloverState) {
        self.states.insert(key.to_string(), Arc::new(Mutex::new(state)));
    }

    pub fn consume(&self, key: &str, cost: u64, now: i64) -> Result<(), DenyReason> {
        let Some(entry) = self.states.get(key) else {
            return Ok(());
        };
        let handle = entry.clone();
        drop(entry);
        let mut state = handle.lock();
        state.advance_if_due(now);
        if state.used + cost > state.capacity() {
            return Err(DenyReason::QuotaDailyCreditsExceeded);
        }
        state.used += cost;
        Ok(())
    }

    pub fn status(&self, key: &str, now: i64) -> Option<RolloverState> {
        let entry = self.states.get(key)?;
        let handle = entry.clone();
        drop(entry);
        let mut state = handle.lock();
        state.advance_if_due(now);
        Some(state.clone())
    }
}

impl Default for QuotaRolloverManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollover_conservation_on_period_advance() {
        let mgr = QuotaRolloverManager::new();
        let start = 0;
        mgr.create("k", RolloverState::new(100, Period::Daily, 50, 40, start));
        mgr.consume("k", 20, start).unwrap();

        let status = mgr.status("k", Period::Daily.duration_ms() + 1).unwrap();
        // unused = 100 - 20 = 80; rollover = min(floor(80*50/100), 40) = 40
        assert_eq!(status.rollover, 40);
        assert_eq!(status.remaining(), 140);
    }

    #[test]
    fn denies_past_capacity() {
        let mgr = QuotaRolloverManager::new();
        mgr.create("k", RolloverState::new(10, Period::Daily, 0, 0, 0));
        assert!(mgr.consume("k", 10, 0).is_ok());
        assert!(mgr.consume("k", 1, 0).is_err());
    }

    #[test]
    fn rollover_capped_at_max() {
        let mgr = QuotaRolloverManager::new();
        mgr.create("k", RolloverState::new(100, Period::Daily, 100, 10, 0));
        // unused=100, p=100 => floor(100) = 100, capped at max_rollover=10
        let status = mgr.status("k", Period::Daily.duration_ms() + 1).unwrap();
        assert_eq!(status.rollover, 10);
    }

    #[test]
    fn unknown_key_consume_is_noop_allow() {
        let mgr = QuotaRolloverManager::new();
        assert!(mgr.consume("ghost", 5, 0).is_ok());
    }
}
