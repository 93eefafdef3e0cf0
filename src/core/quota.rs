use crate::core::calendar::{day_key, month_key};
use crate::core::key_store::KeyRecord;
use crate::error::DenyReason;

/// Rolls the day/month counters on `record` if they are stale relative to
/// `now`, then checks whether `cost` would breach any enabled limit.
/// Never mutates counters on a denial.
pub fn check(record: &mut KeyRecord, cost: u64, now: i64) -> Result<(), DenyReason> {
    roll_if_stale(record, now);

    let q = &record.quota;
    let c = &record.quota_counters;

    if q.daily_call_limit != 0 && c.daily_calls + 1 > q.daily_call_limit {
        return Err(DenyReason::QuotaDailyCallsExceeded);
    }
    if q.monthly_call_limit != 0 && c.monthly_calls + 1 > q.monthly_call_limit {
        return Err(DenyReason::QuotaMonthlyCallsExceeded);
    }
    if q.daily_credit_limit != 0 && c.daily_credits + cost > q.daily_credit_limit {
        return Err(DenyReason::QuotaDailyCreditsExceeded);
    }
    if q.monthly_credit_limit != 0 && c.monthly_credits + cost > q.monthly_credit_limit {
        return Err(DenyReason::QuotaMonthlyCreditsExceeded);
    }
    Ok(())
}

/// Rolls stale counters to zero without otherwise checking or mutating
/// call/credit totals — called once up front so `check` always reasons
/// about the current period.
pub fn roll_if_stale(record: &mut KeyRecord, now: i64) {
    let today = day_key(now);
    let month = month_key(now);
    let c = &mut record.quota_counters;
    if c.last_reset_day != today {
        c.daily_calls = 0;
        c.daily_credits = 0;
        c.last_reset_day = today;
    }
    if c.last_reset_month != month {
        c.monthly_calls = 0;
        c.monthly_credits = 0;
        c.last_reset_month = month;
    }
}

/// Increments the quota counters after a committed call.
pub fn record(record_: &mut KeyRecord, cost: u64, now: i64) {
    roll_if_stale(record_, now);
    let c = &mut record_.quota_counters;
    c.daily_calls += 1;
    c.monthly_calls += 1;
    c.daily_credits += cost;
    c.monthly_credits += cost;
}

/// Rolls back counters incremented by `record`, for proxy-failure
/// rollback. Floors at zero — never goes negative.
pub fn unrecord(record_: &mut KeyRecord, cost: u64) {
    let c = &mut record_.quota_counters;
    c.daily_calls = c.daily_calls.saturating_sub(1);
    c.monthly_calls = c.monthly_calls.saturating_sub(1);
    c.daily_credits = c.daily_credits.saturating_sub(cost);
    c.monthly_credits = c.monthly_credits.saturating_sub(cost);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key_store::QuotaConfig;

    fn key_with_quota(q: QuotaConfig) -> KeyRecord {
        let mut rec = KeyRecord::new("test");
        rec.quota = q;
        rec
    }

    #[test]
    fn allows_then_denies_at_daily_call_limit() {
        let mut rec = key_with_quota(QuotaConfig {
            daily_call_limit: 2,
            ..Default::default()
        });
        let now = 1_705_276_800_000;
        assert!(check(&mut rec, 1, now).is_ok());
        record(&mut rec, 1, now);
        assert!(check(&mut rec, 1, now).is_ok());
        record(&mut rec, 1, now);
        assert_eq!(check(&mut rec, 1, now), Err(DenyReason::QuotaDailyCallsExceeded));
    }

    #[test]
    fn record_then_unrecord_is_idempotent() {
        let mut rec = key_with_quota(QuotaConfig {
            daily_call_limit: 10,
            daily_credit_limit: 100,
            ..Default::default()
        });
        let now = 1_705_276_800_000;
        record(&mut rec, 5, now);
        assert_eq!(rec.quota_counters.daily_calls, 1);
        assert_eq!(rec.quota_counters.daily_credits, 5);
        unrecord(&mut rec, 5);
        assert_eq!(rec.quota_counters.daily_calls, 0);
        assert_eq!(rec.quota_counters.daily_credits, 0);
    }

    #[test]
    fn unrecord_never_goes_negative() {
        let mut rec = key_with_quota(QuotaConfig::default());
        unrecord(&mut rec, 5);
        assert_eq!(rec.quota_counters.daily_credits, 0);
        assert_eq!(rec.quota_counters.daily_calls, 0);
    }

    #[test]
    fn day_boundary_resets_daily_but_not_monthly() {
        let mut rec = key_with_quota(QuotaConfig {
            daily_call_limit: 1,
            monthly_call_limit: 10,
            ..Default::default()
        });
        let day1 = 1_705_276_800_000; // 2024-01-15
        record(&mut rec, 1, day1);
        assert_eq!(check(&mut rec, 1, day1), Err(DenyReason::QuotaDailyCallsExceeded));

        let day2 = day1 + 86_400_000; // 2024-01-16
        assert!(check(&mut rec, 1, day2).is_ok());
        assert_eq!(rec.quota_counters.monthly_calls, 1);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let mut rec = key_with_quota(QuotaConfig::default());
        let now = 0;
        for _ in 0..1000 {
            assert!(check(&mut rec, 1, now).is_ok());
            record(&mut rec, 1, now);
        }
    }
}
