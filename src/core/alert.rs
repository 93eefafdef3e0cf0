use std::collections::VecDeque;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::core::key_store::KeyRecord;

#[derive(Debug, Clone)]
pub enum RuleKind {
    SpendingThreshold { threshold_percent: u32 },
    CreditsLow { threshold: i64 },
    QuotaWarning { threshold_percent: u32 },
    KeyExpirySoon { threshold_secs: i64 },
    RateLimitSpike { threshold: u64 },
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub kind: RuleKind,
    pub cooldown_ms: i64,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub rule_name: String,
    pub key_name: String,
    pub at: i64,
    pub message: String,
}

const RATE_LIMIT_WINDOW_MS: i64 = 5 * 60_000;

/// Evaluates configured rules against a key's snapshot on every gate
/// evaluation the caller chooses to feed in. Keeps last-fired timestamps
/// per `(rule, key)` for cooldown, and a rolling per-key denial log for
/// the rate-limit-spike rule.
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    last_fired: DashMap<(String, String), i64>,
    rate_limit_denials: DashMap<String, Mutex<VecDeque<i64>>>,
    fired: Mutex<Vec<Alert>>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        AlertEngine {
            rules,
            last_fired: DashMap::new(),
            rate_limit_denials: DashMap::new(),
            fired: Mutex::new(Vec::new()),
        }
    }

    pub fn record_rate_limit_denial(&self, key: &str, now: i64) {
        let entry = self
            .rate_limit_denials
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut deque = entry.lock();
        deque.push_back(now);
        let horizon = now - RATE_LIMIT_WINDOW_MS;
        while matches!(deque.front(), Some(t) if *t < horizon) {
            deque.pop_front();
        }
    }

    fn rate_limit_denial_count(&self, key: &str, now: i64) -> u64 {
        let Some(entry) = self.rate_limit_denials.get(key) else {
            return 0;
        };
        let deque = entry.lock();
        let horizon = now - RATE_LIMIT_WINDOW_MS;
        deque.iter().filter(|t| **t >= horizon).count() as u64
    }

    /// Evaluates every rule against `record`. Fires (records to the
    /// in-memory `fired` log, unless `dry_run`) any rule whose cooldown
    /// has elapsed and whose evaluator matches.
    pub fn check(&self, key_full: &str, record: &KeyRecord, now: i64) -> Vec<Alert> {
        let mut newly_fired = Vec::new();
        for rule in &self.rules {
            let cooldown_key = (rule.name.clone(), key_full.to_string());
            if let Some(last) = self.last_fired.get(&cooldown_key) {
                if now - *last < rule.cooldown_ms {
                    continue;
                }
            }
            let Some(message) = self.evaluate_rule(rule, record, key_full, now) else {
                continue;
            };
            self.last_fired.insert(cooldown_key, now);
            let alert = Alert {
                rule_name: rule.name.clone(),
                key_name: record.name.clone(),
                at: now,
                message,
            };
            if !rule.dry_run {
                self.fired.lock().push(alert.clone());
            }
            newly_fired.push(alert);
        }
        newly_fired
    }

    fn evaluate_rule(&self, rule: &AlertRule, record: &KeyRecord, key_full: &str, now: i64) -> Option<String> {
        match rule.kind {
            RuleKind::SpendingThreshold { threshold_percent } => {
                let denom = record.credits.max(0) as u64 + record.total_spent;
                if denom == 0 {
                    return None;
                }
                let ratio = record.total_spent * 100 / denom;
                (ratio >= threshold_percent as u64)
                    .then(|| format!("spending_threshold: {}% of lifetime balance spent", ratio))
            }
            RuleKind::CreditsLow { threshold } => {
                (record.credits <= threshold).then(|| format!("credits_low: {} credits remaining", record.credits))
            }
            RuleKind::QuotaWarning { threshold_percent } => {
                let checks: [(u64, u64); 2] = [
                    (record.quota_counters.daily_calls, record.quota.daily_call_limit),
                    (record.quota_counters.monthly_calls, record.quota.monthly_call_limit),
                ];
                for (used, limit) in checks {
                    if limit == 0 {
                        continue;
                    }
                    let ratio = used * 100 / limit;
                    if ratio >= threshold_percent as u64 {
                        return Some(format!("quota_warning: {}% of quota used", ratio));
                    }
                }
                None
            }
            RuleKind::KeyExpirySoon { threshold_secs } => {
                let expires_at = record.expires_at?;
                let remaining_ms = expires_at - now;
                (remaining_ms > 0 && remaining_ms <= threshold_secs * 1000)
                    .then(|| format!("key_expiry_soon: expires in {}ms", remaining_ms))
            }
            RuleKind::RateLimitSpike { threshold } => {
                let count = self.rate_limit_denial_count(key_full, now);
                (count >= threshold).then(|| format!("rate_limit_spike: {} denials in last 5m", count))
            }
        }
    }

    pub fn fired_alerts(&self) -> Vec<Alert> {
        self.fired.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(credits: i64, total_spent: u64) -> KeyRecord {
        let mut r = KeyRecord::new("alice");
        r.credits = credits;
        r.total_spent = total_spent;
        r
    }

    #[test]
    fn credits_low_fires_below_threshold() {
        let engine = AlertEngine::new(vec![AlertRule {
            name: "low".into(),
            kind: RuleKind::CreditsLow { threshold: 10 },
            cooldown_ms: 0,
            dry_run: false,
        }]);
        let rec = key(5, 0);
        let alerts = engine.check("k1", &rec, 0);
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn cooldown_suppresses_repeat_fire() {
        let engine = AlertEngine::new(vec![AlertRule {
            name: "low".into(),
            kind: RuleKind::CreditsLow { threshold: 10 },
            cooldown_ms: 10_000,
            dry_run: false,
        }]);
        let rec = key(5, 0);
        assert_eq!(engine.check("k1", &rec, 0).len(), 1);
        assert_eq!(engine.check("k1", &rec, 5_000).len(), 0);
        assert_eq!(engine.check("k1", &rec, 11_000).len(), 1);
    }

    #[test]
    fn dry_run_does_not_record_but_still_returns() {
        let engine = AlertEngine::new(vec![AlertRule {
            name: "low".into(),
            kind: RuleKind::CreditsLow { threshold: 10 },
            cooldown_ms: 0,
            dry_run: true,
        }]);
        let rec = key(5, 0);
        let alerts = engine.check("k1", &rec, 0);
        assert_eq!(alerts.len(), 1);
        assert!(engine.fired_alerts().is_empty());
    }

    #[test]
    fn spending_threshold_ratio() {
        let engine = AlertEngine::new(vec![AlertRule {
            name: "spend".into(),
            kind: RuleKind::SpendingThreshold { threshold_percent: 50 },
            cooldown_ms: 0,
            dry_run: false,
        }]);
        let rec = key(50, 50);
        assert_eq!(engine.check("k1", &rec, 0).len(), 1);
    }

    #[test]
    fn rate_limit_spike_counts_recent_denials() {
        let engine = AlertEngine::new(vec![AlertRule {
            name: "spike".into(),
            kind: RuleKind::RateLimitSpike { threshold: 3 },
            cooldown_ms: 0,
            dry_run: false,
        }]);
        let rec = key(10, 0);
        engine.record_rate_limit_denial("k1", 0);
        engine.record_rate_limit_denial("k1", 1000);
        engine.record_rate_limit_denial("k1", 2000);
        assert_eq!(engine.check("k1", &rec, 2000).len(), 1);
    }

    #[test]
    fn key_expiry_soon_within_threshold() {
        let engine = AlertEngine::new(vec![AlertRule {
            name: "expiry".into(),
            kind: RuleKind::KeyExpirySoon { threshold_secs: 3600 },
            cooldown_ms: 0,
            dry_run: false,
        }]);
        let mut rec = key(10, 0);
        rec.expires_at = Some(1_800_000);
        assert_eq!(engine.check("k1", &rec, 0).len(), 1);
    }
}
