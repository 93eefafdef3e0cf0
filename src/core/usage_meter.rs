use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::core::calendar::hour_key;
use crate::core::key_store::KeyRecord;

/// One recorded call, allowed or denied. Immutable once appended.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub timestamp: i64,
    pub api_key_prefix: String,
    pub key_name: String,
    pub tool: String,
    pub credits_charged: u64,
    pub allowed: bool,
    pub deny_reason: Option<String>,
    pub namespace: Option<String>,
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PerBucket {
    pub calls: u64,
    pub credits: u64,
    pub denied: u64,
}

#[derive(Debug, Default, Clone)]
pub struct Summary {
    pub total_calls: u64,
    pub total_credits_spent: u64,
    pub total_denied: u64,
    pub per_tool: HashMap<String, PerBucket>,
    pub per_key: HashMap<String, PerBucket>,
    pub deny_reasons: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct KeyUsage {
    pub summary: Summary,
    pub recent: Vec<UsageEvent>,
    pub hourly: HashMap<String, PerBucket>,
}

/// Append-only ring of usage events with eviction of the oldest 25% when
/// `maxEvents` is exceeded, so a sustained burst never grows memory
/// unbounded.
pub struct UsageMeter {
    max_events: usize,
    events: Mutex<VecDeque<UsageEvent>>,
}

impl UsageMeter {
    pub fn new(max_events: usize) -> Self {
        UsageMeter {
            max_events: max_events.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, event: UsageEvent) {
        let mut events = self.events.lock();
        events.push_back(event);
        if events.len() > self.max_events {
            let to_drop = (self.max_events as f64 * 0.25).floor() as usize;
            let to_drop = to_drop.max(1);
            for _ in 0..to_drop.min(events.len()) {
                events.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn summary(&self, since_iso_millis: Option<i64>, namespace: Option<&str>) -> Summary {
        let events = self.events.lock();
        let mut summary = Summary::default();
        for e in events.iter() {
            if let Some(since) = since_iso_millis {
                if e.timestamp < since {
                    continue;
                }
            }
            if let Some(ns) = namespace {
                if e.namespace.as_deref() != Some(ns) {
                    continue;
                }
            }
            accumulate(&mut summary, e);
        }
        summary
    }

    pub fn key_usage(&self, api_key_prefix: &str, since_iso_millis: Option<i64>) -> KeyUsage {
        let events = self.events.lock();
        let mut summary = Summary::default();
        let mut matching: Vec<UsageEvent> = Vec::new();
        let mut hourly: HashMap<String, PerBucket> = HashMap::new();

        for e in events.iter() {
            if e.api_key_prefix != api_key_prefix {
                continue;
            }
            if let Some(since) = since_iso_millis {
                if e.timestamp < since {
                    continue;
                }
            }
            accumulate(&mut summary, e);
            matching.push(e.clone());
            let bucket = hourly.entry(hour_key(e.timestamp)).or_default();
            bucket.calls += 1;
            bucket.credits += e.credits_charged;
            if !e.allowed {
                bucket.denied += 1;
            }
        }

        matching.reverse();
        matching.truncate(50);

        KeyUsage {
            summary,
            recent: matching,
            hourly,
        }
    }
}

fn accumulate(summary: &mut Summary, e: &UsageEvent) {
    summary.total_calls += 1;
    if e.allowed {
        summary.total_credits_spent += e.credits_charged;
    } else {
        summary.total_denied += 1;
        if let Some(reason) = &e.deny_reason {
            *summary.deny_reasons.entry(reason.clone()).or_insert(0) += 1;
        }
    }
    let tool_bucket = summary.per_tool.entry(e.tool.clone()).or_default();
    tool_bucket.calls += 1;
    tool_bucket.credits += e.credits_charged;
    if !e.allowed {
        tool_bucket.denied += 1;
    }
    let key_bucket = summary.per_key.entry(e.key_name.clone()).or_default();
    key_bucket.calls += 1;
    key_bucket.credits += e.credits_charged;
    if !e.allowed {
        key_bucket.denied += 1;
    }
}

pub fn event_from_record(
    record: &KeyRecord,
    api_key_prefix: String,
    tool: &str,
    cost: u64,
    allowed: bool,
    deny_reason: Option<String>,
    response_time_ms: Option<u64>,
    now: i64,
) -> UsageEvent {
    UsageEvent {
        timestamp: now,
        api_key_prefix,
        key_name: record.name.clone(),
        tool: tool.to_string(),
        credits_charged: if allowed { cost } else { 0 },
        allowed,
        deny_reason,
        namespace: record.namespace.clone(),
        response_time_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(allowed: bool, credits: u64, tool: &str) -> UsageEvent {
        UsageEvent {
            timestamp: 0,
            api_key_prefix: "key_abc...".into(),
            key_name: "alice".into(),
            tool: tool.into(),
            credits_charged: credits,
            allowed,
            deny_reason: if allowed { None } else { Some("insufficient_credits".into()) },
            namespace: None,
            response_time_ms: Some(12),
        }
    }

    #[test]
    fn ring_evicts_oldest_25_percent_over_capacity() {
        let meter = UsageMeter::new(4);
        for i in 0..5 {
            meter.record(ev(true, i, "search"));
        }
        assert!(meter.len() <= 4);
    }

    #[test]
    fn summary_aggregates_calls_and_credits() {
        let meter = UsageMeter::new(100);
        meter.record(ev(true, 5, "search"));
        meter.record(ev(false, 0, "search"));
        let s = meter.summary(None, None);
        assert_eq!(s.total_calls, 2);
        assert_eq!(s.total_credits_spent, 5);
        assert_eq!(s.total_denied, 1);
        assert_eq!(s.deny_reasons.get("insufficient_credits"), Some(&1));
    }

    #[test]
    fn key_usage_returns_newest_first_capped_at_50() {
        let meter = UsageMeter::new(1000);
        for i in 0..60u64 {
            let mut e = ev(true, i, "search");
            e.timestamp = i as i64;
            meter.record(e);
        }
        let usage = meter.key_usage("key_abc...", None);
        assert_eq!(usage.recent.len(), 50);
        assert_eq!(usage.recent[0].timestamp, 59);
    }
}
