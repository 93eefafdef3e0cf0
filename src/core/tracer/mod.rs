pub mod otlp;

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use rand::Rng;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone)]
pub struct Span {
    pub span_id: String,
    pub name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: u64,
    pub status: SpanStatus,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct TraceSummary {
    pub gate_ms: u64,
    pub backend_ms: u64,
    pub transform_ms: u64,
    pub retry_attempts: u32,
    pub cache_hit: bool,
    pub circuit_state: Option<String>,
    pub credits_cost: u64,
    pub status_code: Option<i32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Trace {
    pub trace_id: String,
    pub request_id: String,
    pub api_key: Option<String>,
    pub tool: Option<String>,
    pub method: String,
    pub path: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub total_duration_ms: Option<u64>,
    pub spans: Vec<Span>,
    pub summary: TraceSummary,
    /// Monotonic completion sequence, used by `drain_new_completed` to
    /// export each trace to OTLP exactly once regardless of how long it
    /// lingers in the completed ring.
    seq: u64,
}

pub struct TracerConfig {
    pub sample_rate: f64,
    pub max_traces: usize,
    pub max_age_ms: i64,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            sample_rate: 1.0,
            max_traces: 10_000,
            max_age_ms: 3_600_000,
        }
    }
}

/// In-memory trace registry: active traces being built, and a bounded
/// completed ring evicted by both count (`max_traces`, FIFO) and age
/// (`max_age_ms`).
pub struct RequestTracer {
    config: TracerConfig,
    active: Mutex<HashMap<String, Trace>>,
    completed: Mutex<VecDeque<Trace>>,
    next_seq: std::sync::atomic::AtomicU64,
    last_exported_seq: std::sync::atomic::AtomicU64,
}

impl RequestTracer {
    pub fn new(config: TracerConfig) -> Self {
        RequestTracer {
            config,
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            next_seq: std::sync::atomic::AtomicU64::new(1),
            last_exported_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Starts a trace, honoring `sample_rate`. Returns `None` when the
    /// call was not sampled — callers must treat all trace operations as
    /// no-ops for an unsampled request.
    pub fn start_trace(
        &self,
        request_id: &str,
        method: &str,
        path: &str,
        api_key: Option<String>,
        incoming_traceparent: Option<&str>,
        now: i64,
    ) -> Option<String> {
        if self.config.sample_rate < 1.0 && rand::thread_rng().gen::<f64>() >= self.config.sample_rate {
            return None;
        }
        let trace_id = incoming_traceparent
            .and_then(parse_traceparent)
            .map(|(tid, _, _)| tid)
            .unwrap_or_else(new_trace_id);

        let trace = Trace {
            trace_id: trace_id.clone(),
            request_id: request_id.to_string(),
            api_key,
            tool: None,
            method: method.to_string(),
            path: path.to_string(),
            start_time: now,
            end_time: None,
            total_duration_ms: None,
            spans: Vec::new(),
            summary: TraceSummary::default(),
            seq: 0,
        };
        self.active.lock().insert(trace_id.clone(), trace);
        Some(trace_id)
    }

    pub fn add_span(
        &self,
        trace_id: &str,
        name: &str,
        start_time: i64,
        duration_ms: u64,
        status: SpanStatus,
        attributes: HashMap<String, String>,
    ) {
        let mut active = self.active.lock();
        if let Some(trace) = active.get_mut(trace_id) {
            trace.spans.push(Span {
                span_id: new_span_id(),
                name: name.to_string(),
                start_time,
                end_time: start_time + duration_ms as i64,
                duration_ms,
                status,
                attributes,
            });
        }
    }

    pub fn set_tool(&self, trace_id: &str, tool: &str) {
        if let Some(trace) = self.active.lock().get_mut(trace_id) {
            trace.tool = Some(tool.to_string());
        }
    }

    /// Finalizes the trace: computes total duration, categorises spans by
    /// name prefix into the summary (`gate.*`, `backend.*`, `transform.*`
    /// — preserved exactly as the source idiosyncrasy it is), applies any
    /// caller-supplied summary overrides, and moves it into the completed
    /// ring.
    pub fn end_trace(&self, trace_id: &str, overrides: Option<TraceSummary>, now: i64) -> Option<Trace> {
        let mut trace = self.active.lock().remove(trace_id)?;
        trace.end_time = Some(now);
        trace.total_duration_ms = Some((now - trace.start_time).max(0) as u64);

        let mut summary = overrides.unwrap_or_default();
        for span in &trace.spans {
            if span.name.starts_with("gate.") {
                summary.gate_ms += span.duration_ms;
            } else if span.name.starts_with("backend.") {
                summary.backend_ms += span.duration_ms;
            } else if span.name.starts_with("transform.") {
                summary.transform_ms += span.duration_ms;
            }
        }
        trace.summary = summary;
        trace.seq = self.next_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut completed = self.completed.lock();
        completed.push_back(trace.clone());
        while completed.len() > self.config.max_traces {
            completed.pop_front();
        }
        let horizon = now - self.config.max_age_ms;
        while matches!(completed.front(), Some(t) if t.start_time < horizon) {
            completed.pop_front();
        }
        Some(trace)
    }

    pub fn completed_traces(&self) -> Vec<Trace> {
        self.completed.lock().iter().cloned().collect()
    }

    /// Returns every completed trace not yet handed to an exporter, newest
    /// completions included exactly once even if they outlive several
    /// calls before eviction. Advances the exported watermark.
    pub fn drain_new_completed(&self) -> Vec<Trace> {
        use std::sync::atomic::Ordering;
        let watermark = self.last_exported_seq.load(Ordering::Relaxed);
        let completed = self.completed.lock();
        let fresh: Vec<Trace> = completed
            .iter()
            .filter(|t| t.seq > watermark)
            .cloned()
            .collect();
        if let Some(max_seq) = fresh.iter().map(|t| t.seq).max() {
            self.last_exported_seq.store(max_seq, Ordering::Relaxed);
        }
        fresh
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().len()
    }
}

fn new_trace_id() -> String {
    hex::encode(Uuid::new_v4().as_bytes())
}

fn new_span_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Parses a W3C `traceparent` of the form `00-<32 hex>-<16 hex>-<01|00>`.
/// Returns `(trace_id, parent_span_id, sampled)`. Any malformed value
/// (wrong version, wrong hex length) yields `None`, so the caller seeds a
/// fresh root trace instead.
pub fn parse_traceparent(value: &str) -> Option<(String, String, bool)> {
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    if parts[0] != "00" {
        return None;
    }
    if parts[1].len() != 32 || !parts[1].bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    if parts[2].len() != 16 || !parts[2].bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    if parts[1].bytes().all(|b| b == b'0') || parts[2].bytes().all(|b| b == b'0') {
        return None;
    }
    let sampled = match parts[3] {
        "01" => true,
        "00" => false,
        _ => return None,
    };
    Some((parts[1].to_string(), parts[2].to_string(), sampled))
}

pub fn format_traceparent(trace_id: &str, span_id: &str, sampled: bool) -> String {
    format!("00-{}-{}-{}", trace_id, span_id, if sampled { "01" } else { "00" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_end_trace_computes_duration() {
        let tracer = RequestTracer::new(TracerConfig::default());
        let trace_id = tracer.start_trace("req1", "tools/call", "/rpc", None, None, 0).unwrap();
        tracer.add_span(&trace_id, "gate.evaluate", 0, 5, SpanStatus::Ok, HashMap::new());
        tracer.add_span(&trace_id, "backend.call", 5, 20, SpanStatus::Ok, HashMap::new());
        let trace = tracer.end_trace(&trace_id, None, 30).unwrap();
        assert_eq!(trace.total_duration_ms, Some(30));
        assert_eq!(trace.summary.gate_ms, 5);
        assert_eq!(trace.summary.backend_ms, 20);
    }

    #[test]
    fn unsampled_trace_is_not_started() {
        let tracer = RequestTracer::new(TracerConfig {
            sample_rate: 0.0,
            ..Default::default()
        });
        assert!(tracer.start_trace("req1", "m", "p", None, None, 0).is_none());
    }

    #[test]
    fn valid_traceparent_seeds_trace_id() {
        let tp = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        let tracer = RequestTracer::new(TracerConfig::default());
        let trace_id = tracer.start_trace("req1", "m", "p", None, Some(tp), 0).unwrap();
        assert_eq!(trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[test]
    fn malformed_traceparent_yields_fresh_trace() {
        let tracer = RequestTracer::new(TracerConfig::default());
        let trace_id = tracer.start_trace("req1", "m", "p", None, Some("garbage"), 0).unwrap();
        assert_ne!(trace_id, "garbage");
        assert_eq!(trace_id.len(), 32);
    }

    #[test]
    fn completed_ring_evicts_by_max_count() {
        let tracer = RequestTracer::new(TracerConfig {
            max_traces: 2,
            ..Default::default()
        });
        for i in 0..3 {
            let tid = tracer.start_trace(&format!("req{}", i), "m", "p", None, None, i).unwrap();
            tracer.end_trace(&tid, None, i + 1);
        }
        assert_eq!(tracer.completed_count(), 2);
    }

    #[test]
    fn drain_new_completed_exports_each_trace_once() {
        let tracer = RequestTracer::new(TracerConfig::default());
        let t1 = tracer.start_trace("req1", "m", "p", None, None, 0).unwrap();
        tracer.end_trace(&t1, None, 1);

        let first_drain = tracer.drain_new_completed();
        assert_eq!(first_drain.len(), 1);
        // A second drain before any new trace completes must be empty —
        // otherwise every scheduler tick would re-export the same trace.
        assert!(tracer.drain_new_completed().is_empty());

        let t2 = tracer.start_trace("req2", "m", "p", None, None, 2).unwrap();
        tracer.end_trace(&t2, None, 3);
        let second_drain = tracer.drain_new_completed();
        assert_eq!(second_drain.len(), 1);
        assert_eq!(second_drain[0].trace_id, t2);
    }
}
