use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::{json, Value};

use super::Trace;

#[derive(Debug, Clone)]
pub struct OtlpConfig {
    pub endpoint: String,
    pub authorization: Option<String>,
    pub service_name: String,
    pub service_version: String,
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
}

/// Span kind per OTLP's numeric enum.
const KIND_SERVER: i32 = 2;

fn span_to_otlp(trace_id: &str, span: &super::Span) -> Value {
    let status_code = match span.status {
        super::SpanStatus::Ok => 1,
        super::SpanStatus::Error => 2,
    };
    json!({
        "traceId": trace_id,
        "spanId": span.span_id,
        "name": span.name,
        "kind": KIND_SERVER,
        "startTimeUnixNano": (span.start_time as i128 * 1_000_000).to_string(),
        "endTimeUnixNano": (span.end_time as i128 * 1_000_000).to_string(),
        "attributes": span.attributes.iter().map(|(k, v)| json!({
            "key": k,
            "value": {"stringValue": v},
        })).collect::<Vec<_>>(),
        "status": {"code": status_code},
    })
}

fn trace_to_payload(config: &OtlpConfig, traces: &[Trace]) -> Value {
    let spans: Vec<Value> = traces
        .iter()
        .flat_map(|t| t.spans.iter().map(move |s| span_to_otlp(&t.trace_id, s)))
        .collect();

    json!({
        "resourceSpans": [{
            "resource": {
                "attributes": [
                    {"key": "service.name", "value": {"stringValue": config.service_name}},
                    {"key": "service.version", "value": {"stringValue": config.service_version}},
                ],
            },
            "scopeSpans": [{
                "spans": spans,
            }],
        }],
    })
}

/// Batches completed traces and ships them as OTLP JSON. Failed exports
/// re-prepend the batch to the queue if there is room, otherwise the
/// batch is dropped and counted — this bounds memory under a sustained
/// collector outage.
pub struct OtlpEmitter {
    config: OtlpConfig,
    client: reqwest::Client,
    queue: Mutex<VecDeque<Trace>>,
    max_queue_size: usize,
    dropped: Mutex<u64>,
}

impl OtlpEmitter {
    pub fn new(config: OtlpConfig, max_queue_size: usize) -> Self {
        OtlpEmitter {
            config,
            client: reqwest::Client::new(),
            queue: Mutex::new(VecDeque::new()),
            max_queue_size,
            dropped: Mutex::new(0),
        }
    }

    pub fn enqueue(&self, trace: Trace) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_queue_size {
            *self.dropped.lock() += 1;
            return;
        }
        queue.push_back(trace);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn dropped_count(&self) -> u64 {
        *self.dropped.lock()
    }

    fn take_batch(&self) -> Vec<Trace> {
        let mut queue = self.queue.lock();
        let n = self.config.max_batch_size.min(queue.len());
        queue.drain(..n).collect()
    }

    fn requeue_front(&self, batch: Vec<Trace>) {
        let mut queue = self.queue.lock();
        let room = self.max_queue_size.saturating_sub(queue.len());
        let kept = batch.len().min(room);
        let dropped = batch.len() - kept;
        if dropped > 0 {
            *self.dropped.lock() += dropped as u64;
        }
        for trace in batch.into_iter().take(kept).rev() {
            queue.push_front(trace);
        }
    }

    /// Attempts one export of a batch pulled from the front of the queue.
    /// Used by the scheduler's periodic flush tick.
    pub async fn flush_once(&self) -> anyhow::Result<()> {
        let batch = self.take_batch();
        if batch.is_empty() {
            return Ok(());
        }
        let payload = trace_to_payload(&self.config, &batch);
        let url = format!("{}/v1/traces", self.config.endpoint);
        let mut req = self.client.post(&url).json(&payload);
        if let Some(auth) = &self.config.authorization {
            req = req.header("authorization", auth);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "otlp: export rejected, requeuing batch");
                self.requeue_front(batch);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "otlp: export failed, requeuing batch");
                self.requeue_front(batch);
                Ok(())
            }
        }
    }

    /// Drains the full queue on shutdown, one batch at a time.
    pub async fn drain(&self) {
        while self.queue_len() > 0 {
            if self.flush_once().await.is_err() {
                break;
            }
            if self.queue_len() == 0 {
                break;
            }
        }
    }
}
