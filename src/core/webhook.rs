use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

pub type DeliverFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Caller-supplied delivery mechanism — the actual HTTP POST (or test
/// double) lives behind this trait so the batcher itself stays
/// transport-agnostic.
pub trait WebhookSink: Send + Sync {
    fn deliver(&self, url: String, payloads: Vec<Value>) -> DeliverFuture;
}

#[derive(Debug, Clone)]
pub struct FailedDelivery {
    pub url: String,
    pub count: usize,
    pub at: i64,
}

#[derive(Debug)]
pub struct QueueFullError;

impl std::fmt::Display for QueueFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "webhook queue full")
    }
}

impl std::error::Error for QueueFullError {}

/// Per-URL event queues with size-triggered and timer-driven flush, a
/// bounded global queue across all URLs, and an observable pause/resume
/// pair that buffers events while paused and delivers them on resume.
pub struct WebhookBatcher {
    sink: Arc<dyn WebhookSink>,
    max_batch_size: usize,
    max_queue_size: usize,
    queues: DashMap<String, Mutex<VecDeque<Value>>>,
    paused: AtomicBool,
    total_queued: AtomicU64,
    failed_count: AtomicU64,
    failure_history: Mutex<VecDeque<FailedDelivery>>,
}

const MAX_FAILURE_HISTORY: usize = 200;

impl WebhookBatcher {
    pub fn new(sink: Arc<dyn WebhookSink>, max_batch_size: usize, max_queue_size: usize) -> Self {
        WebhookBatcher {
            sink,
            max_batch_size: max_batch_size.max(1),
            max_queue_size,
            queues: DashMap::new(),
            paused: AtomicBool::new(false),
            total_queued: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            failure_history: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn add(&self, url: &str, payload: Value) -> Result<(), QueueFullError> {
        if self.total_queued.load(Ordering::Relaxed) as usize >= self.max_queue_size {
            return Err(QueueFullError);
        }
        let entry = self
            .queues
            .entry(url.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let len = {
            let mut q = entry.lock();
            q.push_back(payload);
            q.len()
        };
        self.total_queued.fetch_add(1, Ordering::Relaxed);

        if len >= self.max_batch_size && !self.is_paused() {
            self.flush(url).await;
        }
        Ok(())
    }

    /// Synchronously (from the caller's perspective) drains and delivers
    /// one batch for `url`.
    pub async fn flush(&self, url: &str) {
        let Some(entry) = self.queues.get(url) else {
            return;
        };
        let batch: Vec<Value> = {
            let mut q = entry.lock();
            let n = self.max_batch_size.min(q.len());
            q.drain(..n).collect()
        };
        if batch.is_empty() {
            return;
        }
        self.total_queued.fetch_sub(batch.len() as u64, Ordering::Relaxed);

        let count = batch.len();
        let delivered = self.sink.deliver(url.to_string(), batch).await;
        if !delivered {
            self.failed_count.fetch_add(1, Ordering::Relaxed);
            let mut history = self.failure_history.lock();
            history.push_back(FailedDelivery {
                url: url.to_string(),
                count,
                at: crate::core::key_store::now_millis(),
            });
            if history.len() > MAX_FAILURE_HISTORY {
                history.pop_front();
            }
        }
    }

    /// Flushes every URL with a non-empty queue — driven by the
    /// scheduler's periodic tick.
    pub async fn flush_all(&self) {
        let urls: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        for url in urls {
            self.flush(&url).await;
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub async fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        self.flush_all().await;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_count.load(Ordering::Relaxed)
    }

    pub fn failure_history(&self) -> Vec<FailedDelivery> {
        self.failure_history.lock().iter().cloned().collect()
    }

    pub fn total_queued(&self) -> u64 {
        self.total_queued.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct RecordingSink {
        delivered: Arc<Mutex<Vec<(String, usize)>>>,
        fail_next: Arc<AtomicBool>,
    }

    impl WebhookSink for RecordingSink {
        fn deliver(&self, url: String, payloads: Vec<Value>) -> DeliverFuture {
            let delivered = self.delivered.clone();
            let fail = self.fail_next.load(Ordering::Relaxed);
            Box::pin(async move {
                delivered.lock().push((url, payloads.len()));
                !fail
            })
        }
    }

    #[tokio::test]
    async fn flushes_immediately_at_batch_size() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink {
            delivered: delivered.clone(),
            fail_next: Arc::new(AtomicBool::new(false)),
        });
        let batcher = WebhookBatcher::new(sink, 2, 100);
        batcher.add("http://x", json!({"a":1})).await.unwrap();
        assert!(delivered.lock().is_empty());
        batcher.add("http://x", json!({"a":2})).await.unwrap();
        assert_eq!(delivered.lock().len(), 1);
        assert_eq!(delivered.lock()[0].1, 2);
    }

    #[tokio::test]
    async fn queue_full_raises_error() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink {
            delivered,
            fail_next: Arc::new(AtomicBool::new(false)),
        });
        let batcher = WebhookBatcher::new(sink, 100, 1);
        batcher.add("http://x", json!({})).await.unwrap();
        assert!(batcher.add("http://x", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn pause_buffers_and_resume_delivers() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink {
            delivered: delivered.clone(),
            fail_next: Arc::new(AtomicBool::new(false)),
        });
        let batcher = WebhookBatcher::new(sink, 1, 100);
        batcher.pause();
        batcher.add("http://x", json!({})).await.unwrap();
        assert!(delivered.lock().is_empty());
        assert!(batcher.is_paused());
        batcher.resume().await;
        assert!(!batcher.is_paused());
        assert_eq!(delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_counted_and_retained() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(true));
        let sink = Arc::new(RecordingSink {
            delivered,
            fail_next: fail,
        });
        let batcher = WebhookBatcher::new(sink, 1, 100);
        batcher.add("http://x", json!({})).await.unwrap();
        assert_eq!(batcher.failed_count(), 1);
        assert_eq!(batcher.failure_history().len(), 1);
    }
}
