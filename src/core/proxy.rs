use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::core::circuit_breaker::{BreakerCheck, CircuitBreakerConfig};
use crate::core::gate::{Decision, Gate};
use crate::core::quota;
use crate::core::tracer::{SpanStatus, TraceSummary};
use crate::core::usage_meter::{event_from_record, UsageEvent, UsageMeter};
use crate::error::DenyReason;

pub enum BackendOutcome {
    /// 2xx (or any status the caller treats as a committed charge).
    Success(Value),
    /// Non-2xx status still counted as a contacted backend — committed,
    /// never retried.
    ClientError(Value),
    /// Network error, timeout, or 5xx — retryable.
    Failure(String),
}

pub type BackendFuture = Pin<Box<dyn Future<Output = BackendOutcome> + Send>>;

pub trait BackendClient: Send + Sync {
    fn call(&self, tool: &str, payload: Value, timeout: Duration) -> BackendFuture;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub per_attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 2,
            base_backoff_ms: 50,
            max_backoff_ms: 2000,
            per_attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of `Proxy::execute`, already shaped for the transport layer.
pub struct ExecuteResult {
    pub allowed: bool,
    pub response: Option<Value>,
    pub deny_reason: Option<String>,
    pub retry_after_ms: Option<i64>,
}

fn backoff_with_jitter(attempt: u32, cfg: &RetryConfig) -> Duration {
    let base = cfg.base_backoff_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = base.min(cfg.max_backoff_ms);
    let jitter = rand::thread_rng().gen_range(0..=capped.max(1) / 4 + 1);
    Duration::from_millis(capped.saturating_add(jitter))
}

/// Carries an accepted `Decision` to completion: commits pre-charge
/// counters, calls the backend through the circuit breaker with retries,
/// and on any terminating path releases the concurrency slot exactly once
/// and ends the trace.
pub struct Proxy<'a> {
    pub gate: &'a Gate,
    pub usage_meter: &'a UsageMeter,
}

impl<'a> Proxy<'a> {
    pub async fn execute(
        &self,
        decision: &Decision,
        payload: Value,
        backend: &dyn BackendClient,
        cb_config: &CircuitBreakerConfig,
        retry_config: &RetryConfig,
        now: i64,
    ) -> ExecuteResult {
        debug_assert!(decision.allowed, "execute called on a denied decision");

        let Some(handle) = self.gate.key_store.resolve(&decision.key_full) else {
            if decision.acquired_concurrency {
                self.gate.concurrency.release(&decision.key_full, &decision.tool);
            }
            return ExecuteResult {
                allowed: false,
                response: None,
                deny_reason: Some(DenyReason::InternalError("key vanished before commit".into()).to_string()),
                retry_after_ms: None,
            };
        };

        let breaker_check = self.gate.circuit_breaker.check(&decision.tool, cb_config);
        if breaker_check == BreakerCheck::Rejected {
            if decision.acquired_concurrency {
                self.gate.concurrency.release(&decision.key_full, &decision.tool);
            }
            self.end_trace_with_error(decision, "circuit_open", now);
            self.record_denied(decision, &handle, DenyReason::CircuitOpen, now).await;
            return ExecuteResult {
                allowed: false,
                response: None,
                deny_reason: Some(DenyReason::CircuitOpen.to_string()),
                retry_after_ms: None,
            };
        }

        // Shadow-converted decisions are metered as allowed but never touch
        // credits, quota, or spend-cap counters — nothing was really spent.
        if !decision.shadow {
            let mut rec = handle.lock().await;
            quota::record(&mut rec, decision.cost, now);
            self.gate.spend_cap.record_hourly(&decision.key_full, decision.cost, now);
            self.gate.spend_cap.record_server(decision.cost, now);
        }

        let mut attempt = 0u32;
        loop {
            let backend_start = now;
            let outcome = backend
                .call(&decision.tool, payload.clone(), retry_config.per_attempt_timeout)
                .await;

            match outcome {
                BackendOutcome::Success(resp) | BackendOutcome::ClientError(resp) => {
                    self.gate.circuit_breaker.record_success(&decision.tool, cb_config);
                    if !decision.shadow {
                        let mut rec = handle.lock().await;
                        rec.credits -= decision.cost as i64;
                        rec.total_spent += decision.cost;
                        rec.total_calls += 1;
                    }
                    if decision.acquired_concurrency {
                        self.gate.concurrency.release(&decision.key_full, &decision.tool);
                    }
                    self.record_allowed(decision, &handle, now - backend_start, now).await;
                    self.end_trace_ok(decision, now);
                    return ExecuteResult {
                        allowed: true,
                        response: Some(resp),
                        deny_reason: None,
                        retry_after_ms: None,
                    };
                }
                BackendOutcome::Failure(_msg) if attempt < retry_config.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(backoff_with_jitter(attempt, retry_config)).await;
                    continue;
                }
                BackendOutcome::Failure(_msg) => {
                    self.gate.circuit_breaker.record_failure(&decision.tool, cb_config);
                    if !decision.shadow {
                        {
                            let mut rec = handle.lock().await;
                            quota::unrecord(&mut rec, decision.cost);
                        }
                        self.gate.spend_cap.unrecord_hourly(&decision.key_full, decision.cost);
                    }
                    if decision.acquired_concurrency {
                        self.gate.concurrency.release(&decision.key_full, &decision.tool);
                    }
                    self.record_denied(decision, &handle, DenyReason::BackendError, now).await;
                    self.end_trace_with_error(decision, "backend_error", now);
                    return ExecuteResult {
                        allowed: false,
                        response: None,
                        deny_reason: Some(DenyReason::BackendError.to_string()),
                        retry_after_ms: None,
                    };
                }
            }
        }
    }

    async fn record_allowed(
        &self,
        decision: &Decision,
        handle: &tokio::sync::Mutex<crate::core::key_store::KeyRecord>,
        response_time_ms: i64,
        now: i64,
    ) {
        let rec = handle.lock().await;
        let event = event_from_record(
            &rec,
            crate::core::key_store::KeyRecord::display_prefix(&decision.key_full),
            &decision.tool,
            decision.cost,
            true,
            None,
            Some(response_time_ms.max(0) as u64),
            now,
        );
        drop(rec);
        self.usage_meter.record(event);
    }

    async fn record_denied(
        &self,
        decision: &Decision,
        handle: &tokio::sync::Mutex<crate::core::key_store::KeyRecord>,
        reason: DenyReason,
        now: i64,
    ) {
        let rec = handle.lock().await;
        let event = event_from_record(
            &rec,
            crate::core::key_store::KeyRecord::display_prefix(&decision.key_full),
            &decision.tool,
            0,
            false,
            Some(reason.to_string()),
            None,
            now,
        );
        drop(rec);
        self.usage_meter.record(event);
    }

    fn end_trace_ok(&self, decision: &Decision, now: i64) {
        if let (Some(tracer), Some(trace_id)) = (&self.gate.tracer, &decision.trace_id) {
            tracer.add_span(
                trace_id,
                "backend.call",
                now,
                0,
                SpanStatus::Ok,
                Default::default(),
            );
            tracer.end_trace(
                trace_id,
                Some(TraceSummary {
                    credits_cost: decision.cost,
                    ..Default::default()
                }),
                now,
            );
        }
    }

    fn end_trace_with_error(&self, decision: &Decision, error: &str, now: i64) {
        if let (Some(tracer), Some(trace_id)) = (&self.gate.tracer, &decision.trace_id) {
            tracer.end_trace(
                trace_id,
                Some(TraceSummary {
                    error: Some(error.to_string()),
                    ..Default::default()
                }),
                now,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitBreakerRegistry;
    use crate::core::gate::ToolCall;
    use crate::core::key_store::KeyRecord;
    use crate::core::limiter::{ConcurrencyLimiter, SlidingWindowLimiter};
    use crate::core::sandbox::SandboxManager;
    use crate::core::spend_cap::{SpendCapConfig, SpendCapManager};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct AlwaysSucceeds;
    impl BackendClient for AlwaysSucceeds {
        fn call(&self, _tool: &str, _payload: Value, _timeout: Duration) -> BackendFuture {
            Box::pin(async { BackendOutcome::Success(Value::Null) })
        }
    }

    struct AlwaysFails;
    impl BackendClient for AlwaysFails {
        fn call(&self, _tool: &str, _payload: Value, _timeout: Duration) -> BackendFuture {
            Box::pin(async { BackendOutcome::Failure("boom".into()) })
        }
    }

    struct FailsOnce {
        failed: Arc<AtomicBool>,
    }
    impl BackendClient for FailsOnce {
        fn call(&self, _tool: &str, _payload: Value, _timeout: Duration) -> BackendFuture {
            let failed = self.failed.clone();
            Box::pin(async move {
                if failed.swap(true, Ordering::SeqCst) {
                    BackendOutcome::Success(Value::Null)
                } else {
                    BackendOutcome::Failure("transient".into())
                }
            })
        }
    }

    fn gate() -> Gate {
        Gate {
            key_store: crate::core::key_store::KeyStore::new(),
            sandbox: SandboxManager::new(),
            sliding_window: SlidingWindowLimiter::new(0),
            token_bucket: None,
            concurrency: ConcurrencyLimiter::new(0, 0),
            spend_cap: SpendCapManager::new(SpendCapConfig::default()),
            circuit_breaker: CircuitBreakerRegistry::new(),
            tracer: None,
        }
    }

    fn retry_cfg() -> RetryConfig {
        RetryConfig {
            max_retries: 1,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            per_attempt_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn success_commits_debit() {
        let gate = gate();
        let mut rec = KeyRecord::new("alice");
        rec.credits = 100;
        gate.key_store.create_key("K".into(), rec);
        let meter = UsageMeter::new(100);
        let proxy = Proxy { gate: &gate, usage_meter: &meter };

        gate.concurrency.acquire("K", "search");
        let decision = Decision {
            allowed: true,
            cost: 5,
            reason: None,
            retry_after_ms: None,
            trace_id: None,
            acquired_concurrency: true,
            shadow: false,
            key_full: \"K\".into(),
            tool: "search".into(),
        };
        let result = proxy
            .execute(&decision, Value::Null, &AlwaysSucceeds, &CircuitBreakerConfig::default(), &retry_cfg(), 0)
            .await;
        assert!(result.allowed);

        let handle = gate.key_store.resolve("K").unwrap();
        assert_eq!(handle.lock().await.credits, 95);
        assert!(gate.concurrency.all_zero());
    }

    #[tokio::test]
    async fn backend_failure_rolls_back_and_releases() {
        let gate = gate();
        let mut rec = KeyRecord::new("alice");
        rec.credits = 100;
        rec.quota.daily_credit_limit = 1000;
        gate.key_store.create_key("K".into(), rec);
        let meter = UsageMeter::new(100);
        let proxy = Proxy { gate: &gate, usage_meter: &meter };

        gate.concurrency.acquire("K", "search");
        let decision = Decision {
            allowed: true,
            cost: 5,
            reason: None,
            retry_after_ms: None,
            trace_id: None,
            acquired_concurrency: true,
            shadow: false,
            key_full: \"K\".into(),
            tool: "search".into(),
        };
        let result = proxy
            .execute(&decision, Value::Null, &AlwaysFails, &CircuitBreakerConfig::default(), &retry_cfg(), 0)
            .await;
        assert!(!result.allowed);
        assert_eq!(result.deny_reason.as_deref(), Some("backend_error"));

        let handle = gate.key_store.resolve("K").unwrap();
        let rec = handle.lock().await;
        assert_eq!(rec.credits, 100);
        assert_eq!(rec.quota_counters.daily_credits, 0);
        assert!(gate.concurrency.all_zero());
    }

    #[tokio::test]
    async fn retries_succeed_after_transient_failure() {
        let gate = gate();
        let mut rec = KeyRecord::new("alice");
        rec.credits = 100;
        gate.key_store.create_key("K".into(), rec);
        let meter = UsageMeter::new(100);
        let proxy = Proxy { gate: &gate, usage_meter: &meter };

        gate.concurrency.acquire("K", "search");
        let decision = Decision {
            allowed: true,
            cost: 5,
            reason: None,
            retry_after_ms: None,
            trace_id: None,
            acquired_concurrency: true,
            shadow: false,
            key_full: \"K\".into(),
            tool: "search".into(),
        };
        let backend = FailsOnce { failed: Arc::new(AtomicBool::new(false)) };
        let result = proxy
            .execute(&decision, Value::Null, &backend, &CircuitBreakerConfig::default(), &retry_cfg(), 0)
            .await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn open_circuit_denies_without_calling_backend() {
        let gate = gate();
        let mut rec = KeyRecord::new("alice");
        rec.credits = 100;
        gate.key_store.create_key("K".into(), rec);
        let meter = UsageMeter::new(100);
        let cb_config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_duration_secs: 3600,
        };
        gate.circuit_breaker.record_failure("search", &cb_config);
        let proxy = Proxy { gate: &gate, usage_meter: &meter };

        gate.concurrency.acquire("K", "search");
        let decision = Decision {
            allowed: true,
            cost: 5,
            reason: None,
            retry_after_ms: None,
            trace_id: None,
            acquired_concurrency: true,
            shadow: false,
            key_full: \"K\".into(),
            tool: "search".into(),
        };
        let result = proxy.execute(&decision, Value::Null, &AlwaysFails, &cb_config, &retry_cfg(), 0).await;
        assert!(!result.allowed);
        assert_eq!(result.deny_reason.as_deref(), Some("circuit_open"));
        assert!(gate.concurrency.all_zero());
    }
}
