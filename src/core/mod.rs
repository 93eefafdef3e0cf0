pub mod alert;
pub mod audit;
pub mod calendar;
pub mod circuit_breaker;
pub mod gate;
pub mod key_store;
pub mod limiter;
pub mod policy;
pub mod proxy;
pub mod quota;
pub mod quota_rollover;
pub mod sandbox;
pub mod scheduler;
pub mod spend_cap;
pub mod tracer;
pub mod usage_meter;
pub mod webhook;

use std::sync::Arc;

use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use gate::{Gate, GateConfig};
use key_store::KeyStore;
use limiter::{ConcurrencyLimiter, SlidingWindowLimiter, TokenBucketLimiter};
use proxy::{Proxy, RetryConfig};
use quota_rollover::QuotaRolloverManager;
use sandbox::SandboxManager;
use scheduler::ActionQueue;
use spend_cap::SpendCapManager;
use tracer::otlp::OtlpEmitter;
use tracer::RequestTracer;
use usage_meter::UsageMeter;
use webhook::WebhookBatcher;

use alert::AlertEngine;
use audit::AuditTrail;

/// Aggregates every subsystem the admission pipeline and proxy executor
/// share, constructed once at boot and held behind an `Arc` by every
/// connection handler. `Gate::evaluate` and `Proxy::execute` borrow from
/// this; nothing here is per-request state.
pub struct Core {
    pub gate: Gate,
    pub gate_config: GateConfig,
    pub usage_meter: UsageMeter,
    pub audit: AuditTrail,
    pub alerts: AlertEngine,
    /// Keyed rollover-quota tracker, independent of the per-key daily/
    /// monthly counters on `KeyRecord`. Not wired into `Gate::evaluate` —
    /// it serves keys provisioned with a rollover arrangement, queried
    /// through the admin surface rather than checked on every call.
    pub rollover: QuotaRolloverManager,
    /// Admin-scheduled future key actions (suspend/revoke/grant), drained
    /// by the scheduler's periodic tick — see `scheduler::ActionQueue`.
    pub actions: ActionQueue,
    pub webhooks: Option<Arc<WebhookBatcher>>,
    pub otlp: Option<Arc<OtlpEmitter>>,
    pub circuit_breaker_config: CircuitBreakerConfig,
    pub retry_config: RetryConfig,
}

impl Core {
    /// Borrows a `Proxy` over this core's gate and usage meter. Cheap —
    /// callers construct one per request rather than storing it.
    pub fn proxy(&self) -> Proxy<'_> {
        Proxy {
            gate: &self.gate,
            usage_meter: &self.usage_meter,
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn build_core(
    gate_config: GateConfig,
    sliding_window_limit: u64,
    token_bucket: Option<(u64, u64, i64)>,
    concurrency: (u32, u32),
    spend_cap_config: spend_cap::SpendCapConfig,
    circuit_breaker_config: CircuitBreakerConfig,
    retry_config: RetryConfig,
    tracer_config: Option<tracer::TracerConfig>,
    otlp: Option<Arc<OtlpEmitter>>,
    webhooks: Option<Arc<WebhookBatcher>>,
    usage_max_events: usize,
    audit_max_entries: usize,
    alert_rules: Vec<alert::AlertRule>,
) -> Core {
    let tracer_instance = tracer_config.map(RequestTracer::new);

    let gate = Gate {
        key_store: KeyStore::new(),
        sandbox: SandboxManager::new(),
        sliding_window: SlidingWindowLimiter::new(sliding_window_limit),
        token_bucket: token_bucket.map(|(cap, rate, interval)| TokenBucketLimiter::new(cap, rate, interval)),
        concurrency: ConcurrencyLimiter::new(concurrency.0, concurrency.1),
        spend_cap: SpendCapManager::new(spend_cap_config),
        circuit_breaker: CircuitBreakerRegistry::new(),
        tracer: tracer_instance,
    };

    Core {
        gate,
        gate_config,
        usage_meter: UsageMeter::new(usage_max_events),
        audit: AuditTrail::new(audit_max_entries),
        alerts: AlertEngine::new(alert_rules),
        rollover: QuotaRolloverManager::new(),
        actions: ActionQueue::new(),
        webhooks,
        otlp,
        circuit_breaker_config,
        retry_config,
    }
}
