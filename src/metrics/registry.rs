use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // connections
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        // admission pipeline
        describe_counter!(
            "gateway_admission_total",
            Unit::Count,
            "Total tool calls evaluated by the gate, by result (allowed/denied)"
        );
        describe_counter!(
            "gateway_admission_denied_total",
            Unit::Count,
            "Total admission denials, by reason"
        );
        describe_counter!(
            "gateway_credits_debited_total",
            Unit::Count,
            "Total credits committed on backend success"
        );
        describe_histogram!(
            "gateway_backend_duration_seconds",
            Unit::Seconds,
            "Backend call duration from the proxy executor's perspective"
        );
        describe_counter!(
            "gateway_backend_retries_total",
            Unit::Count,
            "Total backend retry attempts"
        );

        // rate limiting
        describe_counter!(
            "gateway_rate_limit_rejected_total",
            Unit::Count,
            "Total requests rejected by a rate limiter (sliding window or token bucket)"
        );

        // circuit breaker
        describe_counter!(
            "gateway_circuit_breaker_rejected_total",
            Unit::Count,
            "Total requests rejected by the circuit breaker"
        );
        describe_gauge!(
            "gateway_circuit_breaker_open",
            Unit::Count,
            "Circuit breaker state per backend: 1=open 0=closed/half-open"
        );

        // audit / usage / webhook
        describe_gauge!(
            "gateway_audit_entries_total",
            Unit::Count,
            "Number of audit trail entries currently retained"
        );
        describe_gauge!(
            "gateway_usage_events_total",
            Unit::Count,
            "Number of usage events currently retained"
        );
        describe_counter!(
            "gateway_webhook_delivery_failed_total",
            Unit::Count,
            "Total webhook deliveries that failed"
        );
        describe_counter!(
            "gateway_alerts_fired_total",
            Unit::Count,
            "Total alerts fired by the alert engine"
        );

        // config
        describe_counter!(
            "gateway_config_reloads_total",
            Unit::Count,
            "Config reload events"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
