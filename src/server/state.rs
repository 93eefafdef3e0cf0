use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;

use crate::config::GatewayConfig;
use crate::core::alert::AlertRule;
use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::gate::{GateConfig, ToolPricing};
use crate::core::policy::{Conditions, Effect, PolicyRule};
use crate::core::proxy::{BackendClient, RetryConfig};
use crate::core::sandbox::SandboxPolicy;
use crate::core::spend_cap::{BreachAction, SpendCapConfig};
use crate::core::tracer::otlp::{OtlpConfig, OtlpEmitter};
use crate::core::tracer::TracerConfig;
use crate::core::webhook::WebhookBatcher;
use crate::core::{build_core, key_store::KeyRecord, Core};
use crate::metrics::Metrics;
use crate::proxy::HttpBackendClient;
use crate::server::webhook_sink::HttpWebhookSink;

/// Shared gateway state, cheaply cloneable. `core` holds every admission
/// subsystem; `config` is the loaded configuration behind an `ArcSwap` so
/// a future admin-triggered reload can swap it without blocking readers.
#[derive(Clone)]
pub struct GatewayState {
    pub core: Arc<Core>,
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub backend: Arc<dyn BackendClient>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let metrics = Metrics::install();

        let backend = Arc::new(HttpBackendClient::new(
            config.backend.base_url.clone(),
            config.backend.per_tool_url.clone(),
        ));

        let core = build_core_from_config(&config);

        for seed in &config.keys {
            let full_key = seed
                .full_key
                .clone()
                .unwrap_or_else(|| crate::core::key_store::generate_key("tg"));

            let mut record = KeyRecord::new(seed.name.clone());
            record.credits = seed.credits;
            record.allowed_tools = seed.allowed_tools.iter().cloned().collect();
            record.denied_tools = seed.denied_tools.iter().cloned().collect();
            record.scopes = seed.scopes.iter().cloned().collect();
            record.namespace = seed.namespace.clone();
            record.group = seed.group.clone();
            record.tags = seed.tags.clone();
            record.sandbox_policy = seed.sandbox_policy.clone();
            record.spending_limit = seed.spending_limit;
            record.shadow_mode = seed.shadow_mode;
            record.allow_negative_balance = seed.allow_negative_balance;
            record.expires_at = seed.expires_at;
            record.quota.daily_call_limit = seed.quota.daily_call_limit;
            record.quota.monthly_call_limit = seed.quota.monthly_call_limit;
            record.quota.daily_credit_limit = seed.quota.daily_credit_limit;
            record.quota.monthly_credit_limit = seed.quota.monthly_credit_limit;
            record.quota.hourly_call_limit = seed.quota.hourly_call_limit;
            record.quota.hourly_credit_limit = seed.quota.hourly_credit_limit;

            tracing::info!(key_name = %seed.name, "keys: seeded from config");
            core.gate.key_store.create_key(full_key, record);
        }

        for policy in &config.gate.sandbox_policies {
            core.gate.sandbox.register(SandboxPolicy {
                name: policy.name.clone(),
                allowed_tools: policy.allowed_tools.iter().cloned().collect(),
                denied_tools: policy.denied_tools.iter().cloned().collect(),
                window_ms: policy.window_ms,
                window_call_cap: policy.window_call_cap,
            });
        }

        Ok(GatewayState {
            core: Arc::new(core),
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            backend,
        })
    }
}

fn build_core_from_config(config: &GatewayConfig) -> Core {
    let gate_config = GateConfig {
        policy_rules: config
            .gate
            .policy_rules
            .iter()
            .map(|r| PolicyRule {
                name: r.name.clone(),
                effect: if r.effect == "deny" { Effect::Deny } else { Effect::Allow },
                priority: r.priority,
                enabled: r.enabled,
                conditions: Conditions {
                    tool: r.tool.clone(),
                    key: r.key.clone(),
                    ip: r.ip.clone(),
                    after: r.after_ms,
                    before: r.before_ms,
                },
            })
            .collect(),
        policy_default_effect: if config.gate.policy_default_effect == "deny" {
            Effect::Deny
        } else {
            Effect::Allow
        },
        tool_scopes: config.gate.tool_scopes.clone(),
        tool_pricing: config
            .gate
            .tool_pricing
            .iter()
            .map(|(tool, p)| {
                (
                    tool.clone(),
                    ToolPricing {
                        credits_per_call: p.credits_per_call,
                        credits_per_kb_input: p.credits_per_kb_input,
                    },
                )
            })
            .collect(),
        default_credits_per_call: config.gate.default_credits_per_call,
        global_shadow_mode: config.gate.global_shadow_mode,
    };

    let token_bucket = config
        .limits
        .token_bucket
        .as_ref()
        .map(|tb| (tb.capacity, tb.refill_rate, tb.interval_ms));

    let spend_cap_config = SpendCapConfig {
        server_daily_call_cap: config.spend_cap.server_daily_call_cap,
        server_daily_credit_cap: config.spend_cap.server_daily_credit_cap,
        breach_action: if config.spend_cap.breach_action == "suspend" {
            BreachAction::Suspend
        } else {
            BreachAction::Deny
        },
        auto_resume_after_secs: config.spend_cap.auto_resume_after_secs,
    };

    let circuit_breaker_config = CircuitBreakerConfig {
        failure_threshold: config.circuit_breaker.failure_threshold,
        success_threshold: config.circuit_breaker.success_threshold,
        open_duration_secs: config.circuit_breaker.open_duration_secs,
    };

    let retry_config = RetryConfig {
        max_retries: config.retry.max_retries,
        base_backoff_ms: config.retry.base_backoff_ms,
        max_backoff_ms: config.retry.max_backoff_ms,
        per_attempt_timeout: std::time::Duration::from_millis(config.retry.per_attempt_timeout_ms),
    };

    let tracer_config = Some(TracerConfig {
        sample_rate: config.tracer.sample_rate,
        max_traces: config.tracer.max_traces,
        max_age_ms: config.tracer.max_age_ms,
    });

    let otlp: Option<Arc<OtlpEmitter>> = config.otlp.as_ref().map(|o| {
        Arc::new(OtlpEmitter::new(
            OtlpConfig {
                endpoint: o.endpoint.clone(),
                authorization: o.authorization.clone(),
                service_name: o.service_name.clone(),
                service_version: o.service_version.clone(),
                max_batch_size: o.max_batch_size,
                flush_interval_ms: o.flush_interval_ms,
            },
            o.max_queue_size,
        ))
    });

    let webhooks: Option<Arc<WebhookBatcher>> = config.webhook.as_ref().map(|w| {
        Arc::new(WebhookBatcher::new(
            Arc::new(HttpWebhookSink::new()),
            w.max_batch_size,
            w.max_queue_size,
        ))
    });

    let alert_rules: Vec<AlertRule> = config
        .alerts
        .iter()
        .map(|a| AlertRule {
            name: a.name.clone(),
            kind: parse_rule_kind(&a.kind, a.threshold),
            cooldown_ms: a.cooldown_ms,
            dry_run: a.dry_run,
        })
        .collect();

    build_core(
        gate_config,
        config.limits.sliding_window_per_minute,
        token_bucket,
        (config.limits.concurrency.per_key, config.limits.concurrency.per_tool),
        spend_cap_config,
        circuit_breaker_config,
        retry_config,
        tracer_config,
        otlp,
        webhooks,
        config.usage_max_events,
        config.audit_max_entries,
        alert_rules,
    )
}

fn parse_rule_kind(kind: &str, threshold: i64) -> crate::core::alert::RuleKind {
    use crate::core::alert::RuleKind;
    match kind {
        "spending_threshold" => RuleKind::SpendingThreshold { threshold_percent: threshold.clamp(0, 100) as u32 },
        "credits_low" => RuleKind::CreditsLow { threshold },
        "quota_warning" => RuleKind::QuotaWarning { threshold_percent: threshold.clamp(0, 100) as u32 },
        "key_expiry_soon" => RuleKind::KeyExpirySoon { threshold_secs: threshold.max(0) },
        "rate_limit_spike" => RuleKind::RateLimitSpike { threshold: threshold.max(0) as u64 },
        _ => RuleKind::CreditsLow { threshold },
    }
}
