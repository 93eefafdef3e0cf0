use std::collections::HashMap;

use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::key_store::{KeyRecord, KeyStore};
use crate::core::limiter::{ConcurrencyLimiter, SlidingWindowLimiter, TokenBucketLimiter, WindowResult, BucketResult};
use crate::core::policy::{self, Effect, PolicyContext, PolicyRule};
use crate::core::quota;
use crate::core::sandbox::SandboxManager;
use crate::core::spend_cap::SpendCapManager;
use crate::core::tracer::RequestTracer;
use crate::error::DenyReason;

/// One inbound tool call as seen by the gate, ahead of any admission
/// decision.
pub struct ToolCall<'a> {
    pub tool: &'a str,
    pub input_bytes: usize,
    pub ip: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ToolPricing {
    pub credits_per_call: u64,
    pub credits_per_kb_input: u64,
}

/// Configuration shared across every `evaluate` call — everything that is
/// not per-key state.
pub struct GateConfig {
    pub policy_rules: Vec<PolicyRule>,
    pub policy_default_effect: Effect,
    pub tool_scopes: HashMap<String, String>,
    pub tool_pricing: HashMap<String, ToolPricing>,
    pub default_credits_per_call: u64,
    pub global_shadow_mode: bool,
}

/// The structured result of `Gate::evaluate`. Never an `Err` for a normal
/// denial — admission outcomes are always a `Decision` value.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub cost: u64,
    pub reason: Option<String>,
    pub retry_after_ms: Option<i64>,
    pub trace_id: Option<String>,
    pub acquired_concurrency: bool,
    /// True when this is an `allowed` decision only because shadow mode
    /// swallowed a denial — `Proxy::execute` must still meter it as
    /// allowed but must not debit credits or commit quota/spend-cap
    /// counters for it.
    pub shadow: bool,
    pub key_full: String,
    pub tool: String,
}

impl Decision {
    fn denied(key_full: &str, tool: &str, reason: DenyReason, retry_after_ms: Option<i64>) -> Self {
        Decision {
            allowed: false,
            cost: 0,
            reason: Some(reason.to_string()),
            retry_after_ms,
            trace_id: None,
            acquired_concurrency: false,
            shadow: false,
            key_full: key_full.to_string(),
            tool: tool.to_string(),
        }
    }
}

/// Composes every L1/L2 check, in the exact order the spec requires, into
/// one `Decision`. Holds no per-call mutable state of its own — all
/// mutation happens on the `KeyRecord` behind its `KeyStore` lock, or on
/// the shared L1 subsystems passed in at construction.
pub struct Gate {
    pub key_store: KeyStore,
    pub sandbox: SandboxManager,
    pub sliding_window: SlidingWindowLimiter,
    pub token_bucket: Option<TokenBucketLimiter>,
    pub concurrency: ConcurrencyLimiter,
    pub spend_cap: SpendCapManager,
    pub circuit_breaker: CircuitBreakerRegistry,
    pub tracer: Option<RequestTracer>,
}

/// Swallows a denial into the running shadow reason when `shadow` is
/// true, letting evaluation continue through every remaining check;
/// otherwise propagates it so the caller short-circuits via `?`.
fn gate_step(
    result: Result<(), DenyReason>,
    shadow: bool,
    shadow_reason: &mut Option<DenyReason>,
) -> Result<(), DenyReason> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if shadow {
                if shadow_reason.is_none() {
                    *shadow_reason = Some(e);
                }
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

impl Gate {
    pub async fn evaluate(&self, config: &GateConfig, identifier: &str, call: &ToolCall<'_>, now: i64) -> Decision {
        let key_full = identifier.to_string();

        let Some(handle) = self.key_store.resolve(identifier) else {
            return Decision::denied(&key_full, call.tool, DenyReason::InvalidApiKey, None);
        };
        let mut rec = handle.lock().await;

        if !rec.active {
            return Decision::denied(&key_full, call.tool, DenyReason::KeyRevoked, None);
        }
        if rec.suspended || self.spend_cap.is_auto_suspended(&key_full, now) {
            return Decision::denied(&key_full, call.tool, DenyReason::KeySuspended, None);
        }
        if let Some(expires_at) = rec.expires_at {
            if now >= expires_at {
                return Decision::denied(&key_full, call.tool, DenyReason::KeyExpired, None);
            }
        }

        let shadow = config.global_shadow_mode || rec.shadow_mode;
        let mut shadow_reason: Option<DenyReason> = None;
        let mut retry_after_ms: Option<i64> = None;
        let mut acquired_concurrency = false;

        if let Err(e) = self
            .run_checks(
                config,
                &mut rec,
                &key_full,
                call,
                shadow,
                &mut shadow_reason,
                &mut retry_after_ms,
                &mut acquired_concurrency,
                now,
            )
            .await
        {
            return Decision::denied(&key_full, call.tool, e, retry_after_ms);
        }

        let cost = price_call(config, call);
        let trace_id = self
            .tracer
            .as_ref()
            .and_then(|t| t.start_trace(&key_full, "tools/call", call.tool, Some(KeyRecord::display_prefix(&key_full)), None, now));

        if let Some(t) = &self.tracer {
            if let Some(tid) = &trace_id {
                t.set_tool(tid, call.tool);
            }
        }

        let shadow_converted = shadow_reason.is_some();
        Decision {
            allowed: true,
            cost,
            reason: shadow_reason.map(|r| r.shadow()),
            retry_after_ms: None,
            trace_id,
            acquired_concurrency,
            shadow: shadow_converted,
            key_full,
            tool: call.tool.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_checks(
        &self,
        config: &GateConfig,
        rec: &mut KeyRecord,
        key_full: &str,
        call: &ToolCall<'_>,
        shadow: bool,
        shadow_reason: &mut Option<DenyReason>,
        retry_after_ms: &mut Option<i64>,
        acquired_concurrency: &mut bool,
        now: i64,
    ) -> Result<(), DenyReason> {
        if let Some(policy_name) = rec.sandbox_policy.clone() {
            gate_step(
                self.sandbox.check(&policy_name, key_full, call.tool, now),
                shadow,
                shadow_reason,
            )?;
        }

        let acl_result = if rec.denied_tools.contains(call.tool) {
            Err(DenyReason::ToolDenied(call.tool.to_string()))
        } else if !rec.allowed_tools.is_empty() && !rec.allowed_tools.contains(call.tool) {
            Err(DenyReason::ToolNotAllowed(call.tool.to_string()))
        } else {
            Ok(())
        };
        gate_step(acl_result, shadow, shadow_reason)?;

        if let Some(required_scope) = config.tool_scopes.get(call.tool) {
            let scope_result = if rec.scopes.contains(required_scope) {
                Ok(())
            } else {
                Err(DenyReason::ScopeMissing(required_scope.clone()))
            };
            gate_step(scope_result, shadow, shadow_reason)?;
        }

        let ctx = PolicyContext {
            tool: call.tool,
            key: key_full,
            ip: call.ip,
            time_of_day_ms: now.rem_euclid(86_400_000),
        };
        let policy_decision = policy::evaluate(&config.policy_rules, &ctx, config.policy_default_effect);
        let policy_result = match policy_decision.effect {
            Effect::Allow => Ok(()),
            Effect::Deny => Err(DenyReason::PolicyDenied(
                policy_decision.winning_rule.unwrap_or_else(|| "default".to_string()),
            )),
        };
        gate_step(policy_result, shadow, shadow_reason)?;

        let cost = price_call(config, call);

        if !rec.allow_negative_balance {
            let credits_result = if rec.credits >= cost as i64 { Ok(()) } else { Err(DenyReason::InsufficientCredits) };
            gate_step(credits_result, shadow, shadow_reason)?;
        }

        if let Some(limit) = rec.spending_limit {
            let spend_result = if rec.total_spent + cost <= limit {
                Ok(())
            } else {
                Err(DenyReason::SpendingLimitExceeded)
            };
            gate_step(spend_result, shadow, shadow_reason)?;
        }

        gate_step(quota::check(rec, cost, now), shadow, shadow_reason)?;

        let hourly_result = self.spend_cap.check_hourly_cap(key_full, cost, &rec.quota, now);
        if hourly_result.is_err() {
            self.spend_cap.maybe_suspend(key_full, now);
        }
        gate_step(hourly_result, shadow, shadow_reason)?;

        let server_result = self.spend_cap.check_server_cap(cost, now);
        if server_result.is_err() {
            self.spend_cap.maybe_suspend(key_full, now);
        }
        gate_step(server_result, shadow, shadow_reason)?;

        let window_key = format!("{}:{}", key_full, call.tool);
        let window_result = match self.sliding_window.check(&window_key, now).await {
            WindowResult::Allowed { .. } => Ok(()),
            WindowResult::Denied { retry_after_ms: ra } => {
                retry_after_ms.get_or_insert(ra);
                Err(DenyReason::RateLimited)
            }
        };
        gate_step(window_result, shadow, shadow_reason)?;

        if let Some(bucket) = &self.token_bucket {
            let bucket_result = match bucket.consume(key_full, 1, now).await {
                BucketResult::Allowed { .. } => Ok(()),
                BucketResult::Denied { retry_after_ms: ra } => {
                    retry_after_ms.get_or_insert(ra);
                    Err(DenyReason::TokenBucketExhausted)
                }
            };
            gate_step(bucket_result, shadow, shadow_reason)?;
        }

        let acquired = self.concurrency.acquire(key_full, call.tool);
        *acquired_concurrency = acquired;
        let concurrency_result = if acquired { Ok(()) } else { Err(DenyReason::ConcurrencyLimit) };
        gate_step(concurrency_result, shadow, shadow_reason)?;

        Ok(())
    }
}

fn price_call(config: &GateConfig, call: &ToolCall<'_>) -> u64 {
    let kb = (call.input_bytes as u64).div_ceil(1024);
    match config.tool_pricing.get(call.tool) {
        Some(pricing) => pricing.credits_per_call + kb * pricing.credits_per_kb_input,
        None => config.default_credits_per_call,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key_store::QuotaConfig;
    use crate::core::spend_cap::SpendCapConfig;

    fn gate() -> Gate {
        Gate {
            key_store: KeyStore::new(),
            sandbox: SandboxManager::new(),
            sliding_window: SlidingWindowLimiter::new(0),
            token_bucket: None,
            concurrency: ConcurrencyLimiter::new(0, 0),
            spend_cap: SpendCapManager::new(SpendCapConfig::default()),
            circuit_breaker: CircuitBreakerRegistry::new(),
            tracer: None,
        }
    }

    fn config() -> GateConfig {
        GateConfig {
            policy_rules: Vec::new(),
            policy_default_effect: Effect::Allow,
            tool_scopes: HashMap::new(),
            tool_pricing: HashMap::new(),
            default_credits_per_call: 5,
            global_shadow_mode: false,
        }
    }

    fn call<'a>(tool: &'a str) -> ToolCall<'a> {
        ToolCall { tool, input_bytes: 0, ip: None }
    }

    #[tokio::test]
    async fn basic_accept_path() {
        let gate = gate();
        let mut rec = KeyRecord::new("alice");
        rec.credits = 100;
        gate.key_store.create_key("K".into(), rec);

        let decision = gate.evaluate(&config(), "K", &call("search"), 0).await;
        assert!(decision.allowed);
        assert_eq!(decision.cost, 5);
    }

    #[tokio::test]
    async fn insufficient_credits_denies() {
        let gate = gate();
        let mut rec = KeyRecord::new("alice");
        rec.credits = 3;
        gate.key_store.create_key("K".into(), rec);

        let decision = gate.evaluate(&config(), "K", &call("search"), 0).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("insufficient_credits"));
    }

    #[tokio::test]
    async fn acl_whitelist_denies_other_tools() {
        let gate = gate();
        let mut rec = KeyRecord::new("alice");
        rec.credits = 100;
        rec.allowed_tools = ["search".to_string(), "gen".to_string()].into_iter().collect();
        gate.key_store.create_key("K".into(), rec);

        let decision = gate.evaluate(&config(), "K", &call("delete"), 0).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("tool_not_allowed:delete"));
    }

    #[tokio::test]
    async fn rate_limit_denies_third_call() {
        let gate = Gate {
            sliding_window: SlidingWindowLimiter::new(2),
            ..gate()
        };
        let mut rec = KeyRecord::new("alice");
        rec.credits = 100;
        gate.key_store.create_key("K".into(), rec);

        assert!(gate.evaluate(&config(), "K", &call("search"), 0).await.allowed);
        assert!(gate.evaluate(&config(), "K", &call("search"), 1).await.allowed);
        let third = gate.evaluate(&config(), "K", &call("search"), 2).await;
        assert!(!third.allowed);
        assert_eq!(third.reason.as_deref(), Some("rate_limited"));
    }

    #[tokio::test]
    async fn shadow_mode_converts_denial_to_allowed() {
        let gate = gate();
        let mut rec = KeyRecord::new("alice");
        rec.credits = 3;
        rec.shadow_mode = true;
        gate.key_store.create_key("K".into(), rec);

        let decision = gate.evaluate(&config(), "K", &call("search"), 0).await;
        assert!(decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("shadow:insufficient_credits"));
    }

    #[tokio::test]
    async fn suspended_key_denies() {
        let gate = gate();
        let mut rec = KeyRecord::new("alice");
        rec.credits = 100;
        rec.suspended = true;
        gate.key_store.create_key("K".into(), rec);

        let decision = gate.evaluate(&config(), "K", &call("search"), 0).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("key_suspended"));
    }
}
