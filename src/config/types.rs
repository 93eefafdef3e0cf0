use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_audit_max_entries() -> usize {
    10_000
}

fn default_usage_max_events() -> usize {
    50_000
}

fn default_scheduler_tick_ms() -> u64 {
    1_000
}

/// Top-level gateway configuration. Loaded from TOML or JSON, then
/// layered with environment overrides — see `GatewayConfig::load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub gate: GateSection,

    #[serde(default)]
    pub limits: LimitsSection,

    #[serde(default)]
    pub spend_cap: SpendCapSection,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub tracer: TracerSection,

    #[serde(default)]
    pub otlp: Option<OtlpSection>,

    #[serde(default)]
    pub webhook: Option<WebhookSection>,

    #[serde(default = "default_audit_max_entries")]
    pub audit_max_entries: usize,

    #[serde(default = "default_usage_max_events")]
    pub usage_max_events: usize,

    #[serde(default)]
    pub alerts: Vec<AlertRuleSection>,

    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,

    /// Bootstrap key provisioning. The admin CRUD surface over keys is
    /// explicitly out of scope for this core — keys are seeded here at
    /// boot, the way a minimal standalone deployment provisions its
    /// first credentials before a real admin API exists.
    #[serde(default)]
    pub keys: Vec<KeySeed>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            backend: BackendConfig::default(),
            gate: GateSection::default(),
            limits: LimitsSection::default(),
            spend_cap: SpendCapSection::default(),
            circuit_breaker: CircuitBreakerSection::default(),
            retry: RetrySection::default(),
            tracer: TracerSection::default(),
            otlp: None,
            webhook: None,
            audit_max_entries: default_audit_max_entries(),
            usage_max_events: default_usage_max_events(),
            alerts: Vec::new(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            keys: Vec::new(),
        }
    }
}

fn default_backend_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

/// The tool backend(s) the proxy executor calls through. A single base
/// URL handles the common case of one tool server; `per_tool_url`
/// overrides it for tools that live on a different backend (and so get
/// their own circuit breaker, keyed by tool name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    #[serde(default)]
    pub per_tool_url: HashMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            base_url: default_backend_url(),
            per_tool_url: HashMap::new(),
        }
    }
}

fn default_policy_effect() -> String {
    "allow".to_string()
}

fn default_credits_per_call() -> u64 {
    1
}

/// Gate admission configuration: pricing, ACL scopes, the policy engine's
/// rule set, and sandbox ("try-before-buy") policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateSection {
    #[serde(default)]
    pub policy_rules: Vec<PolicyRuleConfig>,

    #[serde(default = "default_policy_effect")]
    pub policy_default_effect: String,

    #[serde(default)]
    pub tool_scopes: HashMap<String, String>,

    #[serde(default)]
    pub tool_pricing: HashMap<String, ToolPricingConfig>,

    #[serde(default = "default_credits_per_call")]
    pub default_credits_per_call: u64,

    #[serde(default)]
    pub global_shadow_mode: bool,

    #[serde(default)]
    pub sandbox_policies: Vec<SandboxPolicyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPricingConfig {
    #[serde(default)]
    pub credits_per_call: u64,
    #[serde(default)]
    pub credits_per_kb_input: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRuleConfig {
    pub name: String,
    /// "allow" or "deny".
    pub effect: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    /// Millis-of-day after which the rule applies.
    #[serde(default)]
    pub after_ms: Option<i64>,
    /// Millis-of-day before which the rule applies.
    #[serde(default)]
    pub before_ms: Option<i64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicyConfig {
    pub name: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub window_ms: i64,
    #[serde(default)]
    pub window_call_cap: u64,
}

/// Per-key bootstrap provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySeed {
    /// The full bearer key. Generated (and logged once) if omitted.
    #[serde(default)]
    pub full_key: Option<String>,
    pub name: String,
    #[serde(default)]
    pub credits: i64,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub sandbox_policy: Option<String>,
    #[serde(default)]
    pub spending_limit: Option<u64>,
    #[serde(default)]
    pub shadow_mode: bool,
    #[serde(default)]
    pub allow_negative_balance: bool,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub quota: QuotaSeed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaSeed {
    #[serde(default)]
    pub daily_call_limit: u64,
    #[serde(default)]
    pub monthly_call_limit: u64,
    #[serde(default)]
    pub daily_credit_limit: u64,
    #[serde(default)]
    pub monthly_credit_limit: u64,
    #[serde(default)]
    pub hourly_call_limit: u64,
    #[serde(default)]
    pub hourly_credit_limit: u64,
}

fn default_token_bucket_interval_ms() -> i64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketSection {
    pub capacity: u64,
    pub refill_rate: u64,
    #[serde(default = "default_token_bucket_interval_ms")]
    pub interval_ms: i64,
}

fn default_concurrency_limit() -> u32 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencySection {
    #[serde(default = "default_concurrency_limit")]
    pub per_key: u32,
    #[serde(default = "default_concurrency_limit")]
    pub per_tool: u32,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        ConcurrencySection { per_key: 0, per_tool: 0 }
    }
}

/// L1 limiter family configuration. `0` / absent consistently means
/// "no limit", per the data model's closed-set convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    #[serde(default)]
    pub sliding_window_per_minute: u64,
    #[serde(default)]
    pub token_bucket: Option<TokenBucketSection>,
    #[serde(default)]
    pub concurrency: ConcurrencySection,
}

impl Default for LimitsSection {
    fn default() -> Self {
        LimitsSection {
            sliding_window_per_minute: 0,
            token_bucket: None,
            concurrency: ConcurrencySection::default(),
        }
    }
}

fn default_breach_action() -> String {
    "deny".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendCapSection {
    #[serde(default)]
    pub server_daily_call_cap: u64,
    #[serde(default)]
    pub server_daily_credit_cap: u64,
    #[serde(default = "default_breach_action")]
    pub breach_action: String,
    #[serde(default)]
    pub auto_resume_after_secs: u64,
}

impl Default for SpendCapSection {
    fn default() -> Self {
        SpendCapSection {
            server_daily_call_cap: 0,
            server_daily_credit_cap: 0,
            breach_action: default_breach_action(),
            auto_resume_after_secs: 0,
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_duration_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_duration_secs")]
    pub open_duration_secs: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        CircuitBreakerSection {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration_secs: default_open_duration_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_per_attempt_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        RetrySection {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
        }
    }
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_max_traces() -> usize {
    10_000
}

fn default_max_trace_age_ms() -> i64 {
    3_600_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerSection {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    #[serde(default = "default_max_traces")]
    pub max_traces: usize,
    #[serde(default = "default_max_trace_age_ms")]
    pub max_age_ms: i64,
}

impl Default for TracerSection {
    fn default() -> Self {
        TracerSection {
            sample_rate: default_sample_rate(),
            max_traces: default_max_traces(),
            max_age_ms: default_max_trace_age_ms(),
        }
    }
}

fn default_otlp_batch_size() -> usize {
    100
}

fn default_otlp_flush_interval_ms() -> u64 {
    5_000
}

fn default_otlp_queue_size() -> usize {
    10_000
}

fn default_service_name() -> String {
    "toolgate".to_string()
}

fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtlpSection {
    pub endpoint: String,
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_service_version")]
    pub service_version: String,
    #[serde(default = "default_otlp_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_otlp_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_otlp_queue_size")]
    pub max_queue_size: usize,
}

fn default_webhook_batch_size() -> usize {
    20
}

fn default_webhook_queue_size() -> usize {
    5_000
}

fn default_webhook_flush_interval_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSection {
    /// Target URLs notified of lifecycle events (key suspended, quota
    /// breach, auto-resume, ...).
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "default_webhook_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_webhook_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_webhook_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleSection {
    pub name: String,
    /// One of "spending_threshold", "credits_low", "quota_warning",
    /// "key_expiry_soon", "rate_limit_spike".
    pub kind: String,
    /// Interpreted per `kind`: a percent for the threshold rules, a
    /// credit amount for `credits_low`, a second count for
    /// `key_expiry_soon`, a denial count for `rate_limit_spike`.
    pub threshold: i64,
    #[serde(default)]
    pub cooldown_ms: i64,
    #[serde(default)]
    pub dry_run: bool,
}
