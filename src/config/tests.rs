use super::types::*;
use super::GatewayConfig;
use std::path::Path;

#[test]
fn defaults_are_permissive() {
    let cfg = GatewayConfig::default();
    assert_eq!(cfg.listen, "0.0.0.0:8080");
    assert_eq!(cfg.admin_listen, "0.0.0.0:9091");
    assert_eq!(cfg.limits.sliding_window_per_minute, 0);
    assert!(cfg.limits.token_bucket.is_none());
    assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
    assert_eq!(cfg.spend_cap.breach_action, "deny");
    assert!(cfg.keys.is_empty());
}

#[test]
fn load_missing_file_falls_back_to_defaults() {
    let cfg = GatewayConfig::load(Path::new("/nonexistent/toolgate.toml")).unwrap();
    assert_eq!(cfg.listen, default_listen_for_test());
}

fn default_listen_for_test() -> String {
    GatewayConfig::default().listen
}

#[test]
fn load_json_config() {
    let json = r#"{
        "listen": "127.0.0.1:9000",
        "backend": { "base_url": "http://127.0.0.1:9500" },
        "limits": { "sliding_window_per_minute": 60 },
        "keys": [{ "name": "alpha", "credits": 1000 }]
    }"#;
    let tmp = std::env::temp_dir().join("toolgate_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.listen, "127.0.0.1:9000");
    assert_eq!(cfg.backend.base_url, "http://127.0.0.1:9500");
    assert_eq!(cfg.limits.sliding_window_per_minute, 60);
    assert_eq!(cfg.keys.len(), 1);
    assert_eq!(cfg.keys[0].name, "alpha");
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn validate_rejects_invalid_listen_address() {
    let mut cfg = GatewayConfig::default();
    cfg.listen = "not-an-address".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_empty_backend_url() {
    let mut cfg = GatewayConfig::default();
    cfg.backend.base_url = String::new();
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_zero_circuit_breaker_threshold() {
    let mut cfg = GatewayConfig::default();
    cfg.circuit_breaker.failure_threshold = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_unknown_policy_effect() {
    let mut cfg = GatewayConfig::default();
    cfg.gate.policy_rules.push(PolicyRuleConfig {
        name: "weird".into(),
        effect: "maybe".into(),
        priority: 0,
        enabled: true,
        tool: None,
        key: None,
        ip: None,
        after_ms: None,
        before_ms: None,
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_zero_capacity_token_bucket() {
    let mut cfg = GatewayConfig::default();
    cfg.limits.token_bucket = Some(TokenBucketSection {
        capacity: 0,
        refill_rate: 10,
        interval_ms: 1000,
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_unknown_breach_action() {
    let mut cfg = GatewayConfig::default();
    cfg.spend_cap.breach_action = "ignore".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_unnamed_key_seed() {
    let mut cfg = GatewayConfig::default();
    cfg.keys.push(KeySeed {
        full_key: None,
        name: String::new(),
        credits: 0,
        allowed_tools: vec![],
        denied_tools: vec![],
        scopes: vec![],
        namespace: None,
        group: None,
        tags: Default::default(),
        sandbox_policy: None,
        spending_limit: None,
        shadow_mode: false,
        allow_negative_balance: false,
        expires_at: None,
        quota: QuotaSeed::default(),
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_unknown_alert_kind() {
    let mut cfg = GatewayConfig::default();
    cfg.alerts.push(AlertRuleSection {
        name: "weird".into(),
        kind: "not_a_real_kind".into(),
        threshold: 10,
        cooldown_ms: 0,
        dry_run: false,
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_accepts_well_formed_config() {
    let mut cfg = GatewayConfig::default();
    cfg.keys.push(KeySeed {
        full_key: None,
        name: "alpha".into(),
        credits: 1000,
        allowed_tools: vec![],
        denied_tools: vec![],
        scopes: vec![],
        namespace: None,
        group: None,
        tags: Default::default(),
        sandbox_policy: None,
        spending_limit: None,
        shadow_mode: false,
        allow_negative_balance: false,
        expires_at: None,
        quota: QuotaSeed::default(),
    });
    assert!(cfg.validate().is_ok());
}

#[test]
fn toml_deserialize_fills_in_defaults() {
    let toml_str = r#"
listen = "127.0.0.1:8080"

[backend]
base_url = "http://backend.internal:9000"
"#;
    let cfg: GatewayConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(cfg.listen, "127.0.0.1:8080");
    assert_eq!(cfg.backend.base_url, "http://backend.internal:9000");
    assert_eq!(cfg.audit_max_entries, 10_000);
    assert_eq!(cfg.usage_max_events, 50_000);
    assert_eq!(cfg.scheduler_tick_ms, 1_000);
}

#[test]
fn token_bucket_section_serde() {
    let json = r#"{"capacity": 100, "refill_rate": 10, "interval_ms": 1000}"#;
    let tb: TokenBucketSection = serde_json::from_str(json).unwrap();
    assert_eq!(tb.capacity, 100);
    assert_eq!(tb.refill_rate, 10);
    assert_eq!(tb.interval_ms, 1000);
}

#[test]
fn unsupported_format_is_rejected() {
    let tmp = std::env::temp_dir().join("toolgate_test.yml");
    std::fs::write(&tmp, "key: value").unwrap();
    assert!(GatewayConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}
