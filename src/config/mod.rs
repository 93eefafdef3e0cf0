pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — allowing the gateway to start with zero configuration for
    /// local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded gateway configuration");
        Ok(config)
    }

    /// Apply environment variable overrides, applied after file load so a
    /// deployment can override individual settings without templating the
    /// config file itself.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TOOLGATE_LISTEN") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("TOOLGATE_ADMIN_LISTEN") {
            self.admin_listen = v;
        }
        if let Ok(v) = std::env::var("TOOLGATE_BACKEND_URL") {
            self.backend.base_url = v;
        }
        if let Ok(v) = std::env::var("TOOLGATE_OTLP_ENDPOINT") {
            if let Some(otlp) = self.otlp.as_mut() {
                otlp.endpoint = v;
            }
        }
        if let Ok(v) = std::env::var("TOOLGATE_OTLP_AUTHORIZATION") {
            if let Some(otlp) = self.otlp.as_mut() {
                otlp.authorization = Some(v);
            }
        }
        if let Ok(v) = std::env::var("TOOLGATE_SCHEDULER_TICK_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.scheduler_tick_ms = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("listen is not a valid socket address: {}", self.listen);
        }
        if self.admin_listen.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("admin_listen is not a valid socket address: {}", self.admin_listen);
        }
        if self.backend.base_url.is_empty() {
            anyhow::bail!("backend.base_url must not be empty");
        }

        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be >= 1");
        }
        if self.circuit_breaker.success_threshold == 0 {
            anyhow::bail!("circuit_breaker.success_threshold must be >= 1");
        }

        for rule in &self.gate.policy_rules {
            match rule.effect.as_str() {
                "allow" | "deny" => {}
                other => anyhow::bail!("policy rule {}: invalid effect {:?}", rule.name, other),
            }
        }

        if let Some(tb) = &self.limits.token_bucket {
            if tb.capacity == 0 {
                anyhow::bail!("limits.token_bucket.capacity must be >= 1");
            }
        }

        match self.spend_cap.breach_action.as_str() {
            "deny" | "suspend" => {}
            other => anyhow::bail!("spend_cap.breach_action: invalid value {:?}", other),
        }

        for seed in &self.keys {
            if seed.name.is_empty() {
                anyhow::bail!("a key seed is missing a name");
            }
        }

        for alert in &self.alerts {
            match alert.kind.as_str() {
                "spending_threshold" | "credits_low" | "quota_warning" | "key_expiry_soon" | "rate_limit_spike" => {}
                other => anyhow::bail!("alert rule {}: unknown kind {:?}", alert.name, other),
            }
        }

        Ok(())
    }
}
