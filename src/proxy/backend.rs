use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};

use crate::core::proxy::{BackendClient, BackendFuture, BackendOutcome};

/// Calls a JSON-RPC tool server over HTTP via `reqwest`. One `base_url`
/// handles the common case of a single backend; `per_tool_url` sends
/// specific tools to a different host, each keyed independently by the
/// circuit breaker (which is keyed by tool name, not URL).
pub struct HttpBackendClient {
    client: reqwest::Client,
    base_url: String,
    per_tool_url: HashMap<String, String>,
}

impl HttpBackendClient {
    pub fn new(base_url: String, per_tool_url: HashMap<String, String>) -> Self {
        HttpBackendClient {
            client: reqwest::Client::new(),
            base_url,
            per_tool_url,
        }
    }

    fn target_url(&self, tool: &str) -> &str {
        self.per_tool_url.get(tool).unwrap_or(&self.base_url)
    }
}

impl BackendClient for HttpBackendClient {
    fn call(&self, tool: &str, payload: Value, timeout: Duration) -> BackendFuture {
        let url = self.target_url(tool).to_string();
        let tool = tool.to_string();
        let client = self.client.clone();

        Box::pin(async move {
            let body = json!({
                "jsonrpc": "2.0",
                "method": tool,
                "params": payload,
                "id": 1,
            });

            let resp = match client.post(&url).timeout(timeout).json(&body).send().await {
                Ok(r) => r,
                Err(e) => return BackendOutcome::Failure(e.to_string()),
            };

            let status = resp.status();

            // 4xx counts as a contacted backend: a committed, non-retried
            // charge, per the spec's retry policy. 5xx and network errors
            // are retryable.
            if status.is_client_error() {
                let details = match resp.json::<Value>().await {
                    Ok(v) => v,
                    Err(_) => json!({"status": status.as_u16()}),
                };
                return BackendOutcome::ClientError(details);
            }
            if !status.is_success() {
                return BackendOutcome::Failure(format!("backend status {}", status.as_u16()));
            }

            let parsed: Value = match resp.json().await {
                Ok(v) => v,
                Err(e) => return BackendOutcome::Failure(format!("invalid backend response: {}", e)),
            };

            if let Some(error) = parsed.get("error") {
                return BackendOutcome::ClientError(error.clone());
            }

            BackendOutcome::Success(parsed.get("result").cloned().unwrap_or(parsed))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_tool_url_overrides_base() {
        let mut per_tool = HashMap::new();
        per_tool.insert("image".to_string(), "http://images.internal".to_string());
        let client = HttpBackendClient::new("http://default.internal".to_string(), per_tool);

        assert_eq!(client.target_url("image"), "http://images.internal");
        assert_eq!(client.target_url("search"), "http://default.internal");
    }
}
