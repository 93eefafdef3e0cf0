use super::GatewayState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::json;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: u16, body: serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

/// Parses `?k=v&k2=v2` without pulling in a URL crate — good enough for
/// the handful of scalar query params the observability endpoints take.
fn query_params(query: &str) -> Vec<(&str, &str)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .collect()
}

fn query_get<'a>(params: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Read-only observability surface: health, metrics, audit trail queries,
/// usage summaries, circuit breaker and alert status. No endpoint here
/// mutates gateway state — key/policy changes happen through config
/// reload, not this API.
pub fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    match path.as_str() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => Ok(json_response(200, json!({"status": "ready"}))),

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/v1/audit" => {
            let params = query_params(&query);
            let offset = query_get(&params, "offset")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            let limit = query_get(&params, "limit")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(100)
                .min(1000);
            let action = query_get(&params, "action");
            let actor = query_get(&params, "actor");
            let target = query_get(&params, "target");

            let filter = crate::core::audit::AuditFilter {
                action,
                actor,
                target,
            };
            let entries = state.core.audit.query(&filter, offset, limit);
            let body: Vec<serde_json::Value> = entries
                .iter()
                .map(|e| {
                    json!({
                        "id": e.id,
                        "timestamp": e.timestamp,
                        "action": e.action,
                        "actor": e.actor,
                        "actor_type": e.actor_type,
                        "target": e.target,
                        "target_type": e.target_type,
                        "source": e.source,
                        "details": e.details,
                        "previous_hash": e.previous_hash,
                        "hash": e.hash,
                    })
                })
                .collect();
            Ok(json_response(200, json!({"entries": body, "chain_valid": state.core.audit.verify_chain()})))
        }

        "/v1/usage/summary" => {
            let params = query_params(&query);
            let since = query_get(&params, "since").and_then(|v| v.parse::<i64>().ok());
            let namespace = query_get(&params, "namespace");
            let summary = state.core.usage_meter.summary(since, namespace);
            Ok(json_response(200, json!({
                "total_calls": summary.total_calls,
                "total_credits_spent": summary.total_credits_spent,
                "total_denied": summary.total_denied,
                "per_tool": summary.per_tool,
                "per_key": summary.per_key,
                "deny_reasons": summary.deny_reasons,
            })))
        }

        "/v1/usage/key" => {
            let params = query_params(&query);
            let Some(prefix) = query_get(&params, "prefix") else {
                return Ok(json_response(400, json!({"error": "missing prefix query param"})));
            };
            let since = query_get(&params, "since").and_then(|v| v.parse::<i64>().ok());
            let usage = state.core.usage_meter.key_usage(prefix, since);
            let recent: Vec<serde_json::Value> = usage
                .recent
                .iter()
                .map(|e| {
                    json!({
                        "timestamp": e.timestamp,
                        "tool": e.tool,
                        "credits_charged": e.credits_charged,
                        "allowed": e.allowed,
                        "deny_reason": e.deny_reason,
                    })
                })
                .collect();
            Ok(json_response(200, json!({
                "total_calls": usage.summary.total_calls,
                "total_credits_spent": usage.summary.total_credits_spent,
                "total_denied": usage.summary.total_denied,
                "hourly": usage.hourly,
                "recent": recent,
            })))
        }

        "/v1/circuit-breaker" => {
            let params = query_params(&query);
            let Some(backend) = query_get(&params, "backend") else {
                return Ok(json_response(400, json!({"error": "missing backend query param"})));
            };
            match state.core.gate.circuit_breaker.stats(backend) {
                Some(stats) => {
                    let open = state
                        .core
                        .gate
                        .circuit_breaker
                        .is_open(backend, &state.core.circuit_breaker_config);
                    Ok(json_response(200, json!({
                        "backend": backend,
                        "open": open,
                        "failures": stats.failures,
                        "successes": stats.successes,
                        "rejections": stats.rejections,
                    })))
                }
                None => Ok(json_response(404, json!({"error": "unknown backend"}))),
            }
        }

        "/v1/alerts" => {
            let fired = state.core.alerts.fired_alerts();
            let body: Vec<serde_json::Value> = fired
                .iter()
                .map(|a| {
                    json!({
                        "rule_name": a.rule_name,
                        "key_name": a.key_name,
                        "message": a.message,
                        "at": a.at,
                    })
                })
                .collect();
            Ok(json_response(200, json!({"alerts": body})))
        }

        _ => Ok(json_response(404, json!({"error": "not found"}))),
    }
}
