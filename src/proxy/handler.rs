use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::core::gate::ToolCall;
use crate::core::key_store::{now_millis, KeyRecord};
use crate::core::usage_meter::UsageEvent;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::server::GatewayState;

/// Calls with a body larger than this are rejected before parsing — avoids
/// buffering an unbounded request into memory.
const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

/// One inbound JSON-RPC envelope.
#[derive(serde::Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Translates one inbound JSON-RPC tool call through `Gate::evaluate` and,
/// if admitted, `Proxy::execute`, into an HTTP response carrying a
/// JSON-RPC reply. This is the thinnest possible stand-in for the wire
/// layer the core treats as an external collaborator.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let headers = req.headers().clone();

    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let mut ctx = RequestContext::new(method.as_str().to_string(), path, client_ip);

    if method != Method::POST {
        let resp = rpc_http_error(StatusCode::METHOD_NOT_ALLOWED, Value::Null, -32600, "method not allowed");
        ctx.finalize_metrics(StatusCode::METHOD_NOT_ALLOWED.as_u16(), false);
        return Ok(resp);
    }

    if let Some(cl) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if cl > MAX_BODY_BYTES {
            let resp = rpc_http_error(StatusCode::PAYLOAD_TOO_LARGE, Value::Null, -32600, "payload too large");
            ctx.finalize_metrics(StatusCode::PAYLOAD_TOO_LARGE.as_u16(), false);
            return Ok(resp);
        }
    }

    let api_key = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string();

    let body_bytes: Bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("proxy: failed reading request body, error={}", e);
            let resp = rpc_http_error(StatusCode::BAD_REQUEST, Value::Null, -32700, "parse error");
            ctx.finalize_metrics(StatusCode::BAD_REQUEST.as_u16(), false);
            return Ok(resp);
        }
    };

    let rpc: JsonRpcRequest = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(e) => {
            debug!("proxy: invalid json-rpc body, error={}", e);
            let resp = rpc_http_error(StatusCode::BAD_REQUEST, Value::Null, -32700, "parse error");
            ctx.finalize_metrics(StatusCode::BAD_REQUEST.as_u16(), false);
            return Ok(resp);
        }
    };

    ctx.tool = rpc.method.clone();
    ctx.api_key = KeyRecord::display_prefix(&api_key);

    let input_bytes = serde_json::to_vec(&rpc.params).map(|v| v.len()).unwrap_or(0);
    let client_ip_str = ctx.client_ip.to_string();
    let call = ToolCall {
        tool: &rpc.method,
        input_bytes,
        ip: Some(client_ip_str.as_str()),
    };

    let now = now_millis();
    let core = &state.core;
    let decision = core.gate.evaluate(&core.gate_config, &api_key, &call, now).await;

    if !decision.allowed {
        let reason = decision.reason.clone().unwrap_or_else(|| "denied".to_string());
        if reason.starts_with("rate_limited") || reason == "concurrency_limit" {
            core.alerts.record_rate_limit_denial(&api_key, now);
        }
        record_gate_denial(&state, &api_key, &rpc.method, &reason, now).await;
        let resp = rpc_error_response(rpc.id.clone(), -32402, &reason, decision.retry_after_ms);
        ctx.finalize_metrics(StatusCode::OK.as_u16(), false);
        return Ok(resp);
    }

    let proxy = core.proxy();
    let result = proxy
        .execute(
            &decision,
            rpc.params,
            state.backend.as_ref(),
            &core.circuit_breaker_config,
            &core.retry_config,
            now,
        )
        .await;

    check_alerts(&state, &api_key, now).await;

    let resp = if result.allowed {
        let body = json!({
            "jsonrpc": "2.0",
            "result": result.response.unwrap_or(Value::Null),
            "id": rpc.id,
        });
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(full_body(body.to_string()))
            .unwrap()
    } else {
        let reason = result.deny_reason.unwrap_or_else(|| "backend_error".to_string());
        let code = rpc_code_for_reason(&reason);
        rpc_error_response(rpc.id.clone(), code, &reason, result.retry_after_ms)
    };

    ctx.finalize_metrics(StatusCode::OK.as_u16(), result.allowed);
    Ok(resp)
}

/// Meters a denial made by `Gate::evaluate` before any proxy call is
/// attempted — shadow-converted allows never reach here since
/// `decision.allowed` is already true for them. A key that failed to
/// resolve at all (`invalid_api_key`) has no record to read a name or
/// namespace from, so both are left empty/`None`.
async fn record_gate_denial(state: &GatewayState, api_key: &str, tool: &str, reason: &str, now: i64) {
    let core = &state.core;
    let (key_name, namespace) = match core.gate.key_store.resolve(api_key) {
        Some(handle) => {
            let rec = handle.lock().await;
            (rec.name.clone(), rec.namespace.clone())
        }
        None => (String::new(), None),
    };
    core.usage_meter.record(UsageEvent {
        timestamp: now,
        api_key_prefix: KeyRecord::display_prefix(api_key),
        key_name,
        tool: tool.to_string(),
        credits_charged: 0,
        allowed: false,
        deny_reason: Some(reason.to_string()),
        namespace,
        response_time_ms: None,
    });
}

/// Evaluates alert rules against the key's post-commit state and, for
/// anything newly fired, queues a webhook notification if any targets
/// are configured. Best-effort — a missing key or a pause on the
/// batcher is not an error for the request that triggered the check.
async fn check_alerts(state: &GatewayState, api_key: &str, now: i64) {
    let core = &state.core;
    let Some(handle) = core.gate.key_store.resolve(api_key) else {
        return;
    };
    let (key_full, record) = {
        let rec = handle.lock().await;
        (api_key.to_string(), rec.clone())
    };
    let fired = core.alerts.check(&key_full, &record, now);
    if fired.is_empty() {
        return;
    }
    let Some(webhooks) = core.webhooks.as_ref() else {
        return;
    };
    let targets: Vec<String> = state
        .config
        .load()
        .webhook
        .as_ref()
        .map(|w| w.targets.clone())
        .unwrap_or_default();
    for alert in &fired {
        let payload = json!({
            "type": "alert_fired",
            "rule_name": alert.rule_name,
            "key_name": alert.key_name,
            "message": alert.message,
            "at": alert.at,
        });
        for target in &targets {
            let _ = webhooks.add(target, payload.clone()).await;
        }
    }
}

/// `-32603` for backend/internal failures, `-32402` for every admission
/// denial — mirrors `DenyReason::rpc_code` without needing the typed
/// enum, which `Decision`/`ExecuteResult` no longer carry past formatting.
fn rpc_code_for_reason(reason: &str) -> i64 {
    if reason == "backend_error" || reason.starts_with("internal_error:") {
        -32603
    } else {
        -32402
    }
}

fn rpc_error_response(id: Value, code: i64, message: &str, retry_after_ms: Option<i64>) -> Response<BoxBody> {
    let body = json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": message },
        "id": id,
    });

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json");

    if let Some(ms) = retry_after_ms {
        let secs = (ms.max(0) as u64).div_ceil(1000).max(1);
        builder = builder.header("Retry-After", secs.to_string());
    }

    builder.body(full_body(body.to_string())).unwrap()
}

fn rpc_http_error(status: StatusCode, id: Value, code: i64, message: &str) -> Response<BoxBody> {
    let body = json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": message },
        "id": id,
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}
