use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context carried through `handle_request`. Analogous to the
/// teacher's `RequestContext`, but indexed by tool/key rather than
/// route/cluster — the admission pipeline replaces the routing layer as
/// the thing this context describes.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub client_ip: IpAddr,
    pub api_key: String,
    pub tool: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(method: String, path: String, client_ip: IpAddr) -> Self {
        RequestContext {
            method,
            path,
            client_ip,
            api_key: String::new(),
            tool: String::new(),
            start: Instant::now(),
        }
    }

    /// Single exit point for recording request metrics, called once per
    /// response regardless of outcome.
    pub fn finalize_metrics(&self, status_code: u16, allowed: bool) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status_code);

        metrics::counter!(
            "gateway_http_requests_total",
            "tool" => self.tool.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "outcome" => if allowed { "allowed" } else { "denied" },
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "tool" => self.tool.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
