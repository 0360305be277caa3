//! Request logging for the client-facing side of the proxy.
//!
//! Built on `tower_http::trace::TraceLayer`. Every inbound request gets a
//! `request` span carrying a correlation ID and the surface it hit (the
//! control plane or the proxied path). Query strings are never logged since
//! they routinely carry identifiers; only the path is recorded. Header dumps
//! are DEBUG-only and redacted.

use std::fmt;
use std::time::Duration;

use http::{HeaderMap, Request, Response};
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{
    DefaultOnBodyChunk, DefaultOnEos, MakeSpan, OnFailure, OnRequest, OnResponse, TraceLayer,
};
use tracing::{Level, Span, debug, field, info, warn};

/// Header carrying the caller's correlation ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header names whose values never reach the logs.
const REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
];

/// Any header ending in one of these is treated as a credential.
const REDACTED_SUFFIXES: &[&str] = &["-token", "-key", "-secret"];

const MAX_LOGGED_HEADERS: usize = 50;
const MAX_LOGGED_VALUE: usize = 256;

pub type ProxyTraceLayer = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    RequestSpan,
    LogRequest,
    LogResponse,
    DefaultOnBodyChunk,
    DefaultOnEos,
    LogFailure,
>;

/// Trace layer wrapped around the whole router.
pub fn logging_layer() -> ProxyTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(RequestSpan)
        .on_request(LogRequest)
        .on_response(LogResponse)
        .on_failure(LogFailure)
}

/// Which part of the router a path belongs to.
fn surface(path: &str) -> &'static str {
    if path == "/healthz" || path == "/metrics" || path.starts_with("/control/") {
        "control"
    } else {
        "proxy"
    }
}

/// Opens the `request` span. `status` and `latency_ms` are filled in when
/// the response is ready.
#[derive(Clone, Debug)]
pub struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let path = request.uri().path();

        tracing::info_span!(
            "request",
            request_id = %request_id,
            method = %request.method(),
            path = %path,
            surface = surface(path),
            status = field::Empty,
            latency_ms = field::Empty,
        )
    }
}

#[derive(Clone, Debug)]
pub struct LogRequest;

impl<B> OnRequest<B> for LogRequest {
    fn on_request(&mut self, request: &Request<B>, _span: &Span) {
        // Health checks and scrapes would drown out proxied traffic at INFO.
        if surface(request.uri().path()) == "control" {
            debug!("Control request received");
        } else {
            info!("Request received");
        }

        if tracing::enabled!(Level::DEBUG) {
            debug!(headers = ?RedactedHeaders(request.headers()), "Request headers");
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogResponse;

impl<B> OnResponse<B> for LogResponse {
    fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
        let status = response.status().as_u16();
        span.record("status", status);
        span.record("latency_ms", latency.as_millis() as u64);
        info!(status, latency_ms = latency.as_millis() as u64, "Response sent");

        if tracing::enabled!(Level::DEBUG) {
            debug!(headers = ?RedactedHeaders(response.headers()), "Response headers");
        }
    }
}

/// 5xx responses; for proxied paths these are baseline failures.
#[derive(Clone, Debug)]
pub struct LogFailure;

impl OnFailure<ServerErrorsFailureClass> for LogFailure {
    fn on_failure(&mut self, failure: ServerErrorsFailureClass, latency: Duration, _span: &Span) {
        warn!(
            classification = %failure,
            latency_ms = latency.as_millis() as u64,
            "Request failed"
        );
    }
}

fn is_redacted(name: &str) -> bool {
    REDACTED_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
        || REDACTED_SUFFIXES
            .iter()
            .any(|suffix| name.to_ascii_lowercase().ends_with(suffix))
}

/// Debug view of a header map with credentials blanked and sizes capped.
struct RedactedHeaders<'a>(&'a HeaderMap);

impl fmt::Debug for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        let total = self.0.len();

        for (name, value) in self.0.iter().take(MAX_LOGGED_HEADERS) {
            let name = name.as_str();
            if is_redacted(name) {
                map.entry(&name, &"[REDACTED]");
                continue;
            }
            match value.to_str() {
                // Visible ASCII only, so byte slicing is safe.
                Ok(v) if v.len() > MAX_LOGGED_VALUE => {
                    map.entry(
                        &name,
                        &format!("{}…[{} bytes]", &v[..MAX_LOGGED_VALUE], v.len()),
                    );
                }
                Ok(v) => {
                    map.entry(&name, &v);
                }
                Err(_) => {
                    map.entry(&name, &format!("[{} opaque bytes]", value.len()));
                }
            }
        }
        if total > MAX_LOGGED_HEADERS {
            map.entry(&"…", &format!("{} more", total - MAX_LOGGED_HEADERS));
        }

        map.finish()
    }
}
