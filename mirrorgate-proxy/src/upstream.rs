//! Upstream targets and the pooled HTTP client used for both legs.
//!
//! # Overview
//!
//! - [`ProxyTarget`]: a validated base URL (scheme + authority) for the
//!   baseline or the candidate. Only the scheme and authority are kept; the
//!   request path and query always replace whatever path the base carried.
//! - [`ForwardRequest`]: the buffered inbound request, read once and replayed
//!   against both upstreams.
//! - [`UpstreamClient`]: a hyper-util pooled client (plain HTTP or TLS via
//!   rustls) that performs one round trip and buffers the whole response body
//!   under a single timeout. No retries.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HOST, TRANSFER_ENCODING};
use http::request::Parts;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use mirrorgate_core::config::ConfigError;
use mirrorgate_core::telemetry::Target;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};

// ─────────────────────────────────────────────────────────────────────────────
// ProxyTarget
// ─────────────────────────────────────────────────────────────────────────────

/// Base URL of one upstream. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    kind: Target,
    scheme: Scheme,
    authority: Authority,
}

impl ProxyTarget {
    /// Parse and validate a base URL.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if the URL does not parse, lacks a
    /// host, or uses a scheme other than `http`/`https`.
    pub fn parse(kind: Target, url: &str) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidUrl {
            url: url.to_string(),
            message,
        };

        let uri: Uri = url.trim().parse().map_err(|e| invalid(format!("{}", e)))?;
        let parts = uri.into_parts();

        let scheme = parts
            .scheme
            .ok_or_else(|| invalid("missing scheme".to_string()))?;
        if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
            return Err(invalid(format!("unsupported scheme '{}'", scheme)));
        }
        let authority = parts
            .authority
            .ok_or_else(|| invalid("missing host".to_string()))?;

        Ok(Self {
            kind,
            scheme,
            authority,
        })
    }

    /// Build the upstream URI for an inbound path and query.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::InvalidUri` if the parts do not form a valid URI.
    pub fn uri_for(&self, path_and_query: Option<&PathAndQuery>) -> ProxyResult<Uri> {
        let path_and_query = path_and_query
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::InvalidUri(format!("{} target: {}", self.kind, e)))
    }
}

impl std::fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ForwardRequest
// ─────────────────────────────────────────────────────────────────────────────

/// A fully buffered inbound request, replayable against any target.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path_and_query: Option<PathAndQuery>,
    /// Inbound headers minus `Host`. `Transfer-Encoding` is dropped as well
    /// since the body is re-sent with a known length.
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    pub fn from_parts(parts: &Parts, body: Bytes) -> Self {
        let mut headers = parts.headers.clone();
        headers.remove(HOST);
        headers.remove(TRANSFER_ENCODING);

        Self {
            method: parts.method.clone(),
            path_and_query: parts.uri.path_and_query().cloned(),
            headers,
            body,
        }
    }
}

/// A buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Time from sending the request to receiving the response head.
    pub latency: Duration,
}

// ─────────────────────────────────────────────────────────────────────────────
// UpstreamClient
// ─────────────────────────────────────────────────────────────────────────────

/// Pooled HTTP/HTTPS client shared by the baseline and mirror paths.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl UpstreamClient {
    /// Create a client with native TLS roots.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::UpstreamTransport` if the TLS crypto provider
    /// cannot be installed.
    pub fn new() -> ProxyResult<Self> {
        // Install the rustls crypto provider exactly once, capturing the result
        // for error reporting without panicking.
        static RUSTLS_INIT: std::sync::OnceLock<Result<(), ()>> = std::sync::OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init_result.is_err() {
            return Err(ProxyError::UpstreamTransport(
                "Failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(true);
        http_connector.enforce_http(false);

        // Hosts without a CA bundle can still reach plain-HTTP upstreams.
        let tls_builder = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!(error = %e, "No native TLS roots loaded, https upstreams will fail verification");
                let tls_config = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                HttpsConnectorBuilder::new().with_tls_config(tls_config)
            }
        };

        let https_connector = tls_builder
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https_connector);

        Ok(Self { client })
    }

    /// Perform one round trip against `target`.
    ///
    /// Sending and reading the full body both happen under `timeout`. Dropping
    /// the returned future abandons the upstream call.
    ///
    /// # Errors
    ///
    /// - `ProxyError::UpstreamTimeout` if `timeout` elapses
    /// - `ProxyError::UpstreamTransport` on connection or protocol failure
    /// - `ProxyError::UpstreamRead` if the response body cannot be read
    /// - `ProxyError::InvalidUri` if the target URI cannot be built
    pub async fn send(
        &self,
        target: &ProxyTarget,
        request: &ForwardRequest,
        timeout: Duration,
    ) -> ProxyResult<UpstreamResponse> {
        let uri = target.uri_for(request.path_and_query.as_ref())?;

        let mut builder = Request::builder().method(request.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
        }
        let upstream_req = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| ProxyError::InvalidUri(format!("Failed to build request: {}", e)))?;

        let exchange = async {
            let start = Instant::now();
            let response = self
                .client
                .request(upstream_req)
                .await
                .map_err(map_hyper_error)?;
            let latency = start.elapsed();

            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| ProxyError::UpstreamRead(e.to_string()))?
                .to_bytes();

            Ok::<_, ProxyError>(UpstreamResponse {
                status: parts.status,
                headers: parts.headers,
                body,
                latency,
            })
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| {
                ProxyError::UpstreamTimeout(format!("{} did not respond within {:?}", target, timeout))
            })?
    }
}

/// Map hyper_util client errors to `ProxyError` variants.
///
/// # Error Mapping
/// - Timeout -> `ProxyError::UpstreamTimeout`
/// - Everything else (refused, reset, protocol) -> `ProxyError::UpstreamTransport`
fn map_hyper_error(e: hyper_util::client::legacy::Error) -> ProxyError {
    let error_msg = e.to_string().to_lowercase();

    if error_msg.contains("timeout") || error_msg.contains("timed out") {
        debug!(error = %e, "Upstream timeout");
        return ProxyError::UpstreamTimeout(format!("Upstream timeout: {}", e));
    }

    if e.is_connect() {
        debug!(error = %e, "Upstream connection failed");
        return ProxyError::UpstreamTransport(format!("Failed to connect to upstream: {}", e));
    }

    debug!(error = %e, "Upstream error");
    ProxyError::UpstreamTransport(format!("Upstream error: {}", e))
}
