//! Error types for the MirrorGate HTTP proxy layer.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors that can occur while serving a proxied request.
///
/// Only baseline failures ever reach a client. Candidate failures are folded
/// into the mirror outcome and logged.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Target URI could not be built from base URL and request path (502)
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Connection or protocol failure reaching the upstream (502)
    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    /// Upstream did not answer within the configured timeout (502)
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Upstream response body could not be read (502)
    #[error("Upstream read error: {0}")]
    UpstreamRead(String),

    /// Inbound request body could not be read (400)
    #[error("Failed to read request body: {0}")]
    RequestBody(String),
}

impl ProxyError {
    /// True for every error surfaced to the client as 502 Bad Gateway.
    pub fn is_gateway_error(&self) -> bool {
        !matches!(self, ProxyError::RequestBody(_))
    }

    /// Convert error to a plain-text HTTP response.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let (status, message) = match self {
            ProxyError::UpstreamTransport(_) | ProxyError::UpstreamTimeout(_) => {
                (StatusCode::BAD_GATEWAY, "baseline upstream error\n")
            }
            ProxyError::UpstreamRead(_) => {
                (StatusCode::BAD_GATEWAY, "failed to read baseline response\n")
            }
            ProxyError::InvalidUri(_) => {
                (StatusCode::BAD_GATEWAY, "failed to build baseline request\n")
            }
            ProxyError::RequestBody(_) => (StatusCode::BAD_REQUEST, "failed to read request body\n"),
        };

        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(message)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("500 Internal Server Error")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
