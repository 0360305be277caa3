//! Mock HTTP upstream for integration testing.
//!
//! Answers every method and path with one preconfigured response, optionally
//! after a delay, and records what it received.

#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Mock upstream server.
#[derive(Debug, Clone)]
pub struct MockUpstream {
    status: StatusCode,
    body: Bytes,
    headers: Vec<(HeaderName, HeaderValue)>,
    delay: Duration,
}

/// A request as seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
struct MockState {
    upstream: MockUpstream,
    request_count: RwLock<u32>,
    last_request: RwLock<Option<RecordedRequest>>,
}

impl MockUpstream {
    /// A 200 response with an empty body.
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            body: Bytes::new(),
            headers: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.push((
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ));
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Start the mock server on an ephemeral localhost port.
    pub async fn start(self) -> (SocketAddr, MockServerHandle) {
        let state = Arc::new(MockState {
            upstream: self,
            request_count: RwLock::new(0),
            last_request: RwLock::new(None),
        });

        let app = Router::new()
            .fallback(handle_any)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock upstream");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Mock server failed");
        });

        (
            addr,
            MockServerHandle {
                state,
                handle,
            },
        )
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running mock server. Dropping it stops the server.
pub struct MockServerHandle {
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockServerHandle {
    /// Number of requests received.
    pub async fn request_count(&self) -> u32 {
        *self.state.request_count.read().await
    }

    /// Last request received.
    pub async fn last_request(&self) -> Option<RecordedRequest> {
        self.state.last_request.read().await.clone()
    }
}

impl Drop for MockServerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_any(State(state): State<Arc<MockState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    {
        let mut count = state.request_count.write().await;
        *count += 1;
    }
    {
        let mut last = state.last_request.write().await;
        *last = Some(RecordedRequest {
            method: parts.method,
            path_and_query: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default(),
            headers: parts.headers,
            body,
        });
    }

    let upstream = &state.upstream;
    if !upstream.delay.is_zero() {
        tokio::time::sleep(upstream.delay).await;
    }

    let mut response = Response::new(Body::from(upstream.body.clone()));
    *response.status_mut() = upstream.status;
    for (name, value) in &upstream.headers {
        response.headers_mut().append(name.clone(), value.clone());
    }
    response
}

/// An address nothing is listening on.
pub fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    listener.local_addr().expect("Failed to get local addr")
}
