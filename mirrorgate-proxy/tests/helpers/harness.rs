//! In-process proxy harness driven through `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use mirrorgate_core::config::MirrorConfig;
use mirrorgate_core::guardrail::Guardrail;
use mirrorgate_core::telemetry::MirrorMetrics;
use mirrorgate_proxy::control::{self, ControlState};
use mirrorgate_proxy::dispatcher::Dispatcher;
use mirrorgate_proxy::upstream::UpstreamClient;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

/// A fully wired proxy without a listening socket.
pub struct ProxyHarness {
    pub app: Router,
    pub dispatcher: Dispatcher,
    pub guardrail: Arc<Guardrail>,
    pub metrics: Arc<MirrorMetrics>,
    pub registry: Arc<Registry>,
}

impl ProxyHarness {
    /// Wire the proxy exactly as `main` does.
    pub fn new(config: MirrorConfig) -> Self {
        let mut registry = Registry::default();
        let metrics = Arc::new(MirrorMetrics::new(&mut registry));
        let registry = Arc::new(registry);

        let guardrail =
            Arc::new(Guardrail::new(config.guardrail_config()).with_metrics(metrics.clone()));
        let client = UpstreamClient::new().expect("Failed to build upstream client");
        let dispatcher = Dispatcher::new(&config, client, guardrail.clone(), metrics.clone())
            .expect("Invalid upstream URLs");

        let app = control::router(
            ControlState {
                guardrail: guardrail.clone(),
                registry: registry.clone(),
            },
            dispatcher.clone(),
        );

        Self {
            app,
            dispatcher,
            guardrail,
            metrics,
            registry,
        }
    }

    /// Send one request through the router.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("Router is infallible")
    }

    /// Send a bodyless request.
    pub async fn request(&self, method: &str, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        self.send(request).await
    }

    /// Wait until every spawned mirror task has finished.
    pub async fn drain_mirrors(&self) {
        let tracker = self.dispatcher.tracker();
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    /// Current registry contents in OpenMetrics text.
    pub fn metrics_text(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("Failed to encode metrics");
        buffer
    }
}

/// Config pointing at the given upstreams, mirroring every request.
pub fn config_for(baseline: SocketAddr, candidate: SocketAddr) -> MirrorConfig {
    MirrorConfig {
        baseline_url: format!("http://{}", baseline),
        candidate_url: format!("http://{}", candidate),
        mirror_fraction: 1.0,
        ..MirrorConfig::default()
    }
}

/// Collect a response body.
pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes()
}
