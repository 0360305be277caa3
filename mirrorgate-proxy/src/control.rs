//! HTTP surface of the proxy: health, metrics, guardrail control.
//!
//! # Endpoints
//!
//! | Path | Method | Response |
//! |------|--------|----------|
//! | `/healthz` | any | `200 ok` |
//! | `/metrics` | GET | OpenMetrics text |
//! | `/control/status` | GET | Guardrail snapshot (JSON) |
//! | `/control/enable` | POST | Re-enable mirroring now |
//! | `/control/disable` | POST | Disable mirroring now |
//! | anything else | any | proxied by the [`Dispatcher`] |
//!
//! A known control path hit with the wrong method answers 405 and is never
//! proxied.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{any, get, post},
};
use mirrorgate_core::guardrail::{Guardrail, GuardrailStatus};
use prometheus_client::registry::Registry;
use serde::Serialize;
use tracing::error;

use crate::dispatcher::Dispatcher;

/// Reason recorded by `POST /control/enable`.
pub const MANUAL_ENABLE_REASON: &str = "manual enable";

/// Reason recorded by `POST /control/disable`.
pub const MANUAL_DISABLE_REASON: &str = "manual disable";

/// Shared state for the control handlers.
#[derive(Clone)]
pub struct ControlState {
    pub guardrail: Arc<Guardrail>,
    pub registry: Arc<Registry>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: &'static str,
}

/// Build the full application router.
pub fn router(state: ControlState, dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/healthz", any(healthz_handler))
        .route(
            "/metrics",
            get(metrics_handler).fallback(method_not_allowed),
        )
        .route(
            "/control/status",
            get(status_handler).fallback(method_not_allowed),
        )
        .route(
            "/control/enable",
            post(enable_handler).fallback(method_not_allowed),
        )
        .route(
            "/control/disable",
            post(disable_handler).fallback(method_not_allowed),
        )
        .fallback_service(dispatcher)
        .with_state(state)
}

async fn healthz_handler() -> &'static str {
    "ok\n"
}

async fn method_not_allowed() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n")
}

/// Encode the registry in OpenMetrics text format.
async fn metrics_handler(State(state): State<ControlState>) -> impl IntoResponse {
    let mut buffer = String::new();

    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &state.registry) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

async fn status_handler(State(state): State<ControlState>) -> Json<GuardrailStatus> {
    Json(state.guardrail.status())
}

async fn enable_handler(State(state): State<ControlState>) -> Json<MessageResponse> {
    state.guardrail.enable(MANUAL_ENABLE_REASON);
    Json(MessageResponse {
        message: "mirroring enabled",
    })
}

async fn disable_handler(State(state): State<ControlState>) -> Json<MessageResponse> {
    state.guardrail.disable(MANUAL_DISABLE_REASON);
    Json(MessageResponse {
        message: "mirroring disabled",
    })
}
