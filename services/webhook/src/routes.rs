//! HTTP routing for the tester.
//!
//! `/internal/*` is reserved for the tester's own endpoints. Every other
//! request is a webhook callback.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use canary_scheduler::PrometheusSink;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::webhook::Webhook;

/// Content type of the Prometheus text exposition format.
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Shared state for tester handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    webhook: Webhook,
    metrics: Arc<PrometheusSink>,
}

impl AppState {
    pub fn new(webhook: Webhook, metrics: Arc<PrometheusSink>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { webhook, metrics }),
        }
    }

    pub fn webhook(&self) -> &Webhook {
        &self.inner.webhook
    }

    pub fn metrics(&self) -> &PrometheusSink {
        &self.inner.metrics
    }
}

/// Create the tester router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/internal/health", get(health))
        .route("/internal/metrics", get(metrics))
        .fallback(callback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")])
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics().encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn callback(State(state): State<AppState>, request: Request) -> StatusCode {
    state.webhook().handle(request).await
}
