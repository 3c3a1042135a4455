//! canary echo service
//!
//! A minimal pipeline to point the tester at. Every event it receives is
//! marked `"processed": true` and posted to the upstream webhook.

pub mod config;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Shared state for echo handlers.
#[derive(Clone)]
pub struct EchoState {
    inner: Arc<EchoStateInner>,
}

struct EchoStateInner {
    upstream_url: String,
    client: reqwest::Client,
}

impl EchoState {
    pub fn new(upstream_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(EchoStateInner {
                upstream_url: upstream_url.into(),
                client,
            }),
        }
    }

    pub fn upstream_url(&self) -> &str {
        &self.inner.upstream_url
    }
}

/// Create the echo router.
pub fn create_router(state: EchoState) -> Router {
    Router::new()
        .route("/internal/health", get(health))
        .fallback(forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")])
}

/// Mark the event processed and pass it on.
async fn forward(State(state): State<EchoState>, body: Bytes) -> StatusCode {
    let event = match mark_processed(&body) {
        Some(event) => event,
        None => {
            debug!(len = body.len(), "Rejecting body that is not a JSON object");
            return StatusCode::BAD_REQUEST;
        }
    };

    let response = state
        .inner
        .client
        .post(state.upstream_url())
        .json(&event)
        .send()
        .await;

    match response {
        Ok(response) => {
            let status = response.status().as_u16();
            debug!(status, id = ?event.get("id"), "Forwarded event");
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        Err(e) => {
            warn!(error = %e, upstream = %state.upstream_url(), "Failed to forward event");
            StatusCode::BAD_GATEWAY
        }
    }
}

fn mark_processed(body: &[u8]) -> Option<Value> {
    let mut event: Value = serde_json::from_slice(body).ok()?;
    event
        .as_object_mut()?
        .insert("processed".to_string(), Value::Bool(true));
    Some(event)
}
