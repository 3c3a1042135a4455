//! Inbound webhook receiver.
//!
//! Accepts any method on any path, snapshots the request into an
//! [`InboundRecord`] and hands it to a [`RequestLogger`]. The peer always
//! gets `200` once the record has been handed off: it has no way to act on
//! a dropped correlation, so none is reported.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    Router,
};
use canary_correlate::{InboundRecord, RequestLogger};
use chrono::Utc;
use tracing::debug;

/// Largest accepted request body, in bytes.
pub const MAX_BODY_BYTES: usize = 30_000;

/// Turns inbound HTTP requests into records.
#[derive(Clone)]
pub struct Webhook {
    logger: Arc<dyn RequestLogger>,
    max_body: usize,
}

impl Webhook {
    /// Create a receiver that forwards records to `logger`.
    pub fn new(logger: Arc<dyn RequestLogger>) -> Self {
        Self {
            logger,
            max_body: MAX_BODY_BYTES,
        }
    }

    /// Override the body size cap.
    pub fn with_max_body(mut self, bytes: usize) -> Self {
        self.max_body = bytes;
        self
    }

    /// A router that sends every request to this receiver.
    pub fn router(self) -> Router {
        Router::new().fallback(receive).with_state(self)
    }

    /// Record one request and pick the response status.
    pub async fn handle(&self, request: Request) -> StatusCode {
        let (parts, body) = request.into_parts();

        let body = match to_bytes(body, self.max_body).await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, limit = self.max_body, "Failed to read webhook body");
                return StatusCode::BAD_REQUEST;
            }
        };

        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_default();

        self.logger.record(InboundRecord {
            remote_addr,
            method: parts.method.to_string(),
            proto: format!("{:?}", parts.version),
            raw_url: parts.uri.to_string(),
            headers: snapshot_headers(&parts.headers),
            body: String::from_utf8_lossy(&body).into_owned(),
            received_at: Utc::now(),
        });

        StatusCode::OK
    }
}

async fn receive(State(hook): State<Webhook>, request: Request) -> StatusCode {
    hook.handle(request).await
}

/// Deep copy of the header map, keeping every value of repeated headers.
fn snapshot_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect();
        out.insert(name.as_str().to_string(), values);
    }
    out
}
