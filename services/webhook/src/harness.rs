//! Example smoke test.
//!
//! Sends an event to the service under test and waits for the service to
//! call the webhook back with the same event marked as processed.

use std::sync::Arc;

use async_trait::async_trait;
use canary_correlate::{CorrelationRegistry, InboundRecord};
use canary_scheduler::{Context, ContextError, TestContext, TestFunc};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Event pushed through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokeEvent {
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub id: String,
    #[serde(default)]
    pub processed: bool,
}

impl SmokeEvent {
    /// A fresh, unprocessed event with a random id.
    pub fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            email: format!("canary+{}@example.com", &id[..8]),
            timestamp: Utc::now(),
            id,
            processed: false,
        }
    }
}

impl Default for SmokeEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Correlation key of a callback: the `id` field of its JSON body.
///
/// Bodies that are not JSON or carry no string `id` map to the empty key,
/// which is never sent.
pub fn event_id(record: &InboundRecord) -> String {
    record
        .json()
        .ok()
        .and_then(|body| body.get("id").and_then(|id| id.as_str()).map(str::to_string))
        .unwrap_or_default()
}

/// Errors sending the event to the service under test.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Smoke test against an HTTP service that echoes events back to the
/// webhook with `processed` set.
#[derive(Debug, Clone)]
pub struct SmokeHarness {
    target_url: String,
    registry: Arc<CorrelationRegistry>,
    client: reqwest::Client,
}

impl SmokeHarness {
    pub fn new(
        target_url: impl Into<String>,
        registry: Arc<CorrelationRegistry>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            target_url: target_url.into(),
            registry,
            client,
        }
    }

    async fn send(&self, ctx: &Context, event: &SmokeEvent) -> Result<(), SendError> {
        let mut request = self.client.post(&self.target_url).json(event);
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining);
        }

        let response = tokio::select! {
            response = request.send() => response?,
            _ = ctx.done() => return Err(ctx.err().unwrap_or(ContextError::Canceled).into()),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(SendError::Status(status.as_u16()));
        }
        Ok(())
    }

    /// Everything between `sent` and `delete`.
    async fn exercise(&self, ctx: &Context, t: &TestContext, event: &SmokeEvent) {
        if t
            .check_ok(self.send(ctx, event).await, "sending event shouldn't fail")
            .is_none()
        {
            return;
        }

        let Some(record) = t.check_ok(
            self.registry.wait(ctx, &event.id).await,
            "error waiting for callback",
        ) else {
            return;
        };
        debug!(id = %event.id, remote_addr = %record.remote_addr, "Callback received");

        let Some(received) = t.check_ok(
            serde_json::from_str::<SmokeEvent>(&record.body),
            "error decoding callback",
        ) else {
            return;
        };

        t.check(received.id == event.id, "callback carries a different id");
        t.check(received.processed, "processed should be set to true");
    }
}

#[async_trait]
impl TestFunc for SmokeHarness {
    async fn run(&self, ctx: Context, t: TestContext) {
        let event = SmokeEvent::new();

        if t
            .check_ok(self.registry.sent(&event.id), "error marking sent")
            .is_none()
        {
            return;
        }
        let _pending = PendingKey::new(&self.registry, &event.id);

        self.exercise(&ctx, &t, &event).await;
    }
}

/// Releases a sent key when dropped, including on unwind or cancellation.
struct PendingKey<'a> {
    registry: &'a CorrelationRegistry,
    key: &'a str,
}

impl<'a> PendingKey<'a> {
    fn new(registry: &'a CorrelationRegistry, key: &'a str) -> Self {
        Self { registry, key }
    }
}

impl Drop for PendingKey<'_> {
    fn drop(&mut self) {
        self.registry.delete(self.key);
    }
}
