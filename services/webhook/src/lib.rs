//! canary tester
//!
//! Hosts the webhook that services under test call back into, the
//! `/internal` health and metrics endpoints, and the example smoke test
//! that drives an event through a pipeline and waits for its callback.

pub mod config;
pub mod harness;
pub mod routes;
pub mod webhook;

pub use harness::{event_id, SendError, SmokeEvent, SmokeHarness};
pub use routes::{create_router, AppState};
pub use webhook::{Webhook, MAX_BODY_BYTES};
