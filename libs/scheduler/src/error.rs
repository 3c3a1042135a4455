//! Error types for the scheduler and its metrics sinks.

use thiserror::Error;

/// Errors reported by [`Scheduler`](crate::Scheduler).
///
/// `close` currently always succeeds; the type leaves room for reporting
/// shutdown failures without changing the signature.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Shutdown did not complete cleanly.
    #[error("scheduler shutdown failed: {0}")]
    Shutdown(String),
}

/// Errors from the Prometheus metrics sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Registering or encoding a collector failed.
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}
