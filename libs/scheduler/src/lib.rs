//! # canary-scheduler
//!
//! Runs end-to-end test cases against a live system on a fixed period.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use canary_scheduler::{Scheduler, SchedulerConfig, TestCase};
//!
//! # async fn example() {
//! let scheduler = Scheduler::new(SchedulerConfig::default());
//! scheduler.register(
//!     TestCase::from_fn("ping", Duration::from_secs(1), |ctx, t| async move {
//!         if ctx.is_done() {
//!             t.error("no time left");
//!         }
//!     })
//!     .with_timeout(Duration::from_secs(3)),
//! );
//! scheduler.start();
//! // ...
//! scheduler.close().await.ok();
//! # }
//! ```
//!
//! Each invocation reports one `case` observation to the configured
//! [`MetricsSink`] tagged with `case` and `result`, and writes a
//! `--- PASS: <name> (<duration>)` or `--- FAIL: ...` line to the
//! [`Output`].

use std::sync::OnceLock;

mod case;
mod error;
mod metrics;
mod output;
mod scheduler;
mod test_context;

pub use canary_context::{Context, ContextError};
pub use case::{TestCase, TestFunc};
pub use error::{SchedulerError, SinkError};
pub use metrics::{MemorySink, MetricsSink, Observation, PrometheusSink, Tag};
pub use output::Output;
pub use scheduler::{
    Outcome, Scheduler, SchedulerBuilder, SchedulerConfig, DEFAULT_TIMEOUT, TIMEOUT_FLOOR,
};
pub use test_context::TestContext;

static GLOBAL: OnceLock<Scheduler> = OnceLock::new();

/// Process-wide scheduler with the default configuration.
///
/// A convenience for binaries that register cases from several modules.
/// Libraries and tests should create their own [`Scheduler`].
pub fn global() -> &'static Scheduler {
    GLOBAL.get_or_init(Scheduler::default)
}

/// Register a case on the [`global`] scheduler.
pub fn register(case: TestCase) {
    global().register(case);
}
