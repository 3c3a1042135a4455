//! Periodic test runner.
//!
//! Every registered case gets its own loop task. Each period the loop
//! spawns an invocation task with a fresh [`TestContext`] and a context bound
//! by the case timeout and by scheduler shutdown. Invocations of the same
//! case may overlap when a run takes longer than the period.
//!
//! Shutdown is drain-complete: [`Scheduler::close`] stops all loops,
//! cancels the contexts of in-flight invocations and waits until every
//! invocation has returned and recorded its outcome.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use canary_context::Context;
use futures_util::FutureExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::case::TestCase;
use crate::error::SchedulerError;
use crate::metrics::{MetricsSink, PrometheusSink, Tag};
use crate::output::Output;
use crate::test_context::TestContext;

/// Default per-invocation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Case timeouts at or below this value are treated as unset.
pub const TIMEOUT_FLOOR: Duration = Duration::from_millis(10);

/// Smallest period a case loop ticks at.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Metric name for invocation outcomes.
const CASE_METRIC: &str = "case";

/// Configuration for the scheduler.
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Timeout for cases that do not set their own.
    pub default_timeout: Duration,

    /// Sink for outcome metrics; also handed to test functions.
    pub metrics: Arc<dyn MetricsSink>,

    /// Destination of pass/fail lines and test logs.
    pub output: Output,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            metrics: Arc::new(PrometheusSink::default()),
            output: Output::stderr(),
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
}

impl Outcome {
    /// Metric tag value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

struct State {
    cases: HashMap<String, TestCase>,
    started: bool,
}

/// Runs registered test cases on their periods until closed.
pub struct Scheduler {
    state: Mutex<State>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
    loops: TaskTracker,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            state: Mutex::new(State {
                cases: HashMap::new(),
                started: false,
            }),
            config,
            shutdown: CancellationToken::new(),
            loops: TaskTracker::new(),
        }
    }

    /// Start building a scheduler from the default configuration.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a case, replacing any case with the same name.
    ///
    /// Only cases registered before [`start`](Self::start) are guaranteed
    /// to run.
    pub fn register(&self, case: TestCase) {
        debug!(
            case = %case.name,
            period_ms = case.period.as_millis() as u64,
            "Registering test case"
        );
        self.state().cases.insert(case.name.clone(), case);
    }

    /// Spawn one loop per registered case. Calling it again is a no-op.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut state = self.state();
        if state.started {
            return;
        }
        state.started = true;

        for case in state.cases.values() {
            let runner = Arc::new(CaseRunner {
                case: case.clone(),
                config: self.config.clone(),
                shutdown: self.shutdown.clone(),
            });
            self.loops.spawn(runner.run());
        }

        info!(cases = state.cases.len(), "Scheduler started");
    }

    /// Stop all loops, cancel in-flight invocations and wait for them.
    ///
    /// Safe to call more than once. A test function that ignores
    /// cancellation delays this call until it returns.
    pub async fn close(&self) -> Result<(), SchedulerError> {
        if !self.shutdown.is_cancelled() {
            info!(in_flight_loops = self.loops.len(), "Scheduler shutting down");
        }
        self.shutdown.cancel();
        self.loops.close();
        self.loops.wait().await;
        debug!("Scheduler shutdown complete");
        Ok(())
    }

    /// Whether [`start`](Self::start) has been called.
    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// Names of the registered cases, sorted.
    pub fn case_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().cases.keys().cloned().collect();
        names.sort();
        names
    }

    /// The metrics sink shared with test functions.
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.config.metrics
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Builder for [`Scheduler`].
#[derive(Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.config.metrics = metrics;
        self
    }

    pub fn output(mut self, output: Output) -> Self {
        self.config.output = output;
        self
    }

    pub fn build(self) -> Scheduler {
        Scheduler::new(self.config)
    }
}

/// Pick the case timeout when it is above the floor, else the default.
pub(crate) fn effective_timeout(case: Option<Duration>, default: Duration) -> Duration {
    match case {
        Some(timeout) if timeout > TIMEOUT_FLOOR => timeout,
        _ => default,
    }
}

/// Owns the periodic loop for a single case.
struct CaseRunner {
    case: TestCase,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl CaseRunner {
    #[instrument(skip(self), fields(case = %self.case.name))]
    async fn run(self: Arc<Self>) {
        let period = self.case.period.max(MIN_PERIOD);
        debug!(period_ms = period.as_millis() as u64, "Starting case loop");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the first run happens one period in.
        interval.tick().await;

        let invocations = TaskTracker::new();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let cancel = self.shutdown.child_token();
                    invocations.spawn(Arc::clone(&self).invoke(cancel));
                }
            }
        }

        invocations.close();
        debug!(in_flight = invocations.len(), "Draining case loop");
        invocations.wait().await;
        debug!("Case loop stopped");
    }

    async fn invoke(self: Arc<Self>, cancel: CancellationToken) {
        let start = Instant::now();
        let name = self.case.name.as_str();
        let t = TestContext::new(
            name,
            self.config.output.clone(),
            Arc::clone(&self.config.metrics),
        );

        let timeout = effective_timeout(self.case.timeout, self.config.default_timeout);
        let ctx = Context::from_token(cancel).with_timeout(timeout);

        let run = self.case.func.run(ctx.clone(), t.clone());
        if AssertUnwindSafe(run).catch_unwind().await.is_err() {
            t.error("test function panicked");
        }

        if let Some(err) = ctx.err() {
            if !t.failed() {
                t.error(format_args!("failed on context error: {err}"));
            }
        }

        let elapsed = start.elapsed();
        let outcome = if t.failed() {
            Outcome::Fail
        } else {
            Outcome::Pass
        };
        self.record(outcome, elapsed);
    }

    fn record(&self, outcome: Outcome, elapsed: Duration) {
        let name = self.case.name.as_str();

        let mut tags = vec![
            Tag::new("case", name),
            Tag::new("result", outcome.as_str()),
        ];
        tags.extend(self.case.tags.iter().cloned());
        self.config.metrics.observe(CASE_METRIC, elapsed, &tags);

        self.config
            .output
            .write_str(&format!("--- {}: {} ({:?})\n", outcome.label(), name, elapsed));

        let duration_ms = elapsed.as_millis() as u64;
        match outcome {
            Outcome::Pass => info!(case = %name, duration_ms, "Test case passed"),
            Outcome::Fail => warn!(case = %name, duration_ms, "Test case failed"),
        }
    }
}
