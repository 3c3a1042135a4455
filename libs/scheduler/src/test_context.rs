//! Per-invocation test handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::metrics::MetricsSink;
use crate::output::Output;

/// Handle given to a test function for logging and signalling failure.
///
/// Clones share state, so a test may move clones into helper tasks. The
/// scheduler creates a fresh handle for every invocation and reads
/// [`failed`](Self::failed) once the test function has returned.
#[derive(Clone)]
pub struct TestContext {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    failed: AtomicBool,
    output: Output,
    metrics: Arc<dyn MetricsSink>,
}

impl TestContext {
    /// Create a handle for one invocation of the case `name`.
    pub fn new(name: impl Into<String>, output: Output, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                failed: AtomicBool::new(false),
                output,
                metrics,
            }),
        }
    }

    /// Name of the running case.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark the invocation as failed. There is no way to undo this.
    pub fn fail(&self) {
        self.inner.failed.store(true, Ordering::SeqCst);
    }

    /// Whether the invocation has been marked as failed.
    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Write a line to the output. A trailing newline is added unless the
    /// message already ends with one.
    ///
    /// Use `format_args!` for formatted messages.
    pub fn log(&self, msg: impl fmt::Display) {
        let mut line = msg.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.inner.output.write_str(&line);
    }

    /// [`log`](Self::log) followed by [`fail`](Self::fail).
    pub fn error(&self, msg: impl fmt::Display) {
        self.log(msg);
        self.fail();
    }

    /// Report `msg` as an error unless `cond` holds. Returns `cond`.
    pub fn check(&self, cond: bool, msg: impl fmt::Display) -> bool {
        if !cond {
            self.error(msg);
        }
        cond
    }

    /// Unwrap `result`, reporting `msg` and the error on failure.
    ///
    /// Execution continues either way so the caller can still clean up.
    pub fn check_ok<T, E: fmt::Display>(
        &self,
        result: Result<T, E>,
        msg: impl fmt::Display,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.error(format_args!("{msg}: {e}"));
                None
            }
        }
    }

    /// The shared metrics sink, for domain metrics emitted by the test.
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.inner.metrics
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("name", &self.inner.name)
            .field("failed", &self.failed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::metrics::{MemorySink, Tag};

    fn context() -> (TestContext, Output, Arc<MemorySink>) {
        let output = Output::capture();
        let sink = Arc::new(MemorySink::new());
        let t = TestContext::new("unit", output.clone(), sink.clone());
        (t, output, sink)
    }

    #[test]
    fn test_log_adds_exactly_one_newline() {
        let (t, output, _) = context();

        t.log("plain");
        t.log("already\n");
        t.log(format_args!("{} + {}", 1, 2));
        t.log("");

        assert_eq!(output.captured().unwrap(), "plain\nalready\n1 + 2\n\n");
        assert!(!t.failed());
    }

    #[test]
    fn test_fail_is_sticky_and_shared() {
        let (t, _, _) = context();
        let clone = t.clone();

        clone.fail();
        clone.fail();
        assert!(t.failed());
    }

    #[test]
    fn test_error_logs_and_fails() {
        let (t, output, _) = context();

        t.error(format_args!("expected {}, got {}", 200, 500));
        assert!(t.failed());
        assert_eq!(output.captured().unwrap(), "expected 200, got 500\n");
    }

    #[test]
    fn test_check_helpers() {
        let (t, output, _) = context();

        assert!(t.check(true, "not logged"));
        assert_eq!(t.check_ok(Ok::<_, String>(5), "not logged"), Some(5));
        assert!(!t.failed());

        assert_eq!(
            t.check_ok(Err::<u8, _>("boom"), "sending event"),
            None
        );
        assert!(t.failed());
        assert_eq!(output.captured().unwrap(), "sending event: boom\n");
    }

    #[test]
    fn test_metrics_are_shared() {
        let (t, _, sink) = context();
        t.metrics()
            .observe("latency", Duration::from_millis(3), &[Tag::new("step", "send")]);
        assert_eq!(sink.count("latency", "step", "send"), 1);
    }
}
