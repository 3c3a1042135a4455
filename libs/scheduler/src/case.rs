//! Test case descriptors.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canary_context::Context;

use crate::metrics::Tag;
use crate::test_context::TestContext;

/// Body of a test case.
///
/// Implementations should block until the test is complete, release every
/// resource they acquired (including registry keys) before returning, and
/// select on [`Context::done`] in long-running waits. Collaborators such as
/// HTTP clients or the correlation registry belong in the implementing type.
///
/// Closures `Fn(Context, TestContext) -> impl Future<Output = ()>` implement
/// this trait as well.
#[async_trait]
pub trait TestFunc: Send + Sync + 'static {
    async fn run(&self, ctx: Context, t: TestContext);
}

#[async_trait]
impl<F, Fut> TestFunc for F
where
    F: Fn(Context, TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self, ctx: Context, t: TestContext) {
        (self)(ctx, t).await
    }
}

/// A named test run every `period`.
#[derive(Clone)]
pub struct TestCase {
    /// Unique name. Also used as a metric dimension.
    pub name: String,

    /// Time between invocations.
    pub period: Duration,

    /// Per-invocation timeout. Falls back to the scheduler default when
    /// unset or not above [`TIMEOUT_FLOOR`](crate::TIMEOUT_FLOOR).
    pub timeout: Option<Duration>,

    /// The test body.
    pub func: Arc<dyn TestFunc>,

    /// Extra metric dimensions.
    pub tags: Vec<Tag>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, period: Duration, func: impl TestFunc) -> Self {
        Self {
            name: name.into(),
            period,
            timeout: None,
            func: Arc::new(func),
            tags: Vec::new(),
        }
    }

    /// Like [`new`](Self::new), for closures. Lets the compiler infer the
    /// closure's argument types.
    pub fn from_fn<F, Fut>(name: impl Into<String>, period: Duration, func: F) -> Self
    where
        F: Fn(Context, TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(name, period, func)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("timeout", &self.timeout)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}
