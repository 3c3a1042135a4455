//! End-to-end pipeline test.
//!
//! Runs the echo service and the tester in one process on ephemeral ports:
//!
//! 1. The scheduler invokes the smoke test
//! 2. The smoke test posts an event to echo
//! 3. Echo marks it processed and posts it to the tester webhook
//! 4. The webhook delivers the callback to the waiting smoke test
//!
//! ## Running
//!
//! ```bash
//! cargo test -p canary-e2e --test pipeline
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use canary_correlate::CorrelationRegistry;
use canary_echo::EchoState;
use canary_scheduler::{
    MemorySink, MetricsSink, Output, PrometheusSink, Scheduler, SchedulerConfig, TestCase,
};
use canary_webhook::{event_id, AppState, SmokeHarness, Webhook};
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Serve `app` on an ephemeral port until `shutdown` flips to true.
async fn serve(app: axum::Router, mut shutdown: watch::Receiver<bool>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap();
    });

    addr
}

struct Pipeline {
    tester_addr: SocketAddr,
    registry: Arc<CorrelationRegistry>,
    scheduler: Scheduler,
    shutdown: watch::Sender<bool>,
}

/// Wire tester and echo together. With `break_echo` set, echo forwards to
/// an address nothing listens on.
async fn pipeline(
    metrics: Arc<dyn MetricsSink>,
    sink: Arc<PrometheusSink>,
    break_echo: bool,
) -> Pipeline {
    init_tracing();
    let (shutdown, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(CorrelationRegistry::new(event_id));
    let tester =
        canary_webhook::create_router(AppState::new(Webhook::new(registry.clone()), sink));
    let tester_addr = serve(tester, shutdown_rx.clone()).await;

    let upstream = if break_echo {
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);
        format!("http://{addr}/")
    } else {
        format!("http://{tester_addr}/callback")
    };
    let echo = canary_echo::create_router(EchoState::new(upstream, reqwest::Client::new()));
    let echo_addr = serve(echo, shutdown_rx).await;

    let scheduler = Scheduler::new(SchedulerConfig {
        default_timeout: Duration::from_secs(5),
        metrics,
        output: Output::capture(),
    });
    let harness = SmokeHarness::new(
        format!("http://{echo_addr}/events"),
        Arc::clone(&registry),
        reqwest::Client::new(),
    );
    scheduler.register(
        TestCase::new("smoke test", Duration::from_millis(50), harness)
            .with_timeout(Duration::from_secs(2)),
    );

    Pipeline {
        tester_addr,
        registry,
        scheduler,
        shutdown,
    }
}

fn test_sink() -> Arc<PrometheusSink> {
    Arc::new(PrometheusSink::new(Registry::new(), "canary"))
}

#[tokio::test]
async fn test_smoke_test_passes_through_pipeline() {
    let sink = Arc::new(MemorySink::new());
    let p = pipeline(sink.clone(), test_sink(), false).await;

    p.scheduler.start();
    tokio::time::sleep(Duration::from_millis(400)).await;
    p.scheduler.close().await.unwrap();
    let _ = p.shutdown.send(true);

    assert!(sink.count("case", "result", "pass") >= 2);
    assert_eq!(sink.count("case", "result", "fail"), 0);
    assert!(p.registry.is_empty());
}

#[tokio::test]
async fn test_broken_pipeline_fails() {
    let sink = Arc::new(MemorySink::new());
    let p = pipeline(sink.clone(), test_sink(), true).await;

    p.scheduler.start();
    tokio::time::sleep(Duration::from_millis(300)).await;
    p.scheduler.close().await.unwrap();
    let _ = p.shutdown.send(true);

    assert!(sink.count("case", "result", "fail") >= 1);
    assert_eq!(sink.count("case", "result", "pass"), 0);
    assert!(p.registry.is_empty());
}

#[tokio::test]
async fn test_metrics_endpoint_reports_outcomes() {
    let sink = test_sink();
    let p = pipeline(sink.clone(), sink.clone(), false).await;

    p.scheduler.start();
    tokio::time::sleep(Duration::from_millis(300)).await;
    p.scheduler.close().await.unwrap();

    let client = reqwest::Client::new();
    let health = client
        .get(format!("http://{}/internal/health", p.tester_addr))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());

    let text = client
        .get(format!("http://{}/internal/metrics", p.tester_addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("canary_case_seconds_count"));
    assert!(text.contains(r#"result="pass""#));

    let _ = p.shutdown.send(true);
}
