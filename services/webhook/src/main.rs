//! canary tester
//!
//! Runs the smoke test on its period and serves the webhook the service
//! under test calls back into.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use canary_correlate::CorrelationRegistry;
use canary_scheduler::{Output, PrometheusSink, Scheduler, Tag, TestCase};
use canary_webhook::{config, create_router, event_id, AppState, SmokeHarness, Webhook};
use prometheus::Registry;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CANARY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting canary tester");
    info!(
        listen_addr = %config.listen_addr,
        target_url = %config.target_url,
        "Configuration loaded"
    );

    let sink = Arc::new(
        PrometheusSink::new(Registry::new(), "canary")
            .with_const_tags([Tag::new("version", env!("CARGO_PKG_VERSION"))]),
    );

    let scheduler = Scheduler::builder()
        .default_timeout(config.default_timeout)
        .metrics(sink.clone())
        .output(Output::stderr())
        .build();

    // Callbacks are correlated by the event id in their body
    let registry = Arc::new(CorrelationRegistry::new(event_id));

    let client = reqwest::Client::builder().build()?;
    let harness = SmokeHarness::new(config.target_url.clone(), Arc::clone(&registry), client);
    scheduler.register(
        TestCase::new("smoke test", config.smoke_period, harness)
            .with_timeout(config.smoke_timeout),
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let webhook = Webhook::new(registry).with_max_body(config.max_body_bytes);
    let app = create_router(AppState::new(webhook, sink));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let mut shutdown_rx = shutdown_rx;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
            info!("HTTP server shutting down");
        })
        .await
    });

    scheduler.start();

    let server_exited = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
            true
        }
    };

    // Signal shutdown to the server
    let _ = shutdown_tx.send(true);

    if !server_exited
        && tokio::time::timeout(config.shutdown_timeout, &mut server_handle)
            .await
            .is_err()
    {
        warn!("HTTP server did not shut down in time");
    }

    info!("Waiting for test cases to finish...");
    match tokio::time::timeout(config.shutdown_timeout, scheduler.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Scheduler shutdown failed"),
        Err(_) => warn!("Scheduler did not shut down in time"),
    }

    info!("Tester shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
