use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::webhook::MAX_BODY_BYTES;

/// Smallest accepted smoke test period.
const MIN_SMOKE_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub target_url: String,
    pub log_level: String,
    pub default_timeout: Duration,
    pub smoke_period: Duration,
    pub smoke_timeout: Duration,
    pub max_body_bytes: usize,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CANARY_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3001".to_string())
            .parse()
            .context("invalid CANARY_LISTEN_ADDR")?;

        let target_url = std::env::var("CANARY_TARGET_URL")
            .unwrap_or_else(|_| "http://localhost:3000/".to_string());

        let log_level = std::env::var("CANARY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let default_timeout = Duration::from_millis(env_u64("CANARY_DEFAULT_TIMEOUT_MS", 5_000)?);
        let smoke_period = Duration::from_millis(env_u64("CANARY_SMOKE_PERIOD_MS", 1_000)?)
            .max(MIN_SMOKE_PERIOD);
        let smoke_timeout = Duration::from_millis(env_u64("CANARY_SMOKE_TIMEOUT_MS", 3_000)?);

        let max_body_bytes =
            env_u64("CANARY_MAX_BODY_BYTES", MAX_BODY_BYTES as u64)? as usize;

        let shutdown_timeout = Duration::from_secs(env_u64("CANARY_SHUTDOWN_TIMEOUT_SECS", 10)?);

        Ok(Self {
            listen_addr,
            target_url,
            log_level,
            default_timeout,
            smoke_period,
            smoke_timeout,
            max_body_bytes,
            shutdown_timeout,
        })
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
