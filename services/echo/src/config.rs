use std::net::SocketAddr;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CANARY_ECHO_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse()
            .context("invalid CANARY_ECHO_LISTEN_ADDR")?;

        let upstream_url = std::env::var("CANARY_ECHO_UPSTREAM_URL")
            .unwrap_or_else(|_| "http://localhost:3001/".to_string());

        let log_level = std::env::var("CANARY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            upstream_url,
            log_level,
        })
    }
}
