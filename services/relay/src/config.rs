//! Relay configuration.

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use burrow_relay::tunnel::{
    ListenerConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DRAIN_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_HEAD_BYTES,
};

/// Smallest request head limit worth running with.
const MIN_HEAD_BYTES: usize = 256;

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept CONNECT clients on.
    pub bind_addr: SocketAddr,

    /// Deadline from accept to established tunnel.
    pub handshake_timeout: Duration,

    /// Bound on one upstream connect attempt.
    pub connect_timeout: Duration,

    /// Tear down tunnels idle for this long (disabled when unset).
    pub idle_timeout: Option<Duration>,

    /// Drain bound after the first half-close; `None` waits indefinitely.
    pub drain_timeout: Option<Duration>,

    /// Max concurrent connections.
    pub max_connections: usize,

    /// Max request head size in bytes.
    pub max_head_bytes: usize,

    /// Send `408 Request Timeout` when the handshake deadline elapses.
    pub timeout_status: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr: SocketAddr = var("BURROW_BIND_ADDR")
            .map(|v| v.parse())
            .transpose()
            .context("BURROW_BIND_ADDR must be a socket address (example: 127.0.0.1:8080).")?
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

        let handshake_timeout = millis(&var, "BURROW_HANDSHAKE_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);
        let connect_timeout =
            millis(&var, "BURROW_CONNECT_TIMEOUT_MS")?.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let idle_timeout = millis(&var, "BURROW_IDLE_TIMEOUT_MS")?;

        for (name, value) in [
            ("BURROW_HANDSHAKE_TIMEOUT_MS", Some(handshake_timeout)),
            ("BURROW_CONNECT_TIMEOUT_MS", Some(connect_timeout)),
            ("BURROW_IDLE_TIMEOUT_MS", idle_timeout),
        ] {
            if value == Some(Duration::ZERO) {
                bail!("{name} must be greater than zero.");
            }
        }

        // 0 disables the drain bound.
        let drain_timeout = match millis(&var, "BURROW_DRAIN_TIMEOUT_MS")? {
            Some(Duration::ZERO) => None,
            Some(d) => Some(d),
            None => DEFAULT_DRAIN_TIMEOUT,
        };

        let max_connections: usize = var("BURROW_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("BURROW_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            bail!("BURROW_MAX_CONNECTIONS must be greater than zero.");
        }

        let max_head_bytes: usize = var("BURROW_MAX_HEAD_BYTES")
            .map(|v| v.parse())
            .transpose()
            .context("BURROW_MAX_HEAD_BYTES must be an integer (bytes).")?
            .unwrap_or(DEFAULT_MAX_HEAD_BYTES);
        if max_head_bytes < MIN_HEAD_BYTES {
            bail!("BURROW_MAX_HEAD_BYTES must be at least {MIN_HEAD_BYTES}.");
        }

        let timeout_status = var("BURROW_TIMEOUT_STATUS")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let log_level = var("BURROW_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bind_addr,
            handshake_timeout,
            connect_timeout,
            idle_timeout,
            drain_timeout,
            max_connections,
            max_head_bytes,
            timeout_status,
            log_level,
        })
    }

    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.bind_addr);
        config.max_connections = self.max_connections;
        config.handshake_timeout = self.handshake_timeout;
        config.connect_timeout = self.connect_timeout;
        config.idle_timeout = self.idle_timeout;
        config.drain_timeout = self.drain_timeout;
        config.max_head_bytes = self.max_head_bytes;
        config.timeout_status = self.timeout_status;
        config
    }
}

fn millis(var: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    let ms: Option<u64> = var(key)
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{key} must be an integer (milliseconds)."))?;
    Ok(ms.map(Duration::from_millis))
}
