//! burrow relay
//!
//! HTTP CONNECT tunneling relay.
//!
//! This service:
//! - Accepts TCP connections on the configured address
//! - Negotiates a CONNECT handshake and dials the requested target
//! - Forwards bytes the client pipelined behind the request
//! - Relays both directions until either side closes
//! - Drains live tunnels on Ctrl-C

use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_relay::{Listener, TcpConnector};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to BURROW_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting burrow relay");
    info!(
        bind_addr = %config.bind_addr,
        handshake_timeout_ms = config.handshake_timeout.as_millis() as u64,
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        idle_timeout_ms = config.idle_timeout.map(|d| d.as_millis() as u64),
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let listener = Listener::bind(config.listener_config(), TcpConnector::new())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    let listener = Arc::new(listener);

    if let Err(e) = Arc::clone(&listener).run_until(shutdown_signal()).await {
        error!(error = %e, "Listener failed");
        return Err(e.into());
    }

    let stats = listener.stats();
    info!(
        connections = stats.connections_accepted.load(std::sync::atomic::Ordering::Relaxed),
        tunnels = stats.tunnels_established.load(std::sync::atomic::Ordering::Relaxed),
        "Relay stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            // Without a signal handler, keep serving until killed.
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    }
}
