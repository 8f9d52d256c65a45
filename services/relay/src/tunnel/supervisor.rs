//! Per-connection lifecycle.
//!
//! The supervisor owns both channels of a connection for its whole life and
//! runs the stages strictly in order: negotiate under the handshake deadline,
//! forward the pending head, then relay. Both channels are owned values inside
//! [`Supervisor::run`], so every exit path, unwinding included, drops and
//! closes them.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use burrow_id::ConnectionId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::handshake::{negotiate, write_status_bounded, Established, HandshakeState, StatusLine};
use super::listener::{ListenerConfig, ListenerStats};
use super::relay::{relay, RelayStats, RelaySummary};
use super::upstream::Connector;
use crate::error::RelayError;

/// One accepted client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    state: HandshakeState,
    deadline: Instant,
}

impl Connection {
    /// Start tracking a connection accepted now.
    pub fn new(peer_addr: Option<SocketAddr>, handshake_timeout: Duration) -> Self {
        Self {
            id: ConnectionId::new(),
            peer_addr,
            state: HandshakeState::AwaitingRequestLine,
            deadline: Instant::now() + handshake_timeout,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// How far the handshake got.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Instant by which the tunnel must be established.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wall-clock time since accept.
    pub fn age(&self) -> Duration {
        self.id.created_at().elapsed().unwrap_or_default()
    }
}

/// Runs connections end to end against a shared, read-only configuration.
pub struct Supervisor<C: Connector> {
    config: Arc<ListenerConfig>,
    connector: Arc<C>,
    stats: Arc<ListenerStats>,
}

impl<C: Connector> Clone for Supervisor<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<C: Connector> Supervisor<C> {
    pub fn new(config: Arc<ListenerConfig>, connector: Arc<C>, stats: Arc<ListenerStats>) -> Self {
        Self {
            config,
            connector,
            stats,
        }
    }

    /// Drive `client` through handshake, head reconciliation and relay.
    ///
    /// `cancel` only applies once the tunnel is established; the handshake is
    /// already bounded by the connection deadline.
    pub async fn run<S, F>(
        &self,
        conn: &mut Connection,
        mut client: S,
        cancel: F,
    ) -> Result<RelaySummary, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        F: Future<Output = ()>,
    {
        let handshake = self.config.handshake_options();
        let negotiated = timeout_at(
            conn.deadline,
            negotiate(&mut client, &*self.connector, &handshake, &mut conn.state),
        )
        .await;

        let Established {
            target,
            mut upstream,
            head,
        } = match negotiated {
            Ok(result) => result?,
            Err(_) => {
                conn.state = HandshakeState::Failed;
                if self.config.timeout_status {
                    if let Err(e) = write_status_bounded(&mut client, StatusLine::RequestTimeout).await {
                        debug!(error = %e, "Failed to send timeout status");
                    }
                }
                return Err(RelayError::HandshakeTimeout(self.config.handshake_timeout));
            }
        };

        self.stats.tunnels_established.fetch_add(1, Ordering::Relaxed);
        info!(target = %target, pending_head = head.len(), "Tunnel established");

        let tunnel_stats = RelayStats::default();
        let result = async {
            // Pending head goes out before the relay reads from the client.
            let forwarded = head
                .forward(&mut upstream)
                .await
                .map_err(RelayError::RelayTransport)?;
            tunnel_stats
                .client_to_upstream
                .fetch_add(forwarded as u64, Ordering::Relaxed);

            relay(
                client,
                upstream,
                &self.config.relay_options(),
                &tunnel_stats,
                cancel,
            )
            .await
        }
        .await;

        let summary = tunnel_stats.snapshot();
        self.stats
            .bytes_to_upstream
            .fetch_add(summary.client_to_upstream, Ordering::Relaxed);
        self.stats
            .bytes_from_upstream
            .fetch_add(summary.upstream_to_client, Ordering::Relaxed);

        result.map(|()| summary)
    }

    /// [`Supervisor::run`] plus outcome logging and stats.
    pub async fn serve<S, F>(&self, mut conn: Connection, client: S, cancel: F)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        F: Future<Output = ()>,
    {
        match self.run(&mut conn, client, cancel).await {
            Ok(summary) => {
                debug!(
                    bytes_to_upstream = summary.client_to_upstream,
                    bytes_from_upstream = summary.upstream_to_client,
                    duration_ms = conn.age().as_millis() as u64,
                    "Tunnel closed"
                );
            }
            Err(err) => self.record_failure(&conn, &err),
        }
    }

    fn record_failure(&self, conn: &Connection, err: &RelayError) {
        if err.is_handshake_failure() {
            self.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        }

        match err {
            RelayError::UpstreamUnreachable { target, source } => {
                self.stats.upstream_failed.fetch_add(1, Ordering::Relaxed);
                warn!(target = %target, error = %source, reason = err.reason_code(), "Upstream unreachable");
            }
            RelayError::HandshakeTimeout(limit) => {
                debug!(
                    state = %conn.state(),
                    timeout = ?limit,
                    reason = err.reason_code(),
                    "Handshake deadline elapsed"
                );
            }
            _ => {
                debug!(
                    state = %conn.state(),
                    error = %err,
                    reason = err.reason_code(),
                    "Connection ended with error"
                );
            }
        }
    }
}
