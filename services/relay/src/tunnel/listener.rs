//! TCP listener and connection dispatch.
//!
//! Accepts inbound connections, caps how many run at once and hands each one
//! to its own [`Supervisor`] task. A panic inside one connection is caught,
//! logged and counted; it never takes the accept loop down with it.

use std::any::Any;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burrow_id::ListenerId;
use futures_util::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::handshake::{HandshakeOptions, DEFAULT_MAX_HEAD_BYTES};
use super::relay::{RelayOptions, DEFAULT_DRAIN_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use super::supervisor::{Connection, Supervisor};
use super::upstream::{Connector, TcpConnector, DEFAULT_CONNECT_TIMEOUT};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default deadline for a client to complete the CONNECT handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before accepting again after a transient accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Deadline from accept to established tunnel.
    pub handshake_timeout: Duration,
    /// Bound on a single upstream connect attempt.
    pub connect_timeout: Duration,
    /// Idle timeout for established tunnels.
    pub idle_timeout: Option<Duration>,
    /// How long the second direction may drain after the first closes.
    pub drain_timeout: Option<Duration>,
    /// Largest accepted request head.
    pub max_head_bytes: usize,
    /// Answer handshake timeouts with `408 Request Timeout` instead of
    /// closing silently.
    pub timeout_status: bool,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            timeout_status: false,
        }
    }

    pub fn handshake_options(&self) -> HandshakeOptions {
        HandshakeOptions {
            connect_timeout: self.connect_timeout,
            max_head_bytes: self.max_head_bytes,
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            idle_timeout: self.idle_timeout,
            drain_timeout: self.drain_timeout,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections that never reached an established tunnel.
    pub handshakes_failed: AtomicU64,
    /// Tunnels established.
    pub tunnels_established: AtomicU64,
    /// Upstream resolve/connect failures.
    pub upstream_failed: AtomicU64,
    /// Supervisor tasks that panicked.
    pub panics: AtomicU64,
    /// Bytes relayed to upstream, pending heads included.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed from upstream.
    pub bytes_from_upstream: AtomicU64,
}

/// A TCP listener for the CONNECT relay.
pub struct Listener<C: Connector = TcpConnector> {
    id: ListenerId,
    /// Listener configuration.
    config: Arc<ListenerConfig>,
    /// The TCP listener.
    listener: TcpListener,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Per-connection lifecycle runner, cloned into each task.
    supervisor: Supervisor<C>,
    /// Flips to `true` once when the listener shuts down.
    shutdown: watch::Sender<bool>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl<C: Connector> Listener<C> {
    /// Bind a new listener that reaches targets through `connector`.
    pub async fn bind(config: ListenerConfig, connector: C) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let id = ListenerId::new();

        info!(
            listener_id = %id,
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        let config = Arc::new(config);
        let stats = Arc::new(ListenerStats::default());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            id,
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            supervisor: Supervisor::new(Arc::clone(&config), Arc::new(connector), Arc::clone(&stats)),
            listener,
            config,
            shutdown,
            stats,
        })
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Run the listener, accepting and handling connections until a fatal
    /// accept error.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the listener until `shutdown` resolves.
    ///
    /// On shutdown the listener stops accepting, cancels every established
    /// tunnel and waits for all connection tasks to finish. Connections still
    /// negotiating are left to their handshake deadline.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.listener.local_addr()?;
        let span = info_span!("listener", listener_id = %self.id, bind_addr = %local_addr);

        async move {
            info!("Listener started");
            tokio::pin!(shutdown);

            loop {
                let accepted = tokio::select! {
                    _ = &mut shutdown => break,
                    accepted = self.listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr),
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!(error = %e, "Transient accept error");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Fatal accept error");
                        return Err(e);
                    }
                }
            }

            let active = self.stats.connections_active.load(Ordering::Relaxed);
            info!(active_connections = active, "Shutting down listener");
            self.shutdown.send_replace(true);

            // Every live task holds a permit; getting them all back means
            // every task has exited.
            let all = u32::try_from(self.config.max_connections).unwrap_or(u32::MAX);
            let _ = self.conn_semaphore.acquire_many(all).await;

            info!("Listener stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        // Try to acquire a permit
        let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let conn = Connection::new(Some(peer_addr), self.config.handshake_timeout);
        let span = info_span!("connection", conn_id = %conn.id(), peer = %peer_addr);
        let supervisor = self.supervisor.clone();
        let stats = Arc::clone(&self.stats);
        let cancel = cancelled(self.shutdown.subscribe());

        tokio::spawn(
            async move {
                let outcome = AssertUnwindSafe(supervisor.serve(conn, stream, cancel))
                    .catch_unwind()
                    .await;
                if let Err(panic) = outcome {
                    stats.panics.fetch_add(1, Ordering::Relaxed);
                    error!(panic = %panic_message(panic.as_ref()), "Connection task panicked");
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            }
            .instrument(span),
        );
    }
}

/// Resolves once the listener signals shutdown. Never resolves if the
/// listener is dropped without signalling.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    let sender_gone = rx.wait_for(|stop| *stop).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

/// Accept errors that concern a single connection or momentary resource
/// pressure rather than the listening socket itself.
fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
