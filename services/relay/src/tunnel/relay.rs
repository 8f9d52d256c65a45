//! Bidirectional byte pump for established tunnels.
//!
//! Two copy loops run concurrently, one per direction. Each chunk read is
//! written in full and flushed before the next read, so order within a
//! direction is preserved and nothing is held back. When one direction sees
//! EOF it half-closes the opposite write side and the other direction gets a
//! bounded chance to drain.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::Either;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::debug;

use crate::error::RelayError;

/// Default drain period after the first half-close.
pub const DEFAULT_DRAIN_TIMEOUT: Option<Duration> = Some(Duration::from_secs(30));

/// Default idle timeout (none; tunnels may be long-lived).
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = None;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Relay behavior for one tunnel.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Tear down when no bytes move in either direction for this long.
    pub idle_timeout: Option<Duration>,
    /// How long the surviving direction may run after the first EOF.
    pub drain_timeout: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Byte counters for one tunnel.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Bytes written to upstream, pending head included.
    pub client_to_upstream: AtomicU64,
    /// Bytes written to the client after the success status.
    pub upstream_to_client: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelaySummary {
        RelaySummary {
            client_to_upstream: self.client_to_upstream.load(Ordering::Relaxed),
            upstream_to_client: self.upstream_to_client.load(Ordering::Relaxed),
        }
    }

}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// When bytes last moved in either direction.
#[derive(Debug)]
struct Activity {
    started: Instant,
    /// Millis since `started`.
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client_to_upstream",
            Direction::UpstreamToClient => "upstream_to_client",
        }
    }
}

/// Pump bytes between `client` and `upstream` until the tunnel ends.
///
/// Returns `Ok` when both directions finished (or the drain period ran out
/// after a clean half-close). Both channels are dropped, and so closed, on
/// return.
pub async fn relay<A, B, F>(
    client: A,
    upstream: B,
    options: &RelayOptions,
    stats: &RelayStats,
    cancel: F,
) -> Result<(), RelayError>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
    F: Future<Output = ()>,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let activity = Activity::new();
    let to_upstream = pump(
        &mut client_rd,
        &mut upstream_wr,
        &stats.client_to_upstream,
        &activity,
    );
    let to_client = pump(
        &mut upstream_rd,
        &mut client_wr,
        &stats.upstream_to_client,
        &activity,
    );
    let watchdog = idle_watchdog(&activity, options.idle_timeout);
    tokio::pin!(to_upstream, to_client, watchdog, cancel);

    let (finished, result) = tokio::select! {
        r = &mut to_upstream => (Direction::ClientToUpstream, r),
        r = &mut to_client => (Direction::UpstreamToClient, r),
        idle = &mut watchdog => return Err(RelayError::IdleTimeout(idle)),
        () = &mut cancel => return Err(RelayError::Cancelled),
    };
    result.map_err(RelayError::RelayTransport)?;
    debug!(direction = finished.as_str(), "Half-closed, draining other direction");

    let remaining = match finished {
        Direction::ClientToUpstream => Either::Left(to_client.as_mut()),
        Direction::UpstreamToClient => Either::Right(to_upstream.as_mut()),
    };
    let drain = async {
        match options.drain_timeout {
            Some(limit) => match timeout(limit, remaining).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(drain_timeout = ?limit, "Drain timeout, closing tunnel");
                    Ok(())
                }
            },
            None => remaining.await,
        }
    };

    tokio::select! {
        r = drain => r.map_err(RelayError::RelayTransport),
        idle = &mut watchdog => Err(RelayError::IdleTimeout(idle)),
        () = &mut cancel => Err(RelayError::Cancelled),
    }
}

/// Copy `reader` into `writer` until EOF, then shut `writer` down.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }

    match writer.shutdown().await {
        // Peer already gone entirely; nothing left to half-close.
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

/// Resolves `idle` after the last byte moved in either direction.
async fn idle_watchdog(activity: &Activity, idle: Option<Duration>) -> Duration {
    let Some(idle) = idle else {
        return std::future::pending().await;
    };

    loop {
        let deadline = activity.last() + idle;
        sleep_until(deadline).await;
        // Traffic during the sleep pushes the deadline out.
        if activity.last() + idle <= Instant::now() {
            return idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::DuplexStream;

    /// Client-side and upstream-side far ends plus the running relay.
    async fn spawn_relay(
        options: RelayOptions,
    ) -> (
        DuplexStream,
        DuplexStream,
        tokio::sync::oneshot::Sender<()>,
        tokio::task::JoinHandle<(Result<(), RelayError>, RelaySummary)>,
    ) {
        let (client_near, client_far) = tokio::io::duplex(4096);
        let (upstream_near, upstream_far) = tokio::io::duplex(4096);
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let stats = RelayStats::default();
            let cancel = async move {
                if cancel_rx.await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            let result = relay(client_near, upstream_near, &options, &stats, cancel).await;
            (result, stats.snapshot())
        });

        (client_far, upstream_far, cancel_tx, handle)
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways_and_half_close() {
        let (mut client, mut upstream, _cancel, handle) = spawn_relay(RelayOptions::default()).await;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Client half-closes; upstream sees EOF but can still answer.
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        upstream.write_all(b"late").await.unwrap();
        upstream.shutdown().await.unwrap();
        let mut tail = Vec::new();
        client.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, b"late");

        let (result, summary) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(summary.client_to_upstream, 4);
        assert_eq!(summary.upstream_to_client, 9);
    }

    #[tokio::test]
    async fn test_closing_one_side_ends_relay() {
        let (client, mut upstream, _cancel, handle) = spawn_relay(RelayOptions::default()).await;

        drop(client);
        // Upstream observes EOF once the client is gone.
        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        drop(upstream);

        let (result, _) = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert!(result.is_ok() || matches!(result, Err(RelayError::RelayTransport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_bounds_silent_peer() {
        let options = RelayOptions {
            idle_timeout: None,
            drain_timeout: Some(Duration::from_secs(2)),
        };
        let (mut client, _upstream, _cancel, handle) = spawn_relay(options).await;

        // Upstream never closes after the client's half-close.
        client.shutdown().await.unwrap();
        let (result, _) = handle.await.unwrap();
        result.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fires() {
        let options = RelayOptions {
            idle_timeout: Some(Duration::from_secs(10)),
            drain_timeout: None,
        };
        let (_client, _upstream, _cancel, handle) = spawn_relay(options).await;

        let (result, _) = handle.await.unwrap();
        assert!(matches!(result, Err(RelayError::IdleTimeout(d)) if d == Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline_follows_last_activity() {
        let options = RelayOptions {
            idle_timeout: Some(Duration::from_secs(10)),
            drain_timeout: None,
        };
        let started = Instant::now();
        let (mut client, mut upstream, _cancel, handle) = spawn_relay(options).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        upstream.read_exact(&mut buf).await.unwrap();

        let (result, _) = handle.await.unwrap();
        assert!(matches!(result, Err(RelayError::IdleTimeout(_))));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(16), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(17), "fired late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_close_reaches_client() {
        let options = RelayOptions {
            idle_timeout: None,
            drain_timeout: Some(Duration::from_secs(2)),
        };
        let (mut client, mut upstream, _cancel, handle) = spawn_relay(options).await;

        upstream.write_all(b"bye").await.unwrap();
        drop(upstream);

        // Bytes first, then EOF, while the client stays silent.
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        let (result, summary) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(summary.upstream_to_client, 3);
        assert_eq!(summary.client_to_upstream, 0);
    }

    #[tokio::test]
    async fn test_cancel_tears_down() {
        let (mut client, _upstream, cancel, handle) = spawn_relay(RelayOptions::default()).await;

        cancel.send(()).unwrap();
        let (result, _) = handle.await.unwrap();
        assert!(matches!(result, Err(RelayError::Cancelled)));

        // The relay's end of the client pipe is closed.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_directions_preserve_bytes(
            up in proptest::collection::vec(any::<u8>(), 0..20_000),
            down in proptest::collection::vec(any::<u8>(), 0..20_000),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (got_up, got_down) = rt.block_on(async {
                let (client, upstream, _cancel, handle) =
                    spawn_relay(RelayOptions::default()).await;
                let (mut client_rd, mut client_wr) = tokio::io::split(client);
                let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

                // Each side writes and reads concurrently so full pipes never stall.
                let send_up = async {
                    client_wr.write_all(&up).await.unwrap();
                    client_wr.shutdown().await.unwrap();
                };
                let send_down = async {
                    upstream_wr.write_all(&down).await.unwrap();
                    upstream_wr.shutdown().await.unwrap();
                };
                let recv_up = async {
                    let mut received = Vec::new();
                    upstream_rd.read_to_end(&mut received).await.unwrap();
                    received
                };
                let recv_down = async {
                    let mut received = Vec::new();
                    client_rd.read_to_end(&mut received).await.unwrap();
                    received
                };
                let ((), (), got_up, got_down) = tokio::join!(send_up, send_down, recv_up, recv_down);
                handle.await.unwrap().0.unwrap();
                (got_up, got_down)
            });
            prop_assert_eq!(got_up, up);
            prop_assert_eq!(got_down, down);
        }
    }
}
