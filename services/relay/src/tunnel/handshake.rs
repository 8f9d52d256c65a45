//! CONNECT handshake negotiation.
//!
//! Drives one accepted client channel from the first byte to either an
//! established tunnel or a failure status:
//!
//! ```text
//! AwaitingRequestLine -> TargetParsed -> UpstreamConnecting -> Established
//!          \                  \                  \
//!           +------------------+------------------+--> Failed
//! ```
//!
//! The request head is read into a single buffer. Anything read past the
//! blank line ending the head is tunnel payload and is handed back as the
//! [`PendingHead`], never dropped.

use std::fmt;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::head::PendingHead;
use super::target::{parse_connect_bytes, Target};
use super::upstream::{connect_upstream, Connector, DEFAULT_CONNECT_TIMEOUT};
use crate::error::RelayError;

/// Default cap on the request line plus headers (16 KiB).
pub const DEFAULT_MAX_HEAD_BYTES: usize = 16 * 1024;

/// Bound on writing a failure status to a client that may not be reading.
const STATUS_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 4096;

/// Handshake progress for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingRequestLine,
    TargetParsed,
    UpstreamConnecting,
    Established,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeState::AwaitingRequestLine => "awaiting_request_line",
            HandshakeState::TargetParsed => "target_parsed",
            HandshakeState::UpstreamConnecting => "upstream_connecting",
            HandshakeState::Established => "established",
            HandshakeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status lines the relay writes to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLine {
    Established,
    BadRequest,
    RequestTimeout,
    HeaderTooLarge,
    BadGateway,
    GatewayTimeout,
}

impl StatusLine {
    pub fn code(self) -> u16 {
        match self {
            StatusLine::Established => 200,
            StatusLine::BadRequest => 400,
            StatusLine::RequestTimeout => 408,
            StatusLine::HeaderTooLarge => 431,
            StatusLine::BadGateway => 502,
            StatusLine::GatewayTimeout => 504,
        }
    }

    /// Full response head, terminator included.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            StatusLine::Established => b"HTTP/1.1 200 Connection Established\r\n\r\n",
            StatusLine::BadRequest => {
                b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
            }
            StatusLine::RequestTimeout => {
                b"HTTP/1.1 408 Request Timeout\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
            }
            StatusLine::HeaderTooLarge => {
                b"HTTP/1.1 431 Request Header Fields Too Large\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
            }
            StatusLine::BadGateway => {
                b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
            }
            StatusLine::GatewayTimeout => {
                b"HTTP/1.1 504 Gateway Timeout\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
            }
        }
    }
}

/// Knobs for one negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub connect_timeout: Duration,
    pub max_head_bytes: usize,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
        }
    }
}

/// A successfully negotiated tunnel, ready for head reconciliation.
#[derive(Debug)]
pub struct Established<U> {
    pub target: Target,
    pub upstream: U,
    pub head: PendingHead,
}

/// Run the CONNECT exchange on `client`.
///
/// `state` is updated as the handshake advances so a caller that abandons
/// this future (deadline) still knows how far it got. On failure the owed
/// status line has already been written when this returns.
pub async fn negotiate<S, C>(
    client: &mut S,
    connector: &C,
    options: &HandshakeOptions,
    state: &mut HandshakeState,
) -> Result<Established<C::Stream>, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    C: Connector + ?Sized,
{
    *state = HandshakeState::AwaitingRequestLine;

    match establish(client, connector, options, state).await {
        Ok(established) => {
            *state = HandshakeState::Established;
            Ok(established)
        }
        Err(err) => {
            *state = HandshakeState::Failed;
            if let Some(status) = err.client_status() {
                if let Err(e) = write_status_bounded(client, status).await {
                    debug!(status = status.code(), error = %e, "Failed to send error status");
                }
            }
            Err(err)
        }
    }
}

async fn establish<S, C>(
    client: &mut S,
    connector: &C,
    options: &HandshakeOptions,
    state: &mut HandshakeState,
) -> Result<Established<C::Stream>, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    C: Connector + ?Sized,
{
    let (target, head) = read_request_head(client, options.max_head_bytes, state).await?;
    debug!(target = %target, pending_head = head.len(), "CONNECT request parsed");

    *state = HandshakeState::UpstreamConnecting;
    let upstream = connect_upstream(connector, &target, options.connect_timeout).await?;

    // From here on the client may legally send tunnel bytes.
    write_status(client, StatusLine::Established).await?;

    Ok(Established {
        target,
        upstream,
        head,
    })
}

/// Read the request head, returning the parsed target and any bytes that
/// followed the head terminator.
///
/// The request line is parsed as soon as it is complete, so a bad line fails
/// without waiting for headers. Header lines are skipped uninterpreted.
pub async fn read_request_head<S>(
    client: &mut S,
    max_head_bytes: usize,
    state: &mut HandshakeState,
) -> Result<(Target, PendingHead), RelayError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut target = None;

    loop {
        if target.is_none() {
            if let Some(line_end) = find_line_end(&buf) {
                if line_end > max_head_bytes {
                    return Err(RelayError::RequestTooLarge {
                        limit: max_head_bytes,
                    });
                }
                let parsed = parse_connect_bytes(&buf[..line_end])
                    .map_err(|e| RelayError::malformed(e.to_string()))?;
                *state = HandshakeState::TargetParsed;
                target = Some(parsed);
            }
        }

        if let Some(target) = target.as_ref() {
            if let Some(head_end) = find_head_end(&buf) {
                if head_end > max_head_bytes {
                    return Err(RelayError::RequestTooLarge {
                        limit: max_head_bytes,
                    });
                }
                let _request_head = buf.split_to(head_end);
                return Ok((target.clone(), PendingHead::new(buf.freeze())));
            }
        }

        if buf.len() >= max_head_bytes {
            return Err(RelayError::RequestTooLarge {
                limit: max_head_bytes,
            });
        }

        buf.reserve(READ_CHUNK);
        if client.read_buf(&mut buf).await? == 0 {
            return Err(if buf.is_empty() {
                RelayError::ClientClosed
            } else {
                RelayError::malformed("client closed before end of request head")
            });
        }
    }
}

/// Write a complete status response and flush.
pub async fn write_status<W>(client: &mut W, status: StatusLine) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    client.write_all(status.as_bytes()).await?;
    client.flush().await
}

/// [`write_status`] that gives up on clients not draining their socket.
pub async fn write_status_bounded<W>(client: &mut W, status: StatusLine) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match timeout(STATUS_WRITE_TIMEOUT, write_status(client, status)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "status write timed out",
        )),
    }
}

/// Offset of the first `\n`, exclusive.
fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Offset just past the blank line ending the head.
///
/// Accepts `\r\n` and bare `\n` line endings.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut start = find_line_end(buf)? + 1;
    while let Some(rel) = find_line_end(&buf[start..]) {
        let line = &buf[start..start + rel];
        start += rel + 1;
        if line.is_empty() || line == b"\r" {
            return Some(start);
        }
    }
    None
}
