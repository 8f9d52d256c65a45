//! Outbound connections to CONNECT targets.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use super::target::Target;
use crate::error::RelayError;

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens outbound channels to targets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Channel type produced by a successful connect.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Resolve and connect to `target`.
    ///
    /// Implementations must not leave a half-open channel behind on error;
    /// the future may also be dropped mid-way when the connect timeout fires.
    async fn connect(&self, target: &Target) -> io::Result<Self::Stream>;
}

/// TCP connector resolving targets through the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, target: &Target) -> io::Result<TcpStream> {
        let addrs: Vec<_> = lookup_host((target.host(), target.port())).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "DNS resolution returned no addresses",
            ));
        }

        // Try each resolved address in order until one accepts.
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(target = %target, upstream_addr = %addr, "Connected to upstream");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(target = %target, upstream_addr = %addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected)))
    }
}

/// Connect to `target` through `connector`, bounded by `connect_timeout`.
///
/// Every failure, including the timeout, becomes
/// [`RelayError::UpstreamUnreachable`] carrying the underlying cause.
pub async fn connect_upstream<C: Connector + ?Sized>(
    connector: &C,
    target: &Target,
    connect_timeout: Duration,
) -> Result<C::Stream, RelayError> {
    let result = match timeout(connect_timeout, connector.connect(target)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect timeout after {:?}", connect_timeout),
        )),
    };

    result.map_err(|source| RelayError::UpstreamUnreachable {
        target: target.to_string(),
        source,
    })
}
