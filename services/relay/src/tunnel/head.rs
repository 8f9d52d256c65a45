//! Bytes that arrived with the CONNECT request but belong to the tunnel.
//!
//! A client may pipeline its first tunnel bytes (typically a TLS ClientHello)
//! right behind the request head, and a single read can return both. Whatever
//! lies past the head terminator becomes the [`PendingHead`] and must reach
//! upstream before the relay reads anything else from the client.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Tunnel bytes captured during the handshake.
///
/// Consumed by value so it can only be forwarded once.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PendingHead(Bytes);

impl PendingHead {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Write the captured bytes to upstream, in order, and flush.
    ///
    /// Returns the number of bytes forwarded. An empty head writes nothing.
    pub async fn forward<W>(self, upstream: &mut W) -> std::io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.0.is_empty() {
            return Ok(0);
        }
        upstream.write_all(&self.0).await?;
        upstream.flush().await?;
        debug!(bytes = self.0.len(), "Forwarded pending head to upstream");
        Ok(self.0.len())
    }
}
