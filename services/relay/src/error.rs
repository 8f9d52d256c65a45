//! Error taxonomy for relay connections.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::tunnel::StatusLine;

/// Per-connection relay errors with standardized reason codes.
///
/// None of these escape a single connection; the listener only surfaces
/// fatal accept errors to its caller.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The request line or head framing is not a valid CONNECT request.
    #[error("malformed request: {reason}")]
    MalformedRequest { reason: String },

    /// The request head did not end within the configured size limit.
    #[error("request head exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    /// The client closed before sending a single byte.
    #[error("client closed before sending a request")]
    ClientClosed,

    /// The handshake deadline elapsed before the tunnel was established.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// DNS resolution, connect, or connect timeout failed for the target.
    #[error("upstream {target} unreachable: {source}")]
    UpstreamUnreachable {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failure after the tunnel was established.
    #[error("relay transport error: {0}")]
    RelayTransport(#[source] io::Error),

    /// No bytes moved in either direction for the idle period.
    #[error("tunnel idle for {0:?}")]
    IdleTimeout(Duration),

    /// The listener is shutting down.
    #[error("tunnel cancelled by shutdown")]
    Cancelled,

    /// I/O failure on the client channel during the handshake.
    #[error("client io error: {0}")]
    ClientIo(#[from] io::Error),
}

impl RelayError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        RelayError::MalformedRequest {
            reason: reason.into(),
        }
    }

    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::MalformedRequest { .. } => "malformed_request",
            RelayError::RequestTooLarge { .. } => "request_too_large",
            RelayError::ClientClosed => "client_closed",
            RelayError::HandshakeTimeout(_) => "handshake_timeout",
            RelayError::UpstreamUnreachable { .. } => "upstream_unreachable",
            RelayError::RelayTransport(_) => "relay_transport",
            RelayError::IdleTimeout(_) => "idle_timeout",
            RelayError::Cancelled => "cancelled",
            RelayError::ClientIo(_) => "client_io",
        }
    }

    /// Status line owed to the client before closing, if any.
    ///
    /// Handshake timeouts are answered separately since whether they get a
    /// status depends on listener configuration.
    pub fn client_status(&self) -> Option<StatusLine> {
        match self {
            RelayError::MalformedRequest { .. } => Some(StatusLine::BadRequest),
            RelayError::RequestTooLarge { .. } => Some(StatusLine::HeaderTooLarge),
            RelayError::UpstreamUnreachable { source, .. }
                if source.kind() == io::ErrorKind::TimedOut =>
            {
                Some(StatusLine::GatewayTimeout)
            }
            RelayError::UpstreamUnreachable { .. } => Some(StatusLine::BadGateway),
            _ => None,
        }
    }

    /// Whether this error happened before the tunnel was established.
    pub fn is_handshake_failure(&self) -> bool {
        !matches!(
            self,
            RelayError::RelayTransport(_) | RelayError::IdleTimeout(_) | RelayError::Cancelled
        )
    }
}
