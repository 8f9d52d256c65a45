//! HTTP CONNECT tunnel implementation.
//!
//! This module provides:
//! - CONNECT request-line parsing into a [`Target`]
//! - Upstream connection through a pluggable [`Connector`]
//! - Handshake negotiation with status responses
//! - Forwarding of bytes pipelined behind the request head
//! - Bidirectional relaying with half-close, idle and drain bounds
//! - Per-connection supervision and the accept loop
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Supervisor -> Negotiator -> Connector -> Upstream
//!                           |              |
//!                           |         PendingHead -----------> Upstream
//!                           |
//!                           +-------> Relay <================> Upstream
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use burrow_relay::tunnel::{Listener, ListenerConfig, TcpConnector};
//!
//! let config = ListenerConfig::new("127.0.0.1:8080".parse()?);
//! let listener = Arc::new(Listener::bind(config, TcpConnector::new()).await?);
//! listener.run_until(shutdown_signal()).await?;
//! ```

mod handshake;
mod head;
mod listener;
mod relay;
mod supervisor;
mod target;
mod upstream;

pub use handshake::{
    negotiate, read_request_head, write_status, Established, HandshakeOptions, HandshakeState,
    StatusLine, DEFAULT_MAX_HEAD_BYTES,
};
pub use head::PendingHead;
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
pub use relay::{
    relay, RelayOptions, RelayStats, RelaySummary, DEFAULT_DRAIN_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
};
pub use supervisor::{Connection, Supervisor};
pub use target::{parse_connect_line, Target, TargetError};
pub use upstream::{connect_upstream, Connector, TcpConnector, DEFAULT_CONNECT_TIMEOUT};
