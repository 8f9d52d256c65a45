pub mod error;
pub mod tunnel;

pub use error::RelayError;
pub use tunnel::{
    Connector, Listener, ListenerConfig, ListenerStats, PendingHead, StatusLine, Target,
    TcpConnector,
};
