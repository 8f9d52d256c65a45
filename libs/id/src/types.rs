//! Typed ID definitions for relay resources.

use crate::define_id;

define_id!(
    /// Identifies one accepted client connection for its whole lifetime.
    ConnectionId,
    "conn"
);

define_id!(
    /// Identifies one bound listener.
    ListenerId,
    "lsn"
);
