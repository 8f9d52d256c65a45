//! Macro for defining typed ID types.

/// Defines a ULID-backed ID newtype rendered as `{prefix}_{ulid}`.
///
/// ```ignore
/// define_id!(ConnectionId, "conn");
///
/// let id = ConnectionId::new();
/// tracing::info!(conn_id = %id, "accepted");
/// ```
#[macro_export]
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new ID with a fresh ULID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Wall-clock time encoded in the ULID.
            #[must_use]
            pub fn created_at(&self) -> std::time::SystemTime {
                self.0.datetime()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }
    };
}
