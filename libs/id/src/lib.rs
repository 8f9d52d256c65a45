//! # burrow-id
//!
//! Typed identifiers for the burrow CONNECT relay.
//!
//! Every accepted connection and every bound listener gets an ID that shows up
//! in log spans, so a single tunnel can be followed from accept to close.
//!
//! ## ID Format
//!
//! IDs render as `{prefix}_{ulid}`:
//! - `conn_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `lsn_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! ULIDs are time-ordered, so connection IDs sort by accept time.

mod macros;
mod types;

pub use types::*;

/// Re-exported for [`define_id!`] expansions in other crates.
pub use ulid::Ulid;
