//! Core types for the mywire MySQL client.
//!
//! This crate holds the vocabulary shared between the driver and the pool:
//!
//! - The error taxonomy (`Error` and its structured payloads)
//! - Dynamically-typed wire values (`Value`)
//! - Buffered result rows (`Row`, `ColumnInfo`)
//! - Ambient-transaction tokens for pool pinning

pub mod error;
pub mod row;
pub mod transaction;
pub mod value;

pub use error::{
    ConfigError, Error, PoolError, PoolErrorKind, ProtocolError, Result, ServerError,
    TimeoutError, TimeoutKind, TransportError, TransportErrorKind, UsageError, UsageErrorKind,
};
pub use row::{ColumnInfo, Row};
pub use transaction::{AmbientTransaction, TransactionOutcome};
pub use value::Value;
