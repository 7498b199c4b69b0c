//! MySQL wire-protocol client.
//!
//! This crate implements the client side of the MySQL protocol from the
//! byte stream up:
//!
//! - Packet framing with sequence numbers, message splitting/reassembly,
//!   per-command deadlines, and the optional compressed envelope
//! - Every authentication generation from the pre-4.1 scramble through
//!   caching_sha2_password (with RSA full auth)
//! - The session state machine: handshake, capability negotiation, in-place
//!   TLS upgrade, command dispatch, multi-result draining, LOAD DATA LOCAL
//!   streaming, and out-of-band query cancellation
//! - Typed result decoding for both the text and binary row encodings, with
//!   buffered and sequential cursors
//! - SQL tokenizing, named-placeholder rewriting, binary parameter binding,
//!   and INSERT batching
//!
//! Pooling lives in the `mywire-pool` crate; shared vocabulary types
//! (errors, values, rows) in `mywire-core`.
//!
//! # Example
//!
//! ```rust,ignore
//! use mywire::{ConnectionSettings, Session};
//!
//! let settings = ConnectionSettings::new()
//!     .host("127.0.0.1")
//!     .user("app")
//!     .password("secret")
//!     .database("shop");
//!
//! let mut session = Session::open(settings)?;
//! let mut cursor = session.execute("SELECT id, name FROM users")?;
//! while let Some(row) = cursor.next_row()? {
//!     println!("{:?}", row.get_by_name("name"));
//! }
//! ```

pub mod auth;
pub mod buffer;
pub mod protocol;
pub mod result;
pub mod session;
pub mod settings;
pub mod statement;
pub mod tls;
pub mod transport;
pub mod types;

pub use mywire_core::{Error, Result, Row, Value};

pub use result::{AccessMode, ResultCursor};
pub use session::{ServerGreeting, Session, SessionState};
pub use settings::{ConnectionSettings, SslMode};
pub use statement::{InsertBatcher, PreparedStatement, Tokenizer};
pub use types::{Column, FieldType};
