//! Error types for mywire operations.
//!
//! The taxonomy follows the failure model of the wire protocol: transport and
//! protocol errors are connection-terminal, server errors usually are not,
//! and usage errors indicate a bug in the calling code.

use std::fmt;

/// The primary error type for all mywire operations.
#[derive(Debug)]
pub enum Error {
    /// I/O failure on the underlying stream. Always connection-terminal.
    Transport(TransportError),
    /// A command or acquire deadline elapsed.
    Timeout(TimeoutError),
    /// Malformed or unexpected frame. Fatal for the session.
    Protocol(ProtocolError),
    /// Structured error reported by the server (ERR packet).
    Server(ServerError),
    /// Connection pool errors (exhaustion, draining, pinning conflicts).
    Pool(PoolError),
    /// Caller misuse: closed cursors, out-of-order sequential reads, etc.
    Usage(UsageError),
    /// Invalid connection settings.
    Config(ConfigError),
}

#[derive(Debug)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Failed to establish the TCP connection
    Connect,
    /// Connection refused by the endpoint
    Refused,
    /// Connection lost mid-operation
    Disconnected,
    /// TLS negotiation or record-layer failure
    Tls,
    /// Compressed-frame inflate/deflate failure
    Compression,
}

#[derive(Debug)]
pub struct TimeoutError {
    pub kind: TimeoutKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Per-command deadline expired mid-exchange
    Command,
    /// Connection establishment (acquire + handshake) deadline expired
    Connect,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// An error reported by the server in an ERR packet.
///
/// The 5-character SQLSTATE prefix, when present on the wire, is stripped
/// from the message and stored separately.
#[derive(Debug, Clone)]
pub struct ServerError {
    /// MySQL error code (e.g. 1062 for ER_DUP_ENTRY)
    pub code: u16,
    /// SQLSTATE, when the server sent the '#'-marked prefix
    pub sqlstate: Option<String>,
    pub message: String,
}

/// Server error codes that leave the connection unusable.
///
/// These are the net-layer and shutdown codes; anything else is returned to
/// the caller without tearing down the session.
const FATAL_SERVER_CODES: &[u16] = &[
    1053, // ER_SERVER_SHUTDOWN
    1152, // ER_ABORTING_CONNECTION
    1153, // ER_NET_PACKET_TOO_LARGE
    1154, // ER_NET_READ_ERROR_FROM_PIPE
    1155, // ER_NET_FCNTL_ERROR
    1156, // ER_NET_PACKETS_OUT_OF_ORDER
    1157, // ER_NET_UNCOMPRESS_ERROR
    1158, // ER_NET_READ_ERROR
    1159, // ER_NET_READ_INTERRUPTED
    1160, // ER_NET_ERROR_ON_WRITE
    1161, // ER_NET_WRITE_INTERRUPTED
];

impl ServerError {
    /// Whether this error code leaves the session unusable.
    pub fn is_fatal(&self) -> bool {
        FATAL_SERVER_CODES.contains(&self.code)
    }

    /// Check if this is a unique constraint violation (ER_DUP_ENTRY).
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    /// Check if this is a foreign key constraint violation.
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code == 1451 || self.code == 1452
    }
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Acquire timed out waiting for admission
    Exhausted,
    /// Pool is draining and no longer hands out sessions
    Draining,
    /// The session pinned to this transaction is already in use
    EnlistedBusy,
    /// The pool manager has been shut down
    Closed,
}

#[derive(Debug)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// Operation on a closed session
    SessionClosed,
    /// Cursor advanced past the end or read while closed
    CursorClosed,
    /// Sequential-mode column read at a lower index than already consumed
    OutOfOrderColumn,
    /// Statement already closed or prepared twice
    StatementState,
    /// Parameter count or name mismatch against the prepared statement
    ParameterMismatch,
    /// Ambient transaction token misused (double completion, re-enlist)
    Transaction,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Whether the session must be discarded after this error.
    ///
    /// Transport and protocol failures are always terminal; server errors
    /// only for the small fatal code set; timeouts are terminal at the
    /// session layer when they strike mid-frame (the session tracks that).
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Protocol(_) => true,
            Error::Server(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Pool(PoolError {
                    kind: PoolErrorKind::Exhausted,
                    ..
                })
        )
    }

    /// The server error code, when this came from an ERR packet.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            _ => None,
        }
    }

    /// SQLSTATE if the server provided one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(e) => e.sqlstate.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "Transport error: {}", e.message),
            Error::Timeout(e) => write!(f, "Timeout: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Server(e) => {
                if let Some(state) = &e.sqlstate {
                    write!(f, "Server error {} (SQLSTATE {}): {}", e.code, state, e.message)
                } else {
                    write!(f, "Server error {}: {}", e.code, e.message)
                }
            }
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Usage(e) => write!(f, "Usage error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl From<TimeoutError> for Error {
    fn from(err: TimeoutError) -> Self {
        Error::Timeout(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        // A WouldBlock/TimedOut on the socket is the timed stream's deadline
        // firing; everything else kills the connection.
        if matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ) {
            Error::Timeout(TimeoutError {
                kind: TimeoutKind::Command,
                message: format!("I/O deadline exceeded: {}", err),
            })
        } else {
            Error::Transport(TransportError {
                kind: TransportErrorKind::Disconnected,
                message: format!("I/O error: {}", err),
                source: Some(Box::new(err)),
            })
        }
    }
}

/// Build a transport error with the given kind.
pub fn transport_error(kind: TransportErrorKind, msg: impl Into<String>) -> Error {
    Error::Transport(TransportError {
        kind,
        message: msg.into(),
        source: None,
    })
}

/// Build a protocol error.
pub fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        source: None,
    })
}

/// Build a command-timeout error.
pub fn timeout_error(kind: TimeoutKind, msg: impl Into<String>) -> Error {
    Error::Timeout(TimeoutError {
        kind,
        message: msg.into(),
    })
}

/// Build a usage error.
pub fn usage_error(kind: UsageErrorKind, msg: impl Into<String>) -> Error {
    Error::Usage(UsageError {
        kind,
        message: msg.into(),
    })
}

/// Build a pool error.
pub fn pool_error(kind: PoolErrorKind, msg: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: msg.into(),
    })
}

/// Build a configuration error.
pub fn config_error(msg: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: msg.into(),
        source: None,
    })
}

/// Result type alias for mywire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(transport_error(TransportErrorKind::Disconnected, "gone").is_fatal());
        assert!(protocol_error("bad frame").is_fatal());

        let benign = Error::Server(ServerError {
            code: 1062,
            sqlstate: Some("23000".to_string()),
            message: "Duplicate entry".to_string(),
        });
        assert!(!benign.is_fatal());
        assert!(benign.sqlstate() == Some("23000"));
        assert_eq!(benign.server_code(), Some(1062));

        let fatal = Error::Server(ServerError {
            code: 1156,
            sqlstate: None,
            message: "Got packets out of order".to_string(),
        });
        assert!(fatal.is_fatal());
    }

    #[test]
    fn retryable_classification() {
        assert!(pool_error(PoolErrorKind::Exhausted, "no slots").is_retryable());
        assert!(timeout_error(TimeoutKind::Command, "slow query").is_retryable());
        assert!(!pool_error(PoolErrorKind::Draining, "draining").is_retryable());
        assert!(!usage_error(UsageErrorKind::CursorClosed, "closed").is_retryable());
    }

    #[test]
    fn io_timeout_mapping() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        assert!(matches!(Error::from(timed_out), Error::Timeout(_)));

        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(Error::from(broken), Error::Transport(_)));
    }

    #[test]
    fn server_error_helpers() {
        let dup = ServerError {
            code: 1062,
            sqlstate: Some("23000".to_string()),
            message: "Duplicate entry".to_string(),
        };
        assert!(dup.is_duplicate_key());
        assert!(!dup.is_foreign_key_violation());

        let fk = ServerError {
            code: 1452,
            sqlstate: Some("23000".to_string()),
            message: "Cannot add or update a child row".to_string(),
        };
        assert!(fk.is_foreign_key_violation());
    }
}
