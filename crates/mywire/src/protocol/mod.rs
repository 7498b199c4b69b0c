//! Wire protocol vocabulary: capability flags, command opcodes, status bits,
//! and the OK/ERR/EOF response packets.
//!
//! Framing (the 4-byte length + sequence header, payload splitting, and the
//! compressed envelope) lives in [`crate::transport`]; this module only deals
//! with payload contents.

pub mod codec;

pub use codec::{ByteReader, ByteWriter};

use mywire_core::error::protocol_error;
use mywire_core::{Result, ServerError};

/// Maximum payload carried by one frame (2^24 - 1). Logical messages above
/// this are split across frames sharing the sequence counter.
pub const MAX_BLOCK_SIZE: usize = 0xFF_FFFF;

/// Client/server capability flags.
#[allow(dead_code)]
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 1 << 1;
    pub const LONG_FLAG: u32 = 1 << 2;
    pub const CONNECT_WITH_DB: u32 = 1 << 3;
    pub const NO_SCHEMA: u32 = 1 << 4;
    pub const COMPRESS: u32 = 1 << 5;
    pub const ODBC: u32 = 1 << 6;
    pub const LOCAL_FILES: u32 = 1 << 7;
    pub const IGNORE_SPACE: u32 = 1 << 8;
    pub const PROTOCOL_41: u32 = 1 << 9;
    pub const INTERACTIVE: u32 = 1 << 10;
    pub const SSL: u32 = 1 << 11;
    pub const IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const TRANSACTIONS: u32 = 1 << 13;
    pub const RESERVED: u32 = 1 << 14;
    pub const SECURE_CONNECTION: u32 = 1 << 15;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const CONNECT_ATTRS: u32 = 1 << 20;
    pub const PLUGIN_AUTH_LENENC_DATA: u32 = 1 << 21;
}

/// Command opcodes (COM_xxx). Every client command starts with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    /// Close the connection
    Quit = 0x01,
    /// Switch default database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    /// Kill a server thread by id
    ProcessKill = 0x0c,
    Debug = 0x0d,
    /// Liveness probe
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    /// Re-authenticate, resetting session state
    ChangeUser = 0x11,
    /// Prepare a statement, returning a server-side id
    StmtPrepare = 0x16,
    /// Execute a prepared statement with bound parameters
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    /// Free a server-side prepared statement
    StmtClose = 0x19,
    /// Reset accumulated long data for a statement
    StmtReset = 0x1a,
    SetOption = 0x1b,
    /// Fetch rows from a server-side cursor
    StmtFetch = 0x1c,
    /// Reset session state without re-authenticating
    ResetConnection = 0x1f,
}

/// Server status flags carried in OK/EOF packets.
#[allow(dead_code)]
pub mod server_status {
    pub const IN_TRANSACTION: u16 = 0x0001;
    pub const AUTOCOMMIT: u16 = 0x0002;
    pub const MORE_RESULTS: u16 = 0x0008;
    pub const NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const NO_INDEX_USED: u16 = 0x0020;
    pub const CURSOR_EXISTS: u16 = 0x0040;
    pub const LAST_ROW_SENT: u16 = 0x0080;
    pub const DB_DROPPED: u16 = 0x0100;
    pub const NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const METADATA_CHANGED: u16 = 0x0400;
    pub const QUERY_WAS_SLOW: u16 = 0x0800;
    pub const OUT_PARAMS: u16 = 0x1000;
    pub const IN_TRANSACTION_READONLY: u16 = 0x2000;
    pub const SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Character set ids that matter to the driver.
#[allow(dead_code)]
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    /// The sentinel marking truly binary columns (no text charset).
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;

    pub const DEFAULT: u8 = UTF8_GENERAL_CI;
}

/// First-byte classification of a response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// 0x00: OK packet
    Ok,
    /// 0xFF: ERR packet
    Err,
    /// 0xFE with a short payload: EOF marker
    Eof,
    /// 0xFB: server requests a local file's contents
    LocalInfile,
    /// Anything else: result-set header or data row
    Data,
}

impl ResponseKind {
    /// Classify a payload by its first byte and length.
    pub fn classify(payload: &[u8]) -> Self {
        match payload.first() {
            Some(0x00) => ResponseKind::Ok,
            Some(0xFF) => ResponseKind::Err,
            // EOF packets are at most 5 bytes; 0xFE also begins 8-byte
            // lenenc integers, which only occur in longer payloads.
            Some(0xFE) if payload.len() < 9 => ResponseKind::Eof,
            Some(0xFB) => ResponseKind::LocalInfile,
            _ => ResponseKind::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

/// Parse an OK payload (leading 0x00 included).
pub fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    let mut r = ByteReader::new(payload);
    let marker = r.take_u8().ok_or_else(|| protocol_error("empty OK packet"))?;
    if marker != 0x00 && marker != 0xFE {
        return Err(protocol_error(format!(
            "expected OK marker, got 0x{marker:02X}"
        )));
    }
    let affected_rows = r
        .take_lenenc()
        .ok_or_else(|| protocol_error("OK packet missing affected rows"))?;
    let last_insert_id = r
        .take_lenenc()
        .ok_or_else(|| protocol_error("OK packet missing insert id"))?;
    let status_flags = r.take_u16_le().unwrap_or(0);
    let warnings = r.take_u16_le().unwrap_or(0);
    let info = if r.remaining() > 0 {
        r.take_rest_lossy()
    } else {
        String::new()
    };
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        info,
    })
}

/// Parse an ERR payload (leading 0xFF included) into a structured server
/// error. A message beginning with the '#'-marked 5-character SQLSTATE has
/// the prefix stripped into its own field.
pub fn parse_err(payload: &[u8]) -> Result<ServerError> {
    let mut r = ByteReader::new(payload);
    let marker = r.take_u8().ok_or_else(|| protocol_error("empty ERR packet"))?;
    if marker != 0xFF {
        return Err(protocol_error(format!(
            "expected ERR marker, got 0x{marker:02X}"
        )));
    }
    let code = r
        .take_u16_le()
        .ok_or_else(|| protocol_error("ERR packet missing error code"))?;
    let sqlstate = if r.peek() == Some(b'#') {
        r.advance(1);
        r.take_str(5)
    } else {
        None
    };
    let message = r.take_rest_lossy();
    Ok(ServerError {
        code,
        sqlstate,
        message,
    })
}

/// Parsed EOF marker (warnings + status).
#[derive(Debug, Clone, Copy, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

/// Parse an EOF payload (leading 0xFE included).
pub fn parse_eof(payload: &[u8]) -> Result<EofPacket> {
    let mut r = ByteReader::new(payload);
    let marker = r.take_u8().ok_or_else(|| protocol_error("empty EOF packet"))?;
    if marker != 0xFE {
        return Err(protocol_error(format!(
            "expected EOF marker, got 0x{marker:02X}"
        )));
    }
    // Pre-4.1 servers send a bare 0xFE.
    let warnings = r.take_u16_le().unwrap_or(0);
    let status_flags = r.take_u16_le().unwrap_or(0);
    Ok(EofPacket {
        warnings,
        status_flags,
    })
}
