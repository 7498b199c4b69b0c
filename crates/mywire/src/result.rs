//! Result-set cursors.
//!
//! A cursor drives one response of a command: either a completed statement
//! (affected rows, insert id) or a stream of rows. Two access modes exist:
//! buffered, where each advance materializes a whole `Row`, and sequential,
//! where columns are read forward-only and at most once from the wire —
//! skipped columns are consumed and discarded without materializing.

use std::sync::Arc;

use mywire_core::error::{UsageErrorKind, protocol_error, usage_error};
use mywire_core::{ColumnInfo, Result, Row, Value};

use crate::protocol::codec::ByteReader;
use crate::session::{Exchange, Session};
use crate::types::{Column, DecodePolicy, decode_binary, decode_text, skip_binary};

/// How rows are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Whole rows materialized per advance
    Buffered,
    /// Forward-only, non-decreasing column reads
    Sequential,
}

/// Cursor over one result of a command exchange.
///
/// Values read from a row are only valid until the cursor advances again;
/// dropping the cursor mid-set is safe — the session drains the remainder
/// before its next command.
pub struct ResultCursor<'a> {
    session: &'a mut Session,
    columns: Arc<Vec<Column>>,
    info: Arc<ColumnInfo>,
    binary: bool,
    mode: AccessMode,
    rows_done: bool,
    /// Current raw row payload (sequential mode)
    row: Option<Vec<u8>>,
    /// Byte offset of the first unconsumed value in `row`
    offset: usize,
    /// First column index not yet consumed from the wire
    next_unread: usize,
    /// Most recently decoded column, re-readable without touching the wire
    last_read: Option<(usize, Value)>,
    /// Null bitmap of the current binary row
    null_bitmap: Vec<u8>,
}

impl<'a> ResultCursor<'a> {
    pub(crate) fn new(session: &'a mut Session, exchange: Exchange, binary: bool) -> Self {
        let (columns, rows_done) = match exchange {
            Exchange::Done(_) => (Arc::new(Vec::new()), true),
            Exchange::ResultSet(columns) => (columns, false),
        };
        let info = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        ));
        Self {
            session,
            columns,
            info,
            binary,
            mode: AccessMode::Buffered,
            rows_done,
            row: None,
            offset: 0,
            next_unread: 0,
            last_read: None,
            null_bitmap: Vec::new(),
        }
    }

    /// Switch to sequential access. Only valid before the first advance.
    pub fn into_sequential(mut self) -> Result<Self> {
        if self.row.is_some() || self.rows_done && !self.columns.is_empty() {
            return Err(usage_error(
                UsageErrorKind::CursorClosed,
                "access mode must be chosen before reading rows",
            ));
        }
        self.mode = AccessMode::Sequential;
        Ok(self)
    }

    /// Whether this result carries rows at all (vs. a plain OK).
    pub fn has_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Column metadata of the current result set.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Affected-row count of the statement that produced this result.
    pub fn affected_rows(&self) -> u64 {
        self.session.affected_rows()
    }

    /// Last insert id of the statement that produced this result.
    pub fn last_insert_id(&self) -> u64 {
        self.session.last_insert_id()
    }

    /// Warning count reported by the server.
    pub fn warnings(&self) -> u16 {
        self.session.warnings()
    }

    /// Next materialized row (buffered mode).
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if self.mode != AccessMode::Buffered {
            return Err(usage_error(
                UsageErrorKind::CursorClosed,
                "next_row requires buffered access; use advance/column",
            ));
        }
        if self.rows_done {
            return Ok(None);
        }
        let Some(payload) = self.session.fetch_row_payload()? else {
            self.rows_done = true;
            return Ok(None);
        };
        let values = if self.binary {
            parse_binary_row(&self.columns, self.session.decode_policy(), &payload)?
        } else {
            parse_text_row(&self.columns, self.session.decode_policy(), &payload)?
        };
        Ok(Some(Row::new(self.info.clone(), values)))
    }

    /// Advance to the next row (sequential mode). Returns false at the end
    /// of the set.
    pub fn advance(&mut self) -> Result<bool> {
        if self.mode != AccessMode::Sequential {
            return Err(usage_error(
                UsageErrorKind::CursorClosed,
                "advance requires sequential access; use next_row",
            ));
        }
        if self.rows_done {
            return Ok(false);
        }
        let Some(payload) = self.session.fetch_row_payload()? else {
            self.rows_done = true;
            self.row = None;
            return Ok(false);
        };
        self.offset = 0;
        self.next_unread = 0;
        self.last_read = None;
        if self.binary {
            let bitmap_len = (self.columns.len() + 7 + 2) / 8;
            if payload.len() < 1 + bitmap_len {
                return Err(protocol_error("binary row shorter than its null bitmap"));
            }
            self.null_bitmap = payload[1..1 + bitmap_len].to_vec();
            self.offset = 1 + bitmap_len;
        }
        self.row = Some(payload);
        Ok(true)
    }

    /// Read column `index` of the current row (sequential mode).
    ///
    /// Columns must be requested in non-decreasing order; the most recently
    /// read column can be re-read from cache, anything earlier is gone.
    pub fn column(&mut self, index: usize) -> Result<Value> {
        if self.mode != AccessMode::Sequential {
            return Err(usage_error(
                UsageErrorKind::CursorClosed,
                "column requires sequential access; use next_row",
            ));
        }
        if index >= self.columns.len() {
            return Err(usage_error(
                UsageErrorKind::ParameterMismatch,
                format!(
                    "column index {} out of range ({} columns)",
                    index,
                    self.columns.len()
                ),
            ));
        }
        if self.row.is_none() {
            return Err(usage_error(
                UsageErrorKind::CursorClosed,
                "no current row; call advance first",
            ));
        }

        if let Some((last, value)) = &self.last_read {
            if index == *last {
                return Ok(value.clone());
            }
        }
        if index < self.next_unread {
            return Err(usage_error(
                UsageErrorKind::OutOfOrderColumn,
                format!(
                    "sequential access already passed column {index} (next readable is {})",
                    self.next_unread
                ),
            ));
        }

        // Skip and discard everything between here and the wanted column.
        let row = self.row.take().expect("checked above");
        let outcome = self.read_forward(&row, index);
        self.row = Some(row);
        let value = outcome?;
        self.last_read = Some((index, value.clone()));
        Ok(value)
    }

    fn read_forward(&mut self, row: &[u8], index: usize) -> Result<Value> {
        let policy = self.session.decode_policy();
        let mut r = ByteReader::new(&row[self.offset..]);
        while self.next_unread < index {
            let column = &self.columns[self.next_unread];
            if self.binary {
                if !self.binary_null(self.next_unread) {
                    skip_binary(column, &mut r)?;
                }
            } else {
                r.take_lenenc_field()
                    .ok_or_else(|| protocol_error("text row truncated"))?;
            }
            self.next_unread += 1;
        }

        let column = &self.columns[index];
        let value = if self.binary {
            if self.binary_null(index) {
                Value::Null
            } else {
                decode_binary(column, policy, &mut r)?
            }
        } else {
            match r
                .take_lenenc_field()
                .ok_or_else(|| protocol_error("text row truncated"))?
            {
                None => Value::Null,
                Some(bytes) => decode_text(column, policy, bytes),
            }
        };
        self.next_unread = index + 1;
        self.offset += r.position();
        Ok(value)
    }

    fn binary_null(&self, index: usize) -> bool {
        let bit = index + 2;
        self.null_bitmap
            .get(bit / 8)
            .is_some_and(|b| b & (1 << (bit % 8)) != 0)
    }

    /// Move to the next chained result set, if any. Unread rows of the
    /// current set are consumed and discarded first.
    pub fn next_result(self) -> Result<Option<ResultCursor<'a>>> {
        let binary = self.binary;
        let session = self.session;
        match session.advance_result()? {
            None => Ok(None),
            Some(exchange) => Ok(Some(ResultCursor::new(session, exchange, binary))),
        }
    }

    /// Consume everything left of this response, re-aligning the session.
    pub fn finish(self) -> Result<()> {
        self.session.drain_results()
    }
}

impl std::fmt::Debug for ResultCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCursor")
            .field("columns", &self.columns.len())
            .field("binary", &self.binary)
            .field("mode", &self.mode)
            .field("rows_done", &self.rows_done)
            .finish()
    }
}

/// Parse a whole text-protocol row.
pub(crate) fn parse_text_row(
    columns: &[Column],
    policy: &DecodePolicy,
    payload: &[u8],
) -> Result<Vec<Value>> {
    let mut r = ByteReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        match r
            .take_lenenc_field()
            .ok_or_else(|| protocol_error(format!("text row truncated at column '{}'", column.name)))?
        {
            None => values.push(Value::Null),
            Some(bytes) => values.push(decode_text(column, policy, bytes)),
        }
    }
    Ok(values)
}

/// Parse a whole binary-protocol row: 0x00 header, null bitmap offset by two
/// reserved bits, then per-type encodings.
pub(crate) fn parse_binary_row(
    columns: &[Column],
    policy: &DecodePolicy,
    payload: &[u8],
) -> Result<Vec<Value>> {
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    if payload.len() < 1 + bitmap_len {
        return Err(protocol_error("binary row shorter than its null bitmap"));
    }
    let bitmap = &payload[1..1 + bitmap_len];
    let mut r = ByteReader::new(&payload[1 + bitmap_len..]);

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(decode_binary(column, policy, &mut r)?);
        }
    }
    Ok(values)
}
