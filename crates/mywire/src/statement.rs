//! SQL scanning, statement preparation, and parameter binding.
//!
//! The tokenizer walks SQL character by character, honoring the three
//! quoting styles (backtick and single-quote always, double-quote unless
//! ansi-quotes makes it an identifier quote, brackets in sql-server mode)
//! and both comment styles, with backslash-escape handling driven by the
//! server's SQL mode. Everything above it — placeholder discovery, the
//! prepare-time rewrite, and INSERT batching — leans on that scan instead of
//! guessing at string boundaries.

#![allow(clippy::cast_possible_truncation)]

use mywire_core::error::{UsageErrorKind, usage_error};
use mywire_core::{Result, Value};

use crate::protocol::codec::ByteWriter;
use crate::protocol::Command;
use crate::types::{Column, encode_binary, wire_type_of};

/// Character-level SQL scanner.
pub struct Tokenizer<'a> {
    sql: &'a [u8],
    pos: usize,
    start: usize,
    stop: usize,
    quoted: bool,
    is_comment: bool,
    /// Double quotes delimit identifiers instead of strings
    pub ansi_quotes: bool,
    /// Backslash escapes inside quoted regions
    pub backslash_escapes: bool,
    /// Bracket-quoted identifiers
    pub sql_server_mode: bool,
    /// Surface comments as tokens instead of skipping them
    pub return_comments: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql: sql.as_bytes(),
            pos: 0,
            start: 0,
            stop: 0,
            quoted: false,
            is_comment: false,
            ansi_quotes: false,
            backslash_escapes: true,
            sql_server_mode: false,
            return_comments: false,
        }
    }

    /// Byte range of the last token found.
    pub fn span(&self) -> (usize, usize) {
        (self.start, self.stop)
    }

    /// Whether the last token was a quoted region.
    pub fn was_quoted(&self) -> bool {
        self.quoted
    }

    /// Whether the last token was a comment (only with `return_comments`).
    pub fn was_comment(&self) -> bool {
        self.is_comment
    }

    /// Next token as a string slice.
    pub fn next_token(&mut self) -> Option<&'a str> {
        if self.find_token() {
            Some(self.token_text())
        } else {
            None
        }
    }

    /// Next placeholder token (`?...` or `@name`, excluding `@@` system
    /// variables).
    pub fn next_parameter(&mut self) -> Option<&'a str> {
        while self.find_token() {
            if self.quoted || self.is_comment {
                continue;
            }
            let tok = self.token_text().as_bytes();
            match tok.first() {
                Some(b'?') => return Some(self.token_text()),
                Some(b'@') if tok.len() > 1 && tok[1] != b'@' => return Some(self.token_text()),
                _ => {}
            }
        }
        None
    }

    fn token_text(&self) -> &'a str {
        std::str::from_utf8(&self.sql[self.start..self.stop]).unwrap_or("")
    }

    /// Advance to the next token; returns false at end of input.
    pub fn find_token(&mut self) -> bool {
        self.quoted = false;
        self.is_comment = false;
        while self.pos < self.sql.len() {
            let c = self.sql[self.pos];
            self.pos += 1;
            if c.is_ascii_whitespace() {
                continue;
            }
            self.start = usize::MAX;
            match c {
                b'`' | b'\'' | b'"' => self.read_quoted(c),
                b'[' if self.sql_server_mode => self.read_quoted(b'['),
                b'#' | b'-' | b'/' => {
                    if !self.read_comment(c) {
                        self.read_special();
                    }
                }
                _ => self.read_unquoted(),
            }
            if self.start != usize::MAX {
                return true;
            }
        }
        false
    }

    fn read_quoted(&mut self, open: u8) {
        let close = if open == b'[' { b']' } else { open };
        self.start = self.pos - 1;
        let mut escaped = false;
        let mut terminated = false;
        while self.pos < self.sql.len() {
            let c = self.sql[self.pos];
            if c == close && !escaped {
                terminated = true;
                break;
            }
            if escaped {
                escaped = false;
            } else if c == b'\\' && self.backslash_escapes {
                escaped = true;
            }
            self.pos += 1;
        }
        if terminated {
            self.pos += 1;
        }
        self.quoted = terminated;
        self.stop = self.pos;
    }

    /// Consume a comment if one starts here. `--` needs the trailing space
    /// to count, matching the server's parser.
    fn read_comment(&mut self, c: u8) -> bool {
        let block = c == b'/' && self.sql.get(self.pos) == Some(&b'*');
        let line = c == b'#'
            || (c == b'-'
                && self.sql.get(self.pos) == Some(&b'-')
                && self.sql.get(self.pos + 1) == Some(&b' '));
        if !block && !line {
            return false;
        }

        let comment_start = self.pos - 1;
        let end = if block {
            self.sql[self.pos..]
                .windows(2)
                .position(|w| w == b"*/")
                .map_or(self.sql.len(), |i| self.pos + i + 2)
        } else {
            self.sql[self.pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(self.sql.len(), |i| self.pos + i + 1)
        };
        self.pos = end;
        if self.return_comments {
            self.start = comment_start;
            self.stop = end;
            self.is_comment = true;
        }
        true
    }

    fn read_special(&mut self) {
        self.start = self.pos - 1;
        self.stop = self.pos;
    }

    fn read_unquoted(&mut self) {
        self.start = self.pos - 1;
        if !Self::is_special(self.sql[self.start]) {
            while self.pos < self.sql.len() {
                let c = self.sql[self.pos];
                if c.is_ascii_whitespace() || Self::is_special(c) {
                    break;
                }
                self.pos += 1;
            }
        }
        self.stop = self.pos;
    }

    /// Token-breaking characters. Parameter markers, identifier characters,
    /// and non-ASCII bytes (multibyte identifiers) all continue a token.
    fn is_special(c: u8) -> bool {
        if c.is_ascii_alphanumeric() || c >= 0x80 {
            return false;
        }
        !matches!(c, b'$' | b'_' | b'.' | b'@' | b'?')
    }
}

/// Rewrite a statement for server-side preparation: every placeholder
/// becomes the positional `?` marker, and the ordered list of original
/// parameter names is returned for binding.
pub fn rewrite_for_prepare(
    sql: &str,
    ansi_quotes: bool,
    backslash_escapes: bool,
) -> (String, Vec<String>) {
    let mut tokenizer = Tokenizer::new(sql);
    tokenizer.ansi_quotes = ansi_quotes;
    tokenizer.backslash_escapes = backslash_escapes;

    let mut rewritten = String::with_capacity(sql.len());
    let mut names = Vec::new();
    let mut copied_to = 0;
    while let Some(param) = tokenizer.next_parameter() {
        let (start, stop) = tokenizer.span();
        rewritten.push_str(&sql[copied_to..start]);
        rewritten.push('?');
        names.push(param.to_string());
        copied_to = stop;
    }
    rewritten.push_str(&sql[copied_to..]);
    (rewritten, names)
}

/// A server-side prepared statement.
///
/// Owns the statement id the server allocated; `Session::close_statement`
/// must be called to free the server-side resources.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub statement_id: u32,
    /// Rewritten SQL as sent to the server
    pub sql: String,
    /// Original placeholder names in bind order
    pub param_names: Vec<String>,
    /// Parameter metadata from the prepare response
    pub params: Vec<Column>,
    /// Result column metadata from the prepare response
    pub columns: Vec<Column>,
    /// Set after the first execute; later executes skip the type block
    pub types_sent: bool,
    pub closed: bool,
}

impl PreparedStatement {
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(usage_error(
                UsageErrorKind::StatementState,
                format!("statement {} is closed", self.statement_id),
            ));
        }
        Ok(())
    }
}

/// The prepare-OK header: statement id plus parameter/column counts.
#[derive(Debug, Clone, Copy)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

/// Parse the COM_STMT_PREPARE OK payload.
pub fn parse_prepare_ok(payload: &[u8]) -> Option<PrepareOk> {
    if payload.len() < 12 || payload[0] != 0x00 {
        return None;
    }
    Some(PrepareOk {
        statement_id: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
        num_columns: u16::from_le_bytes([payload[5], payload[6]]),
        num_params: u16::from_le_bytes([payload[7], payload[8]]),
        warnings: u16::from_le_bytes([payload[10], payload[11]]),
    })
}

/// Build a COM_STMT_PREPARE payload.
pub fn build_prepare(sql: &str) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(1 + sql.len());
    w.put_u8(Command::StmtPrepare as u8);
    w.put_bytes(sql.as_bytes());
    w.into_vec()
}

/// Build a COM_STMT_EXECUTE payload.
///
/// The null bitmap marks null or absent values; the first execution after
/// prepare carries the declared wire type pair for every parameter
/// (`send_types`), later ones set the new-params-bound flag to zero.
pub fn build_execute(statement_id: u32, params: &[Value], send_types: bool) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(32 + params.len() * 12);
    w.put_u8(Command::StmtExecute as u8);
    w.put_u32_le(statement_id);
    w.put_u8(0x00); // no cursor
    w.put_u32_le(1); // iteration count, always 1

    if !params.is_empty() {
        let mut bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, p) in params.iter().enumerate() {
            if p.is_null() {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        w.put_bytes(&bitmap);

        w.put_u8(u8::from(send_types));
        if send_types {
            for p in params {
                let (wire_type, flag) = wire_type_of(p);
                w.put_u8(wire_type);
                w.put_u8(flag);
            }
        }
        for p in params {
            encode_binary(&mut w, p);
        }
    }
    w.into_vec()
}

/// Build a COM_STMT_CLOSE payload (the server sends no reply).
pub fn build_close(statement_id: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(5);
    w.put_u8(Command::StmtClose as u8);
    w.put_u32_le(statement_id);
    w.into_vec()
}

/// Build a COM_STMT_RESET payload.
pub fn build_reset(statement_id: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(5);
    w.put_u8(Command::StmtReset as u8);
    w.put_u32_le(statement_id);
    w.into_vec()
}

/// Build a COM_STMT_FETCH payload for cursor reads.
pub fn build_fetch(statement_id: u32, rows: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(9);
    w.put_u8(Command::StmtFetch as u8);
    w.put_u32_le(statement_id);
    w.put_u32_le(rows);
    w.into_vec()
}

/// Coalesces consecutive INSERT statements that share their text up to the
/// VALUES clause into one multi-row statement, flushing before the payload
/// would cross the server's maximum packet size.
#[derive(Debug)]
pub struct InsertBatcher {
    max_payload: usize,
    prefix: String,
    accumulated: String,
}

impl InsertBatcher {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            prefix: String::new(),
            accumulated: String::new(),
        }
    }

    /// Whether anything is buffered.
    pub fn is_empty(&self) -> bool {
        self.accumulated.is_empty()
    }

    /// Try to add a statement to the batch. Returns false when the statement
    /// cannot join the current batch (different prefix, not an INSERT, or
    /// size bound hit) — the caller must `take()` and retry.
    pub fn push(&mut self, sql: &str) -> bool {
        let Some((prefix, rows)) = split_on_values(sql) else {
            return false;
        };
        if self.accumulated.is_empty() {
            self.prefix = prefix.to_string();
            self.accumulated = sql.to_string();
            return true;
        }
        if prefix != self.prefix {
            return false;
        }
        // +1 for the joining comma.
        if self.accumulated.len() + rows.len() + 1 > self.max_payload {
            return false;
        }
        self.accumulated.push(',');
        self.accumulated.push_str(rows);
        true
    }

    /// Take the accumulated statement, leaving the batcher empty.
    pub fn take(&mut self) -> Option<String> {
        if self.accumulated.is_empty() {
            return None;
        }
        self.prefix.clear();
        Some(std::mem::take(&mut self.accumulated))
    }
}

/// Split an INSERT at its top-level VALUES keyword: the byte-identical
/// prefix (through VALUES) and the row tuple text after it.
fn split_on_values(sql: &str) -> Option<(&str, &str)> {
    let mut tokenizer = Tokenizer::new(sql);
    let first = tokenizer.next_token()?;
    if !first.eq_ignore_ascii_case("insert") {
        return None;
    }
    while let Some(tok) = tokenizer.next_token() {
        if !tokenizer.was_quoted() && tok.eq_ignore_ascii_case("values") {
            let (_, stop) = tokenizer.span();
            let rows = sql[stop..].trim();
            if rows.is_empty() {
                return None;
            }
            return Some((&sql[..stop], rows));
        }
    }
    None
}
