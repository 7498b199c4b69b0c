//! Column metadata and typed value decoding.
//!
//! A `(wire type, flags, charset)` triple resolves to one decoding strategy:
//! the UNSIGNED flag promotes integer types to the unsigned `Value`
//! variants, blob types whose charset is not the binary sentinel decode as
//! text, a name-pattern policy can override blob/text either way, and
//! BINARY(16) may decode as a 128-bit identifier when the guid policy is on.

#![allow(clippy::cast_possible_truncation)]

use mywire_core::error::protocol_error;
use mywire_core::{Result, Value};
use regex::Regex;

use crate::protocol::charset;
use crate::protocol::codec::{ByteReader, ByteWriter};
use crate::settings::ConnectionSettings;

/// Wire type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            // 0xFE and unknown codes decode most safely as plain strings.
            _ => FieldType::String,
        }
    }

    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
        )
    }

    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::NewDate
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
        )
    }
}

/// Column definition flags.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NUM: u16 = 32768;
}

/// Metadata of one result-set column.
#[derive(Debug, Clone)]
pub struct Column {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    /// Character-set index; 63 marks truly binary data
    pub charset: u16,
    /// Declared byte length
    pub length: u32,
    pub field_type: FieldType,
    pub flags: u16,
    /// Decimal scale
    pub decimals: u8,
}

impl Column {
    pub const fn is_nullable(&self) -> bool {
        self.flags & column_flags::NOT_NULL == 0
    }

    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    pub const fn is_blob_flagged(&self) -> bool {
        self.flags & column_flags::BLOB != 0
    }

    /// The charset sentinel, not the BINARY flag, decides whether blob bytes
    /// are opaque: a TEXT column is a blob type with a text charset.
    pub const fn has_binary_charset(&self) -> bool {
        self.charset == charset::BINARY as u16
    }
}

/// Parse one column-definition payload. `long_flag` selects the 2-byte flags
/// field negotiated via the long-flag capability.
pub fn parse_column(payload: &[u8], long_flag: bool) -> Result<Column> {
    let mut r = ByteReader::new(payload);
    let catalog = r
        .take_lenenc_str()
        .ok_or_else(|| protocol_error("column definition missing catalog"))?;
    let schema = r
        .take_lenenc_str()
        .ok_or_else(|| protocol_error("column definition missing schema"))?;
    let table = r
        .take_lenenc_str()
        .ok_or_else(|| protocol_error("column definition missing table"))?;
    let org_table = r
        .take_lenenc_str()
        .ok_or_else(|| protocol_error("column definition missing original table"))?;
    let name = r
        .take_lenenc_str()
        .ok_or_else(|| protocol_error("column definition missing name"))?;
    let org_name = r
        .take_lenenc_str()
        .ok_or_else(|| protocol_error("column definition missing original name"))?;

    // Fixed-length-fields marker (0x0C).
    r.take_lenenc();

    let cs = r
        .take_u16_le()
        .ok_or_else(|| protocol_error("column definition missing charset"))?;
    let length = r
        .take_u32_le()
        .ok_or_else(|| protocol_error("column definition missing length"))?;
    let type_byte = r
        .take_u8()
        .ok_or_else(|| protocol_error("column definition missing type"))?;
    let flags = if long_flag {
        r.take_u16_le()
            .ok_or_else(|| protocol_error("column definition missing flags"))?
    } else {
        u16::from(
            r.take_u8()
                .ok_or_else(|| protocol_error("column definition missing flags"))?,
        )
    };
    let decimals = r
        .take_u8()
        .ok_or_else(|| protocol_error("column definition missing scale"))?;
    // Two reserved filler bytes follow; older servers omit them.
    r.advance(2);

    Ok(Column {
        catalog,
        schema,
        table,
        org_table,
        name,
        org_name,
        charset: cs,
        length,
        field_type: FieldType::from_wire(type_byte),
        flags,
        decimals,
    })
}

/// Session-wide decoding overrides derived from the settings.
#[derive(Debug, Default)]
pub struct DecodePolicy {
    old_guids: bool,
    treat_blobs_as_text: bool,
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl DecodePolicy {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        let compile = |p: &Option<String>| {
            p.as_deref().and_then(|pat| match Regex::new(pat) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = pat, error = %e, "ignoring invalid blob-text pattern");
                    None
                }
            })
        };
        Self {
            old_guids: settings.old_guids,
            treat_blobs_as_text: settings.treat_blobs_as_text,
            include: compile(&settings.blob_text_include),
            exclude: compile(&settings.blob_text_exclude),
        }
    }

    /// Whether a blob-typed column's bytes should decode as text.
    pub fn blob_decodes_as_text(&self, column: &Column) -> bool {
        if self.treat_blobs_as_text {
            let included = self
                .include
                .as_ref()
                .is_none_or(|re| re.is_match(&column.name));
            let excluded = self
                .exclude
                .as_ref()
                .is_some_and(|re| re.is_match(&column.name));
            if included && !excluded {
                return true;
            }
        }
        // Blob wire types carrying a text charset are TEXT columns.
        !column.has_binary_charset()
    }

    /// Whether the column decodes as a 128-bit identifier.
    pub fn is_guid(&self, column: &Column) -> bool {
        self.old_guids
            && column.length == 16
            && column.has_binary_charset()
            && matches!(
                column.field_type,
                FieldType::String | FieldType::VarString | FieldType::Blob
            )
    }
}

/// Decode one text-protocol value (already length-delimited by the row).
pub fn decode_text(column: &Column, policy: &DecodePolicy, data: &[u8]) -> Value {
    if policy.is_guid(column) && data.len() == 16 {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(data);
        return Value::Uuid(raw);
    }

    let unsigned = column.is_unsigned();
    let text = || String::from_utf8_lossy(data).into_owned();

    match column.field_type {
        FieldType::Tiny => parse_int::<i8>(data, unsigned)
            .unwrap_or_else(|| Value::Text(text())),
        FieldType::Short | FieldType::Year => {
            parse_int::<i16>(data, unsigned).unwrap_or_else(|| Value::Text(text()))
        }
        FieldType::Long | FieldType::Int24 => {
            parse_int::<i32>(data, unsigned).unwrap_or_else(|| Value::Text(text()))
        }
        FieldType::LongLong => {
            parse_int::<i64>(data, unsigned).unwrap_or_else(|| Value::Text(text()))
        }
        FieldType::Float => std::str::from_utf8(data)
            .ok()
            .and_then(|s| s.parse::<f32>().ok())
            .map_or_else(|| Value::Text(text()), Value::Float),
        FieldType::Double => std::str::from_utf8(data)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map_or_else(|| Value::Text(text()), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text()),
        FieldType::Date | FieldType::NewDate => {
            parse_text_date(data).unwrap_or_else(|| Value::Text(text()))
        }
        FieldType::Time => parse_text_time(data).unwrap_or_else(|| Value::Text(text())),
        FieldType::DateTime | FieldType::Timestamp => {
            parse_text_datetime(data).unwrap_or_else(|| Value::Text(text()))
        }
        FieldType::Bit => decode_bit(data),
        FieldType::Json => serde_json::from_slice(data)
            .map_or_else(|_| Value::Text(text()), Value::Json),
        FieldType::Null => Value::Null,
        FieldType::Geometry => Value::Bytes(data.to_vec()),
        t if t.is_blob() => {
            if policy.blob_decodes_as_text(column) {
                Value::Text(text())
            } else {
                Value::Bytes(data.to_vec())
            }
        }
        _ => {
            if column.has_binary_charset() {
                Value::Bytes(data.to_vec())
            } else {
                Value::Text(text())
            }
        }
    }
}

fn parse_int<T>(data: &[u8], unsigned: bool) -> Option<Value>
where
    T: std::str::FromStr + Into<Value>,
{
    let s = std::str::from_utf8(data).ok()?;
    if unsigned {
        // Promote through the matching-width unsigned parse.
        match std::mem::size_of::<T>() {
            1 => s.parse::<u8>().ok().map(Value::TinyUint),
            2 => s.parse::<u16>().ok().map(Value::SmallUint),
            4 => s.parse::<u32>().ok().map(Value::Uint),
            _ => s.parse::<u64>().ok().map(Value::BigUint),
        }
    } else {
        s.parse::<T>().ok().map(Into::into)
    }
}

fn parse_text_date(data: &[u8]) -> Option<Value> {
    let s = std::str::from_utf8(data).ok()?;
    let mut parts = s.splitn(3, '-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next()?.parse().ok()?;
    let day = parts.next()?.parse().ok()?;
    Some(Value::Date { year, month, day })
}

fn parse_text_time(data: &[u8]) -> Option<Value> {
    let s = std::str::from_utf8(data).ok()?;
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (clock, micros) = match s.split_once('.') {
        Some((c, frac)) => {
            let mut digits = frac.to_string();
            while digits.len() < 6 {
                digits.push('0');
            }
            (c, digits[..6].parse().ok()?)
        }
        None => (s, 0),
    };
    let mut parts = clock.splitn(3, ':');
    let total_hours: u32 = parts.next()?.parse().ok()?;
    let minutes = parts.next()?.parse().ok()?;
    let seconds = parts.next()?.parse().ok()?;
    Some(Value::Time {
        negative,
        days: total_hours / 24,
        hours: (total_hours % 24) as u8,
        minutes,
        seconds,
        micros,
    })
}

fn parse_text_datetime(data: &[u8]) -> Option<Value> {
    let s = std::str::from_utf8(data).ok()?;
    let (date_part, time_part) = s.split_once(' ')?;
    let Some(Value::Date { year, month, day }) = parse_text_date(date_part.as_bytes()) else {
        return None;
    };
    let (clock, micros) = match time_part.split_once('.') {
        Some((c, frac)) => {
            let mut digits = frac.to_string();
            while digits.len() < 6 {
                digits.push('0');
            }
            (c, digits[..6].parse().ok()?)
        }
        None => (time_part, 0),
    };
    let mut parts = clock.splitn(3, ':');
    let hour = parts.next()?.parse().ok()?;
    let minute = parts.next()?.parse().ok()?;
    let second = parts.next()?.parse().ok()?;
    Some(Value::DateTime {
        year,
        month,
        day,
        hour,
        minute,
        second,
        micros,
    })
}

/// BIT values are byte arrays interpreted big-endian.
fn decode_bit(data: &[u8]) -> Value {
    if data.len() <= 8 {
        let mut v: u64 = 0;
        for &b in data {
            v = (v << 8) | u64::from(b);
        }
        Value::BigUint(v)
    } else {
        Value::Bytes(data.to_vec())
    }
}

/// Decode one binary-protocol value, consuming it from the reader.
pub fn decode_binary(column: &Column, policy: &DecodePolicy, r: &mut ByteReader<'_>) -> Result<Value> {
    let unsigned = column.is_unsigned();
    let truncated = || protocol_error(format!("binary row truncated in column '{}'", column.name));

    let value = match column.field_type {
        FieldType::Tiny => {
            let v = r.take_u8().ok_or_else(truncated)?;
            if unsigned {
                Value::TinyUint(v)
            } else {
                Value::TinyInt(v as i8)
            }
        }
        FieldType::Short | FieldType::Year => {
            let v = r.take_u16_le().ok_or_else(truncated)?;
            if unsigned {
                Value::SmallUint(v)
            } else {
                Value::SmallInt(v as i16)
            }
        }
        FieldType::Long | FieldType::Int24 => {
            let v = r.take_u32_le().ok_or_else(truncated)?;
            if unsigned {
                Value::Uint(v)
            } else {
                Value::Int(v as i32)
            }
        }
        FieldType::LongLong => {
            let v = r.take_u64_le().ok_or_else(truncated)?;
            if unsigned {
                Value::BigUint(v)
            } else {
                Value::BigInt(v as i64)
            }
        }
        FieldType::Float => Value::Float(r.take_f32_le().ok_or_else(truncated)?),
        FieldType::Double => Value::Double(r.take_f64_le().ok_or_else(truncated)?),
        FieldType::Decimal | FieldType::NewDecimal => {
            let bytes = r.take_lenenc_bytes().ok_or_else(truncated)?;
            Value::Decimal(String::from_utf8_lossy(bytes).into_owned())
        }
        FieldType::Date | FieldType::NewDate => decode_binary_date(r).ok_or_else(truncated)?,
        FieldType::Time => decode_binary_time(r).ok_or_else(truncated)?,
        FieldType::DateTime | FieldType::Timestamp => {
            decode_binary_datetime(r).ok_or_else(truncated)?
        }
        FieldType::Bit => {
            let bytes = r.take_lenenc_bytes().ok_or_else(truncated)?;
            decode_bit(bytes)
        }
        FieldType::Json => {
            let bytes = r.take_lenenc_bytes().ok_or_else(truncated)?;
            serde_json::from_slice(bytes)
                .map_or_else(|_| Value::Text(String::from_utf8_lossy(bytes).into_owned()), Value::Json)
        }
        FieldType::Null => Value::Null,
        FieldType::Geometry => Value::Bytes(r.take_lenenc_bytes().ok_or_else(truncated)?.to_vec()),
        t => {
            let bytes = r.take_lenenc_bytes().ok_or_else(truncated)?;
            if policy.is_guid(column) && bytes.len() == 16 {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(bytes);
                Value::Uuid(raw)
            } else if t.is_blob() {
                if policy.blob_decodes_as_text(column) {
                    Value::Text(String::from_utf8_lossy(bytes).into_owned())
                } else {
                    Value::Bytes(bytes.to_vec())
                }
            } else if column.has_binary_charset() {
                Value::Bytes(bytes.to_vec())
            } else {
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    };
    Ok(value)
}

/// Skip one binary-protocol value without materializing it.
pub fn skip_binary(column: &Column, r: &mut ByteReader<'_>) -> Result<()> {
    let truncated = || protocol_error(format!("binary row truncated in column '{}'", column.name));
    let fixed = match column.field_type {
        FieldType::Tiny => Some(1),
        FieldType::Short | FieldType::Year => Some(2),
        FieldType::Long | FieldType::Int24 | FieldType::Float => Some(4),
        FieldType::LongLong | FieldType::Double => Some(8),
        FieldType::Null => Some(0),
        _ => None,
    };
    match fixed {
        Some(n) => {
            if !r.advance(n) {
                return Err(truncated());
            }
        }
        None => match column.field_type {
            // Temporal values carry their own length byte.
            FieldType::Date
            | FieldType::NewDate
            | FieldType::Time
            | FieldType::DateTime
            | FieldType::Timestamp => {
                let len = r.take_u8().ok_or_else(truncated)?;
                if !r.advance(usize::from(len)) {
                    return Err(truncated());
                }
            }
            _ => {
                r.take_lenenc_bytes().ok_or_else(truncated)?;
            }
        },
    }
    Ok(())
}

fn decode_binary_date(r: &mut ByteReader<'_>) -> Option<Value> {
    let len = r.take_u8()?;
    match len {
        0 => Some(Value::Date {
            year: 0,
            month: 0,
            day: 0,
        }),
        4 => {
            let year = r.take_u16_le()?;
            let month = r.take_u8()?;
            let day = r.take_u8()?;
            Some(Value::Date { year, month, day })
        }
        _ => None,
    }
}

fn decode_binary_time(r: &mut ByteReader<'_>) -> Option<Value> {
    let len = r.take_u8()?;
    match len {
        0 => Some(Value::Time {
            negative: false,
            days: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
            micros: 0,
        }),
        8 | 12 => {
            let negative = r.take_u8()? != 0;
            let days = r.take_u32_le()?;
            let hours = r.take_u8()?;
            let minutes = r.take_u8()?;
            let seconds = r.take_u8()?;
            let micros = if len == 12 { r.take_u32_le()? } else { 0 };
            Some(Value::Time {
                negative,
                days,
                hours,
                minutes,
                seconds,
                micros,
            })
        }
        _ => None,
    }
}

fn decode_binary_datetime(r: &mut ByteReader<'_>) -> Option<Value> {
    let len = r.take_u8()?;
    let mut value = Value::DateTime {
        year: 0,
        month: 0,
        day: 0,
        hour: 0,
        minute: 0,
        second: 0,
        micros: 0,
    };
    if len == 0 {
        return Some(value);
    }
    if !matches!(len, 4 | 7 | 11) {
        return None;
    }
    if let Value::DateTime {
        year,
        month,
        day,
        hour,
        minute,
        second,
        micros,
    } = &mut value
    {
        *year = r.take_u16_le()?;
        *month = r.take_u8()?;
        *day = r.take_u8()?;
        if len >= 7 {
            *hour = r.take_u8()?;
            *minute = r.take_u8()?;
            *second = r.take_u8()?;
        }
        if len == 11 {
            *micros = r.take_u32_le()?;
        }
    }
    Some(value)
}

/// The wire type and flag byte declared for a bound parameter.
pub fn wire_type_of(value: &Value) -> (u8, u8) {
    match value {
        Value::Null => (FieldType::Null as u8, 0),
        Value::TinyInt(_) => (FieldType::Tiny as u8, 0),
        Value::SmallInt(_) => (FieldType::Short as u8, 0),
        Value::Int(_) => (FieldType::Long as u8, 0),
        Value::BigInt(_) => (FieldType::LongLong as u8, 0),
        Value::TinyUint(_) => (FieldType::Tiny as u8, 0x80),
        Value::SmallUint(_) => (FieldType::Short as u8, 0x80),
        Value::Uint(_) => (FieldType::Long as u8, 0x80),
        Value::BigUint(_) => (FieldType::LongLong as u8, 0x80),
        Value::Float(_) => (FieldType::Float as u8, 0),
        Value::Double(_) => (FieldType::Double as u8, 0),
        Value::Decimal(_) => (FieldType::NewDecimal as u8, 0),
        Value::Text(_) => (FieldType::VarString as u8, 0),
        Value::Bytes(_) | Value::Uuid(_) => (FieldType::Blob as u8, 0),
        Value::Date { .. } => (FieldType::Date as u8, 0),
        Value::Time { .. } => (FieldType::Time as u8, 0),
        Value::DateTime { .. } => (FieldType::DateTime as u8, 0),
        Value::Json(_) => (FieldType::Json as u8, 0),
    }
}

/// Append one bound parameter in its binary wire encoding. NULLs are carried
/// by the null bitmap and write nothing here.
pub fn encode_binary(w: &mut ByteWriter, value: &Value) {
    match value {
        Value::Null => {}
        Value::TinyInt(v) => w.put_u8(*v as u8),
        Value::SmallInt(v) => w.put_u16_le(*v as u16),
        Value::Int(v) => w.put_u32_le(*v as u32),
        Value::BigInt(v) => w.put_u64_le(*v as u64),
        Value::TinyUint(v) => w.put_u8(*v),
        Value::SmallUint(v) => w.put_u16_le(*v),
        Value::Uint(v) => w.put_u32_le(*v),
        Value::BigUint(v) => w.put_u64_le(*v),
        Value::Float(v) => w.put_f32_le(*v),
        Value::Double(v) => w.put_f64_le(*v),
        Value::Decimal(s) => w.put_lenenc_str(s),
        Value::Text(s) => w.put_lenenc_str(s),
        Value::Bytes(b) => w.put_lenenc_bytes(b),
        Value::Uuid(u) => w.put_lenenc_bytes(u),
        Value::Json(j) => w.put_lenenc_str(&j.to_string()),
        Value::Date { year, month, day } => {
            if *year == 0 && *month == 0 && *day == 0 {
                w.put_u8(0);
            } else {
                w.put_u8(4);
                w.put_u16_le(*year);
                w.put_u8(*month);
                w.put_u8(*day);
            }
        }
        Value::Time {
            negative,
            days,
            hours,
            minutes,
            seconds,
            micros,
        } => {
            if !negative && *days == 0 && *hours == 0 && *minutes == 0 && *seconds == 0 && *micros == 0
            {
                w.put_u8(0);
            } else if *micros == 0 {
                w.put_u8(8);
                w.put_u8(u8::from(*negative));
                w.put_u32_le(*days);
                w.put_u8(*hours);
                w.put_u8(*minutes);
                w.put_u8(*seconds);
            } else {
                w.put_u8(12);
                w.put_u8(u8::from(*negative));
                w.put_u32_le(*days);
                w.put_u8(*hours);
                w.put_u8(*minutes);
                w.put_u8(*seconds);
                w.put_u32_le(*micros);
            }
        }
        Value::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            micros,
        } => {
            if *micros != 0 {
                w.put_u8(11);
                w.put_u16_le(*year);
                w.put_u8(*month);
                w.put_u8(*day);
                w.put_u8(*hour);
                w.put_u8(*minute);
                w.put_u8(*second);
                w.put_u32_le(*micros);
            } else if *hour != 0 || *minute != 0 || *second != 0 {
                w.put_u8(7);
                w.put_u16_le(*year);
                w.put_u8(*month);
                w.put_u8(*day);
                w.put_u8(*hour);
                w.put_u8(*minute);
                w.put_u8(*second);
            } else if *year != 0 || *month != 0 || *day != 0 {
                w.put_u8(4);
                w.put_u16_le(*year);
                w.put_u8(*month);
                w.put_u8(*day);
            } else {
                w.put_u8(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(field_type: FieldType, flags: u16, cs: u16, length: u32) -> Column {
        Column {
            catalog: "def".to_string(),
            schema: "test".to_string(),
            table: "t".to_string(),
            org_table: "t".to_string(),
            name: "c".to_string(),
            org_name: "c".to_string(),
            charset: cs,
            length,
            field_type,
            flags,
            decimals: 0,
        }
    }

    #[test]
    fn text_integer_promotion() {
        let policy = DecodePolicy::default();
        let signed = column(FieldType::Long, 0, 33, 11);
        assert_eq!(decode_text(&signed, &policy, b"-7"), Value::Int(-7));

        let unsigned = column(FieldType::Long, column_flags::UNSIGNED, 33, 11);
        assert_eq!(
            decode_text(&unsigned, &policy, b"4294967295"),
            Value::Uint(u32::MAX)
        );

        let big = column(FieldType::LongLong, column_flags::UNSIGNED, 33, 20);
        assert_eq!(
            decode_text(&big, &policy, b"18446744073709551615"),
            Value::BigUint(u64::MAX)
        );
    }

    #[test]
    fn text_temporal_parsing() {
        let policy = DecodePolicy::default();
        let date = column(FieldType::Date, 0, 33, 10);
        assert_eq!(
            decode_text(&date, &policy, b"2024-02-29"),
            Value::Date {
                year: 2024,
                month: 2,
                day: 29
            }
        );

        let time = column(FieldType::Time, 0, 33, 10);
        assert_eq!(
            decode_text(&time, &policy, b"-26:03:04.5"),
            Value::Time {
                negative: true,
                days: 1,
                hours: 2,
                minutes: 3,
                seconds: 4,
                micros: 500_000
            }
        );

        let dt = column(FieldType::DateTime, 0, 33, 19);
        assert_eq!(
            decode_text(&dt, &policy, b"1999-12-31 23:59:59"),
            Value::DateTime {
                year: 1999,
                month: 12,
                day: 31,
                hour: 23,
                minute: 59,
                second: 59,
                micros: 0
            }
        );
    }

    #[test]
    fn blob_charset_decides_text() {
        let policy = DecodePolicy::default();
        let text_blob = column(FieldType::Blob, column_flags::BLOB, 33, 65535);
        assert_eq!(
            decode_text(&text_blob, &policy, b"hello"),
            Value::Text("hello".to_string())
        );

        let binary_blob = column(FieldType::Blob, column_flags::BLOB, 63, 65535);
        assert_eq!(
            decode_text(&binary_blob, &policy, b"\x01\x02"),
            Value::Bytes(vec![1, 2])
        );
    }

    #[test]
    fn blob_text_name_patterns() {
        let settings = ConnectionSettings::new()
            .treat_blobs_as_text(true)
            .blob_text_include("^doc_")
            .blob_text_exclude("_raw$");
        let policy = DecodePolicy::from_settings(&settings);

        let mut included = column(FieldType::Blob, column_flags::BLOB, 63, 100);
        included.name = "doc_body".to_string();
        assert!(policy.blob_decodes_as_text(&included));

        let mut excluded = column(FieldType::Blob, column_flags::BLOB, 63, 100);
        excluded.name = "doc_body_raw".to_string();
        assert!(!policy.blob_decodes_as_text(&excluded));

        let mut unmatched = column(FieldType::Blob, column_flags::BLOB, 63, 100);
        unmatched.name = "payload".to_string();
        assert!(!policy.blob_decodes_as_text(&unmatched));
    }

    #[test]
    fn guid_special_case() {
        let settings = ConnectionSettings::new().old_guids(true);
        let policy = DecodePolicy::from_settings(&settings);
        let col = column(FieldType::String, 0, 63, 16);
        assert!(policy.is_guid(&col));

        let raw = [7u8; 16];
        assert_eq!(decode_text(&col, &policy, &raw), Value::Uuid(raw));

        // Without the policy the same bytes stay binary.
        let off = DecodePolicy::default();
        assert_eq!(decode_text(&col, &off, &raw), Value::Bytes(raw.to_vec()));
    }

    #[test]
    fn bit_is_big_endian() {
        assert_eq!(decode_bit(&[0x01, 0x00]), Value::BigUint(256));
        assert_eq!(decode_bit(&[0xFF]), Value::BigUint(255));
    }

    #[test]
    fn binary_integers() {
        let policy = DecodePolicy::default();
        let col = column(FieldType::Long, 0, 63, 11);
        let mut r = ByteReader::new(&[0x2A, 0x00, 0x00, 0x00]);
        assert_eq!(decode_binary(&col, &policy, &mut r).unwrap(), Value::Int(42));

        let ucol = column(FieldType::Tiny, column_flags::UNSIGNED, 63, 3);
        let mut r = ByteReader::new(&[0xFF]);
        assert_eq!(
            decode_binary(&ucol, &policy, &mut r).unwrap(),
            Value::TinyUint(255)
        );
    }

    #[test]
    fn binary_datetime_lengths() {
        let policy = DecodePolicy::default();
        let col = column(FieldType::DateTime, 0, 63, 19);

        let mut r = ByteReader::new(&[0]);
        assert_eq!(
            decode_binary(&col, &policy, &mut r).unwrap(),
            Value::DateTime {
                year: 0,
                month: 0,
                day: 0,
                hour: 0,
                minute: 0,
                second: 0,
                micros: 0
            }
        );

        let mut r = ByteReader::new(&[7, 0xE8, 0x07, 12, 31, 23, 59, 58]);
        assert_eq!(
            decode_binary(&col, &policy, &mut r).unwrap(),
            Value::DateTime {
                year: 2024,
                month: 12,
                day: 31,
                hour: 23,
                minute: 59,
                second: 58,
                micros: 0
            }
        );
    }

    #[test]
    fn binary_encode_roundtrip_fixed_widths() {
        let policy = DecodePolicy::default();
        let mut w = ByteWriter::new();
        encode_binary(&mut w, &Value::Int(-5));
        encode_binary(&mut w, &Value::Double(2.5));

        let mut r = ByteReader::new(w.as_slice());
        let int_col = column(FieldType::Long, 0, 63, 11);
        let dbl_col = column(FieldType::Double, 0, 63, 22);
        assert_eq!(decode_binary(&int_col, &policy, &mut r).unwrap(), Value::Int(-5));
        assert_eq!(
            decode_binary(&dbl_col, &policy, &mut r).unwrap(),
            Value::Double(2.5)
        );
    }

    #[test]
    fn skip_binary_consumes_exactly_one_value() {
        let mut w = ByteWriter::new();
        encode_binary(&mut w, &Value::Int(7));
        encode_binary(&mut w, &Value::Text("rest".to_string()));

        let mut r = ByteReader::new(w.as_slice());
        let int_col = column(FieldType::Long, 0, 63, 11);
        skip_binary(&int_col, &mut r).unwrap();

        let text_col = column(FieldType::VarString, 0, 33, 40);
        let policy = DecodePolicy::default();
        assert_eq!(
            decode_binary(&text_col, &policy, &mut r).unwrap(),
            Value::Text("rest".to_string())
        );
    }

    #[test]
    fn parse_column_definition() {
        let mut w = ByteWriter::new();
        w.put_lenenc_str("def");
        w.put_lenenc_str("shop");
        w.put_lenenc_str("orders");
        w.put_lenenc_str("orders");
        w.put_lenenc_str("id");
        w.put_lenenc_str("id");
        w.put_lenenc(0x0C);
        w.put_u16_le(63);
        w.put_u32_le(11);
        w.put_u8(FieldType::Long as u8);
        w.put_u16_le(column_flags::NOT_NULL | column_flags::PRIMARY_KEY | column_flags::UNSIGNED);
        w.put_u8(0);
        w.put_u16_le(0);

        let col = parse_column(w.as_slice(), true).unwrap();
        assert_eq!(col.name, "id");
        assert_eq!(col.schema, "shop");
        assert_eq!(col.field_type, FieldType::Long);
        assert!(col.is_primary_key());
        assert!(col.is_unsigned());
        assert!(!col.is_nullable());
    }

    #[test]
    fn parse_column_short_flags() {
        let mut w = ByteWriter::new();
        for s in ["def", "", "t", "t", "c", "c"] {
            w.put_lenenc_str(s);
        }
        w.put_lenenc(0x0C);
        w.put_u16_le(33);
        w.put_u32_le(20);
        w.put_u8(FieldType::VarString as u8);
        w.put_u8(0); // single-byte flags without the long-flag capability
        w.put_u8(0);

        let col = parse_column(w.as_slice(), false).unwrap();
        assert_eq!(col.field_type, FieldType::VarString);
        assert!(col.is_nullable());
    }

    #[test]
    fn wire_types_for_params() {
        assert_eq!(wire_type_of(&Value::Int(1)), (FieldType::Long as u8, 0));
        assert_eq!(wire_type_of(&Value::Uint(1)), (FieldType::Long as u8, 0x80));
        assert_eq!(
            wire_type_of(&Value::Text(String::new())),
            (FieldType::VarString as u8, 0)
        );
        assert_eq!(wire_type_of(&Value::Null), (FieldType::Null as u8, 0));
    }
}
