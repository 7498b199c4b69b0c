//! Dynamically-typed wire values.
//!
//! One closed variant per supported MySQL value kind. The unsigned integer
//! variants exist because the column UNSIGNED flag promotes the signed wire
//! types; temporal values carry calendar components the way the binary
//! protocol encodes them.

use serde::{Deserialize, Serialize};

/// A dynamically-typed SQL value, used for parameter binding and result rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// 8-bit signed integer (TINYINT)
    TinyInt(i8),

    /// 16-bit signed integer (SMALLINT)
    SmallInt(i16),

    /// 32-bit signed integer (INT, MEDIUMINT)
    Int(i32),

    /// 64-bit signed integer (BIGINT)
    BigInt(i64),

    /// 8-bit unsigned integer (TINYINT UNSIGNED)
    TinyUint(u8),

    /// 16-bit unsigned integer (SMALLINT UNSIGNED, YEAR)
    SmallUint(u16),

    /// 32-bit unsigned integer (INT UNSIGNED)
    Uint(u32),

    /// 64-bit unsigned integer (BIGINT UNSIGNED, BIT)
    BigUint(u64),

    /// 32-bit floating point (FLOAT)
    Float(f32),

    /// 64-bit floating point (DOUBLE)
    Double(f64),

    /// Arbitrary precision decimal, kept textual to preserve precision
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Calendar date (DATE)
    Date { year: u16, month: u8, day: u8 },

    /// Elapsed time, possibly over 24h and negative (TIME)
    Time {
        negative: bool,
        days: u32,
        hours: u8,
        minutes: u8,
        seconds: u8,
        micros: u32,
    },

    /// Date and time of day (DATETIME, TIMESTAMP)
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micros: u32,
    },

    /// 128-bit unique identifier (BINARY(16) with the guid policy enabled)
    Uuid([u8; 16]),

    /// JSON document
    Json(serde_json::Value),
}

impl Value {
    /// Check whether this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// A short name for the contained kind, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INT",
            Value::BigInt(_) => "BIGINT",
            Value::TinyUint(_) => "TINYINT UNSIGNED",
            Value::SmallUint(_) => "SMALLINT UNSIGNED",
            Value::Uint(_) => "INT UNSIGNED",
            Value::BigUint(_) => "BIGINT UNSIGNED",
            Value::Float(_) => "FLOAT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date { .. } => "DATE",
            Value::Time { .. } => "TIME",
            Value::DateTime { .. } => "DATETIME",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Widen any integer variant to i64. None for non-integers and for
    /// unsigned values that do not fit.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::TinyUint(v) => Some(i64::from(*v)),
            Value::SmallUint(v) => Some(i64::from(*v)),
            Value::Uint(v) => Some(i64::from(*v)),
            Value::BigUint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Widen any non-negative integer variant to u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::TinyUint(v) => Some(u64::from(*v)),
            Value::SmallUint(v) => Some(u64::from(*v)),
            Value::Uint(v) => Some(u64::from(*v)),
            Value::BigUint(v) => Some(*v),
            Value::TinyInt(v) => u64::try_from(*v).ok(),
            Value::SmallInt(v) => u64::try_from(*v).ok(),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::BigInt(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Widen any numeric variant to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    /// Borrow the contained text, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the contained bytes, if any.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            Value::Uuid(u) => Some(u),
            _ => None,
        }
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::TinyUint(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::SmallUint(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::BigUint(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::TinyInt(i8::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_detection() {
        assert!(Value::Null.is_null());
        assert!(!Value::Int(0).is_null());
        assert!(Value::from(None::<i32>).is_null());
    }

    #[test]
    fn integer_widening() {
        assert_eq!(Value::TinyInt(-1).as_i64(), Some(-1));
        assert_eq!(Value::BigUint(u64::MAX).as_i64(), None);
        assert_eq!(Value::BigUint(u64::MAX).as_u64(), Some(u64::MAX));
        assert_eq!(Value::Int(-5).as_u64(), None);
        assert_eq!(Value::SmallUint(65535).as_i64(), Some(65535));
    }

    #[test]
    fn float_widening() {
        assert_eq!(Value::Int(2).as_f64(), Some(2.0));
        assert_eq!(Value::Float(1.5).as_f64(), Some(1.5));
        assert!(Value::Text("x".into()).as_f64().is_none());
    }

    #[test]
    fn conversions() {
        assert_eq!(Value::from(42i32), Value::Int(42));
        assert_eq!(Value::from(42u32), Value::Uint(42));
        assert_eq!(Value::from("hi"), Value::Text("hi".to_string()));
        assert_eq!(Value::from(true), Value::TinyInt(1));
        assert_eq!(Value::from(vec![1u8, 2]), Value::Bytes(vec![1, 2]));
    }

    #[test]
    fn type_names() {
        assert_eq!(Value::Null.type_name(), "NULL");
        assert_eq!(Value::BigUint(1).type_name(), "BIGINT UNSIGNED");
        assert_eq!(
            Value::Date {
                year: 2024,
                month: 2,
                day: 29
            }
            .type_name(),
            "DATE"
        );
    }
}
