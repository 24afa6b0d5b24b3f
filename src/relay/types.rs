//! Typed values exchanged with the proxy.
//!
//! Every value travels with an explicit type tag. Nothing is inferred from a
//! textual representation, and decoding never coerces between types.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime};

use super::error::{RelayError, RelayResult};

// ============================================================================
// Type Tags
// ============================================================================

/// Wire type tag of a value or a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Null = 0,
    Integer = 1,
    Float = 2,
    String = 3,
    Bytes = 4,
    DateTime = 5,
    Bool = 6,
}

impl TypeTag {
    pub fn from_u8(tag: u8) -> RelayResult<Self> {
        match tag {
            0 => Ok(TypeTag::Null),
            1 => Ok(TypeTag::Integer),
            2 => Ok(TypeTag::Float),
            3 => Ok(TypeTag::String),
            4 => Ok(TypeTag::Bytes),
            5 => Ok(TypeTag::DateTime),
            6 => Ok(TypeTag::Bool),
            _ => Err(RelayError::protocol(format!("unknown type tag: {}", tag))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Null => "null",
            TypeTag::Integer => "integer",
            TypeTag::Float => "float",
            TypeTag::String => "string",
            TypeTag::Bytes => "bytes",
            TypeTag::DateTime => "datetime",
            TypeTag::Bool => "bool",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Values
// ============================================================================

/// A nullable scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Naive date/time; encoded as seconds + nanoseconds since the Unix epoch.
    DateTime(NaiveDateTime),
    Bool(bool),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Integer(_) => TypeTag::Integer,
            Value::Float(_) => TypeTag::Float,
            Value::String(_) => TypeTag::String,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::DateTime(_) => TypeTag::DateTime,
            Value::Bool(_) => TypeTag::Bool,
        }
    }

    /// Append the tag and the binary form of this value.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_tag() as u8);
        match self {
            Value::Null => {}
            Value::Integer(v) => buf.put_i64(*v),
            Value::Float(v) => buf.put_f64(*v),
            Value::String(v) => put_bytes(buf, v.as_bytes()),
            Value::Bytes(v) => put_bytes(buf, v),
            Value::DateTime(v) => {
                let utc = v.and_utc();
                buf.put_i64(utc.timestamp());
                buf.put_u32(utc.timestamp_subsec_nanos());
            }
            Value::Bool(v) => buf.put_u8(u8::from(*v)),
        }
    }

    /// Decode one tagged value.
    pub fn decode(buf: &mut Bytes) -> RelayResult<Self> {
        let tag = TypeTag::from_u8(get_u8(buf)?)?;
        match tag {
            TypeTag::Null => Ok(Value::Null),
            TypeTag::Integer => {
                ensure(buf, 8, "integer")?;
                Ok(Value::Integer(buf.get_i64()))
            }
            TypeTag::Float => {
                ensure(buf, 8, "float")?;
                Ok(Value::Float(buf.get_f64()))
            }
            TypeTag::String => get_string(buf).map(Value::String),
            TypeTag::Bytes => get_bytes(buf).map(|b| Value::Bytes(b.to_vec())),
            TypeTag::DateTime => {
                ensure(buf, 12, "datetime")?;
                let secs = buf.get_i64();
                let nanos = buf.get_u32();
                DateTime::from_timestamp(secs, nanos)
                    .map(|dt| Value::DateTime(dt.naive_utc()))
                    .ok_or_else(|| {
                        RelayError::protocol(format!("datetime out of range: {}s {}ns", secs, nanos))
                    })
            }
            TypeTag::Bool => match get_u8(buf)? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                b => Err(RelayError::protocol(format!("invalid bool byte: {}", b))),
            },
        }
    }

    /// Short description used in type mismatch errors.
    pub fn describe(&self) -> String {
        self.type_tag().name().to_string()
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
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

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Primitive readers/writers shared with the protocol codec
// ============================================================================

/// Write a `u32` length prefix followed by the bytes.
pub(crate) fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub(crate) fn ensure(buf: &Bytes, needed: usize, what: &str) -> RelayResult<()> {
    if buf.remaining() < needed {
        return Err(RelayError::protocol(format!(
            "truncated {}: need {} byte(s), have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut Bytes) -> RelayResult<u8> {
    ensure(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> RelayResult<u32> {
    ensure(buf, 4, "u32")?;
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> RelayResult<u64> {
    ensure(buf, 8, "u64")?;
    Ok(buf.get_u64())
}

pub(crate) fn get_i32(buf: &mut Bytes) -> RelayResult<i32> {
    ensure(buf, 4, "i32")?;
    Ok(buf.get_i32())
}

pub(crate) fn get_i64(buf: &mut Bytes) -> RelayResult<i64> {
    ensure(buf, 8, "i64")?;
    Ok(buf.get_i64())
}

/// Read a `u32` length-prefixed byte string without copying.
pub(crate) fn get_bytes(buf: &mut Bytes) -> RelayResult<Bytes> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len, "byte string")?;
    Ok(buf.split_to(len))
}

/// Read a `u32` length-prefixed UTF-8 string. Embedded NUL bytes are legal.
pub(crate) fn get_string(buf: &mut Bytes) -> RelayResult<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| RelayError::protocol(format!("invalid UTF-8 in string: {}", e)))
}
