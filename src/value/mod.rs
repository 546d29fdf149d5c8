//! The payload value tree.
//!
//! Wire payloads interleave JSON data with out-of-band blobs and live
//! streams, so they are modeled as a tagged tree instead of raw
//! `serde_json::Value`: the codec is total over this variant and placeholder
//! substitution never has to guess at runtime types. Cycles are impossible
//! by construction.

use std::collections::BTreeMap;
use std::rc::Rc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::stream::{ReadStream, WriteStream};

/// A live stream embedded in a payload.
///
/// Outbound payloads embed [`WriteStream`]s; decoded inbound payloads
/// materialize [`ReadStream`]s in their place.
#[derive(Clone)]
pub enum StreamValue {
    /// Local write side, embeddable in outbound payloads.
    Write(Rc<WriteStream>),
    /// Remote-fed read side, produced by decoding.
    Read(Rc<ReadStream>),
}

impl std::fmt::Debug for StreamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamValue::Write(s) => write!(f, "WriteStream({:?})", s.id()),
            StreamValue::Read(s) => write!(f, "ReadStream({})", s.id()),
        }
    }
}

/// A payload value: JSON primitives plus dates, blobs, and live streams.
///
/// `Date` encodes as an RFC 3339 string with millisecond precision; the
/// wire carries no type tag for dates, so on decode they arrive as
/// [`Value::Str`].
#[derive(Debug, Clone)]
pub enum Value {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Num(serde_json::Number),
    /// JSON string.
    Str(String),
    /// A point in time, encoded as RFC 3339 text.
    Date(DateTime<Utc>),
    /// An opaque byte blob, carried out-of-band in a binary-content frame.
    Blob(Bytes),
    /// A live stream.
    Stream(StreamValue),
    /// JSON array.
    Arr(Vec<Value>),
    /// JSON object. Keys are held sorted for deterministic encoding.
    Obj(BTreeMap<String, Value>),
}

impl Value {
    /// Build an object value from key/value pairs.
    pub fn obj<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Obj(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// Build an array value.
    pub fn arr<I: IntoIterator<Item = Value>>(items: I) -> Self {
        Value::Arr(items.into_iter().collect())
    }

    /// Wrap a write stream for embedding in an outbound payload.
    pub fn write_stream(stream: Rc<WriteStream>) -> Self {
        Value::Stream(StreamValue::Write(stream))
    }

    /// The string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The numeric content as f64, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(n) => n.as_f64(),
            _ => None,
        }
    }

    /// The numeric content as i64, if this is an integral number.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Num(n) => n.as_i64(),
            _ => None,
        }
    }

    /// The boolean content, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The blob content, if this is a blob.
    pub fn as_blob(&self) -> Option<&Bytes> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// The array content, if this is an array.
    pub fn as_arr(&self) -> Option<&[Value]> {
        match self {
            Value::Arr(items) => Some(items),
            _ => None,
        }
    }

    /// The object content, if this is an object.
    pub fn as_obj(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Obj(map) => Some(map),
            _ => None,
        }
    }

    /// Fetch an object member by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_obj().and_then(|map| map.get(key))
    }

    /// The read stream, if this is a decoded stream handle.
    pub fn as_read_stream(&self) -> Option<&Rc<ReadStream>> {
        match self {
            Value::Stream(StreamValue::Read(s)) => Some(s),
            _ => None,
        }
    }

    /// The write stream, if this is a local stream handle.
    pub fn as_write_stream(&self) -> Option<&Rc<WriteStream>> {
        match self {
            Value::Stream(StreamValue::Write(s)) => Some(s),
            _ => None,
        }
    }

    /// True if this is `Value::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Structural equality. Stream handles compare by identity (the same
/// underlying stream), everything else by content.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Arr(a), Value::Arr(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            (Value::Stream(StreamValue::Write(a)), Value::Stream(StreamValue::Write(b))) => {
                Rc::ptr_eq(a, b)
            }
            (Value::Stream(StreamValue::Read(a)), Value::Stream(StreamValue::Read(b))) => {
                Rc::ptr_eq(a, b)
            }
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Num(v.into())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Num(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Num(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        serde_json::Number::from_f64(v).map_or(Value::Null, Value::Num)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Blob(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Value {
    fn from(v: &'static [u8]) -> Self {
        Value::Blob(Bytes::from_static(v))
    }
}

impl From<Rc<WriteStream>> for Value {
    fn from(v: Rc<WriteStream>) -> Self {
        Value::Stream(StreamValue::Write(v))
    }
}

impl From<Rc<ReadStream>> for Value {
    fn from(v: Rc<ReadStream>) -> Self {
        Value::Stream(StreamValue::Read(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
