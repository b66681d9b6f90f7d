//! Cache value domain
//!
//! A cache value is either an opaque byte string or a structured value from
//! a JSON-like model: booleans, 64-bit integers, IEEE-754 doubles, strings,
//! ordered sequences, and string-keyed mappings. Structured values are
//! serialized to JSON text through an explicit mapping onto
//! `serde_json::Value` — the tags below are the source of truth, not any
//! derive machinery.
//!
//! Strings occupy both worlds: the engine persists a top-level
//! `Value::String` as its raw UTF-8 bytes (so set/get is byte-lossless and a
//! numeric-looking string can never be re-read as a number), while strings
//! nested inside sequences or mappings are ordinary JSON strings. Equality
//! between `String` and `Bytes` is therefore byte equality.

use std::collections::BTreeMap;

use crate::error::{BlobError, BlobResult};

/// A value storable in the cache.
#[derive(Debug, Clone)]
pub enum Value {
    /// Opaque byte string, stored without structured encoding
    Bytes(Vec<u8>),
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// IEEE-754 double; must be finite to be encodable
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Ordered sequence of values
    List(Vec<Value>),
    /// String-keyed mapping of values
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Borrow the underlying bytes of a `Bytes` or `String` value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Borrow the string form of a `String` value, or of `Bytes` that hold
    /// valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// The integer form of an `Int` value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// The double form of a `Float` or `Int` value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }
}

/// Structural equality, with `String` and `Bytes` comparing equal when their
/// UTF-8 bytes are equal. A string is a sequence of Unicode scalars encoded
/// as UTF-8 bytes, and the raw-bytes persistence path erases the tag.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::String(s), Value::Bytes(b)) | (Value::Bytes(b), Value::String(s)) => {
                s.as_bytes() == b.as_slice()
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
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
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

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

/// Encode a structured value as JSON text bytes.
///
/// `Bytes` cannot appear anywhere in a structured value (JSON has no byte
/// string type) and non-finite doubles have no JSON representation; both
/// fail with `BadValue`.
pub fn encode_structured(value: &Value) -> BlobResult<Vec<u8>> {
    let json = to_json(value)?;
    serde_json::to_vec(&json).map_err(|e| BlobError::Codec {
        message: format!("JSON serialization failed: {}", e),
    })
}

/// Decode JSON text bytes back into a structured value.
pub fn decode_structured(bytes: &[u8]) -> BlobResult<Value> {
    let json: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| BlobError::Codec {
        message: format!("JSON parse failed: {}", e),
    })?;
    from_json(&json)
}

fn to_json(value: &Value) -> BlobResult<serde_json::Value> {
    match value {
        Value::Bytes(_) => Err(BlobError::BadValue {
            reason: "byte strings cannot be nested inside a structured value".to_string(),
        }),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Int(n) => Ok(serde_json::Value::Number((*n).into())),
        Value::Float(x) => match serde_json::Number::from_f64(*x) {
            Some(n) => Ok(serde_json::Value::Number(n)),
            None => Err(BlobError::BadValue {
                reason: format!("non-finite double {} is not encodable", x),
            }),
        },
        Value::String(s) => Ok(serde_json::Value::String(s.clone())),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_json(item)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Map(entries) => {
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                out.insert(k.clone(), to_json(v)?);
            }
            Ok(serde_json::Value::Object(out))
        }
    }
}

fn from_json(json: &serde_json::Value) -> BlobResult<Value> {
    match json {
        serde_json::Value::Null => Err(BlobError::Codec {
            message: "null is not a representable cache value".to_string(),
        }),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(x) = n.as_f64() {
                Ok(Value::Float(x))
            } else {
                Err(BlobError::Codec {
                    message: format!("number {} fits neither i64 nor f64", n),
                })
            }
        }
        serde_json::Value::String(s) => Ok(Value::String(s.clone())),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_json(item)?);
            }
            Ok(Value::List(out))
        }
        serde_json::Value::Object(entries) => {
            let mut out = BTreeMap::new();
            for (k, v) in entries {
                out.insert(k.clone(), from_json(v)?);
            }
            Ok(Value::Map(out))
        }
    }
}
