//! Column kinds, cell values and their byte encoding.
//!
//! Every cell is stored as the byte form of its column kind:
//! ```text
//! Integer / Reference ── i64 little-endian (8 bytes)
//! Float               ── f64 little-endian (8 bytes)
//! Timestamp           ── i64 µs since Unix epoch (8 bytes)
//! Boolean             ── 1 byte (0 | 1)
//! Text                ── UTF-8
//! Array               ── LZ4(size-prepended) ▸ bincode(NdArray)
//! ```
//!
//! Values are checked against the column kind before encoding.
//! There is no implicit coercion: an `Integer` is never written into
//! a `Float` column.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Storage kind of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnKind {
    Integer = 1,
    Float = 2,
    Text = 3,
    Boolean = 4,
    Timestamp = 5,
    /// Opaque n-dimensional numeric array
    Array = 6,
    /// Row id of another table (target kept in the column definition)
    Reference = 7,
}

impl ColumnKind {
    /// Kind a fresh column gets when it is created from a sample value.
    ///
    /// Integers infer `Integer`, never `Reference`. Null has no kind.
    pub fn infer(value: &Value) -> Option<Self> {
        value.kind()
    }

    /// Whether `value` may be stored in a column of this kind.
    pub fn accepts(self, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::Integer(_) => matches!(self, ColumnKind::Integer | ColumnKind::Reference),
            other => other.kind() == Some(self),
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Integer => "integer",
            ColumnKind::Float => "float",
            ColumnKind::Text => "text",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Timestamp => "timestamp",
            ColumnKind::Array => "array",
            ColumnKind::Reference => "reference",
        };
        f.write_str(name)
    }
}

/// Wall-clock instant with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self(d.as_micros() as i64),
            Err(e) => Self(-(e.duration().as_micros() as i64)),
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        if ts.0 >= 0 {
            UNIX_EPOCH + Duration::from_micros(ts.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_micros(ts.0.unsigned_abs())
        }
    }
}

/// Flat element storage of an [`NdArray`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Elements {
    Float(Vec<f64>),
    Integer(Vec<i64>),
}

impl Elements {
    pub fn len(&self) -> usize {
        match self {
            Elements::Float(v) => v.len(),
            Elements::Integer(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Row-major n-dimensional array (mesh positions, connectivity, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    shape: Vec<usize>,
    elements: Elements,
}

impl NdArray {
    /// Build an array, checking that the shape covers exactly the elements.
    pub fn new(shape: Vec<usize>, elements: Elements) -> Result<Self, CodecError> {
        let expected: usize = shape.iter().product();
        if expected != elements.len() {
            return Err(CodecError::InvalidShape {
                shape,
                len: elements.len(),
            });
        }
        Ok(Self { shape, elements })
    }

    pub fn from_f64(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, CodecError> {
        Self::new(shape, Elements::Float(data))
    }

    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Result<Self, CodecError> {
        Self::new(shape, Elements::Integer(data))
    }

    /// One-dimensional float array.
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            elements: Elements::Float(data),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn elements(&self) -> &Elements {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Float view of the elements, if the array holds floats.
    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.elements {
            Elements::Float(v) => Some(v),
            Elements::Integer(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.elements {
            Elements::Integer(v) => Some(v),
            Elements::Float(_) => None,
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Timestamp(Timestamp),
    Array(NdArray),
}

impl Value {
    /// Natural column kind of this value (None for Null).
    pub fn kind(&self) -> Option<ColumnKind> {
        match self {
            Value::Null => None,
            Value::Integer(_) => Some(ColumnKind::Integer),
            Value::Float(_) => Some(ColumnKind::Float),
            Value::Text(_) => Some(ColumnKind::Text),
            Value::Boolean(_) => Some(ColumnKind::Boolean),
            Value::Timestamp(_) => Some(ColumnKind::Timestamp),
            Value::Array(_) => Some(ColumnKind::Array),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Boolean(_) => "boolean",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
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

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::Array(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(NdArray::vector(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Cell encoding errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("expected a {expected} value, found {found}")]
    TypeMismatch {
        expected: ColumnKind,
        found: &'static str,
    },
    #[error("{kind} cell truncated ({len} bytes)")]
    Truncated { kind: ColumnKind, len: usize },
    #[error("text cell is not valid UTF-8")]
    InvalidUtf8,
    #[error("array decompression failed: {0}")]
    Compression(String),
    #[error("array serialization failed: {0}")]
    Serialization(String),
    #[error("shape {shape:?} does not cover {len} elements")]
    InvalidShape { shape: Vec<usize>, len: usize },
}

/// Encode `value` for a column of `kind`. Null encodes to `None`.
pub fn encode(kind: ColumnKind, value: &Value) -> Result<Option<Vec<u8>>, CodecError> {
    let bytes = match (kind, value) {
        (_, Value::Null) => return Ok(None),
        (ColumnKind::Integer | ColumnKind::Reference, Value::Integer(v)) => v.to_le_bytes().to_vec(),
        (ColumnKind::Float, Value::Float(v)) => v.to_le_bytes().to_vec(),
        (ColumnKind::Timestamp, Value::Timestamp(t)) => t.as_micros().to_le_bytes().to_vec(),
        (ColumnKind::Boolean, Value::Boolean(b)) => vec![u8::from(*b)],
        (ColumnKind::Text, Value::Text(s)) => s.as_bytes().to_vec(),
        (ColumnKind::Array, Value::Array(a)) => encode_array(a)?,
        (expected, found) => {
            return Err(CodecError::TypeMismatch {
                expected,
                found: found.type_name(),
            })
        }
    };
    Ok(Some(bytes))
}

/// Decode a cell written by [`encode`] for the same kind.
pub fn decode(kind: ColumnKind, bytes: &[u8]) -> Result<Value, CodecError> {
    match kind {
        ColumnKind::Integer | ColumnKind::Reference => {
            Ok(Value::Integer(i64::from_le_bytes(fixed8(kind, bytes)?)))
        }
        ColumnKind::Float => Ok(Value::Float(f64::from_le_bytes(fixed8(kind, bytes)?))),
        ColumnKind::Timestamp => Ok(Value::Timestamp(Timestamp::from_micros(
            i64::from_le_bytes(fixed8(kind, bytes)?),
        ))),
        ColumnKind::Boolean => match bytes {
            [b] => Ok(Value::Boolean(*b != 0)),
            _ => Err(CodecError::Truncated {
                kind,
                len: bytes.len(),
            }),
        },
        ColumnKind::Text => std::str::from_utf8(bytes)
            .map(|s| Value::Text(s.to_string()))
            .map_err(|_| CodecError::InvalidUtf8),
        ColumnKind::Array => decode_array(bytes).map(Value::Array),
    }
}

fn fixed8(kind: ColumnKind, bytes: &[u8]) -> Result<[u8; 8], CodecError> {
    bytes.try_into().map_err(|_| CodecError::Truncated {
        kind,
        len: bytes.len(),
    })
}

fn encode_array(array: &NdArray) -> Result<Vec<u8>, CodecError> {
    let raw = bincode::serde::encode_to_vec(array, bincode::config::standard())
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_array(bytes: &[u8]) -> Result<NdArray, CodecError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    let (array, _): (NdArray, _) =
        bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
    // Re-validate: the shape invariant is not carried by serde.
    NdArray::new(array.shape, array.elements)
}
