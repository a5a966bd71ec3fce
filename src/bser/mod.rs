//! BSER, the binary serialization format spoken by watchman.
//!
//! BSER carries a JSON-superset data model: null, booleans, signed integers
//! up to 64 bits, IEEE-754 doubles, byte strings interpreted as UTF-8,
//! heterogeneous arrays, string-keyed objects, and a compact "template"
//! array-of-objects form. Every message on the wire is a PDU: the two header
//! bytes `00 01`, a BSER integer giving the payload length, then exactly one
//! value.
//!
//! Multi-byte fields use host byte order. The protocol is local-only and
//! declares the machine's native endianness on purpose.

pub mod accum;
pub mod decode;
pub mod encode;

use bytes::Bytes;

use self::accum::IntWidth;

pub use self::accum::{AccumError, Accumulator};
pub use self::decode::{DecodeError, StreamDecoder, from_slice};
pub use self::encode::{EncodeError, encode};

// =============================================================================
// Wire tags
// =============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    Array = 0x00,
    Object = 0x01,
    String = 0x02,
    Int8 = 0x03,
    Int16 = 0x04,
    Int32 = 0x05,
    Int64 = 0x06,
    Real = 0x07,
    True = 0x08,
    False = 0x09,
    Null = 0x0a,
    Template = 0x0b,
    Skip = 0x0c,
}

impl Tag {
    pub(crate) fn from_byte(byte: u8) -> Option<Tag> {
        Some(match byte {
            0x00 => Tag::Array,
            0x01 => Tag::Object,
            0x02 => Tag::String,
            0x03 => Tag::Int8,
            0x04 => Tag::Int16,
            0x05 => Tag::Int32,
            0x06 => Tag::Int64,
            0x07 => Tag::Real,
            0x08 => Tag::True,
            0x09 => Tag::False,
            0x0a => Tag::Null,
            0x0b => Tag::Template,
            0x0c => Tag::Skip,
            _ => return None,
        })
    }

    /// Payload width for the integer tags, None for everything else.
    pub(crate) fn int_width(self) -> Option<IntWidth> {
        match self {
            Tag::Int8 => Some(IntWidth::W1),
            Tag::Int16 => Some(IntWidth::W2),
            Tag::Int32 => Some(IntWidth::W4),
            Tag::Int64 => Some(IntWidth::W8),
            _ => None,
        }
    }
}

// =============================================================================
// Int64 carrier
// =============================================================================

/// Carrier for integers that must ride the wire as INT64.
///
/// A plain [`Value::Integer`] is encoded with the smallest tag whose range
/// contains it; wrapping the same number in `Int64` pins the 8-byte encoding
/// so a value that originated as INT64 round-trips at full width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Int64(i64);

impl Int64 {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub fn to_i32(self) -> Option<i32> {
        i32::try_from(self.0).ok()
    }

    pub fn to_i16(self) -> Option<i16> {
        i16::try_from(self.0).ok()
    }

    pub fn to_i8(self) -> Option<i8> {
        i8::try_from(self.0).ok()
    }
}

impl From<i64> for Int64 {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// =============================================================================
// Object
// =============================================================================

/// String-keyed object that preserves insertion order.
///
/// Watchman responses are small, so lookup is a linear scan over the pair
/// list; preserving decode order matters more than lookup cost here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    entries: Vec<(Bytes, Value)>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, key: impl Into<Bytes>, value: impl Into<Value>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_ref() == key.as_bytes())
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl<K: Into<Bytes>, V: Into<Value>> FromIterator<(K, V)> for Object {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// =============================================================================
// Value
// =============================================================================

/// One BSER value.
///
/// Strings are owned byte sequences interpreted as UTF-8 but not required to
/// be well-formed; watchman reports file names verbatim. `Undefined` is the
/// erasure marker: an object property holding it is omitted on encode, and it
/// is not encodable anywhere else.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    Integer(i64),
    Int64(Int64),
    Real(f64),
    String(Bytes),
    Array(Vec<Value>),
    Object(Object),
}

impl Value {
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            Value::Int64(value) => Some(value.get()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The name of this value's kind, used in encode error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Int64(_) => "int64",
            Value::Real(_) => "real",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

/// Numeric kinds compare by value: `Integer(5)`, `Int64(5)` and `Real(5.0)`
/// all denote the same number, and the encoder is free to narrow between
/// them, so equality must not depend on which carrier a number arrived in.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) | (Undefined, Undefined) => true,
            (Bool(a), Bool(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Int64(a), Int64(b)) => a == b,
            (Integer(a), Int64(b)) | (Int64(b), Integer(a)) => *a == b.get(),
            (Real(a), Real(b)) => a == b,
            (Integer(a), Real(b)) | (Real(b), Integer(a)) => *b == *a as f64,
            (Int64(a), Real(b)) | (Real(b), Int64(a)) => *b == a.get() as f64,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<Int64> for Value {
    fn from(value: Int64) -> Self {
        Value::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(Bytes::from(value.into_bytes()))
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<Object> for Value {
    fn from(value: Object) -> Self {
        Value::Object(value)
    }
}
