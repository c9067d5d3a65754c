//! Typed cache values and their flag bits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Payload went through the configured serializer.
pub const FLAG_SERIALIZED: u32 = 128;

/// Payload is compressed with the configured compressor.
pub const FLAG_COMPRESSED: u32 = 256;

/// Bits carrying the [`TypeTag`].
pub const TYPE_MASK: u32 = 127;

/// Runtime type of a stored value; the discriminant is its flag bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeTag {
    Str = 1,
    Int = 2,
    Float = 4,
    Bool = 8,
    Null = 16,
    Array = 32,
    Object = 64,
}

impl TypeTag {
    /// Decode the type bit of a flag word; `None` when no type bit is set.
    pub fn from_flags(flags: u32) -> Option<Self> {
        let bits = flags & TYPE_MASK;
        if bits == 0 {
            return None;
        }
        let tag = match 1 << bits.trailing_zeros() {
            1 => TypeTag::Str,
            2 => TypeTag::Int,
            4 => TypeTag::Float,
            8 => TypeTag::Bool,
            16 => TypeTag::Null,
            32 => TypeTag::Array,
            _ => TypeTag::Object,
        };
        Some(tag)
    }

    #[inline]
    pub fn bit(self) -> u32 {
        self as u32
    }

    /// Arrays and objects always go through the serializer.
    #[inline]
    pub fn is_structured(self) -> bool {
        matches!(self, TypeTag::Array | TypeTag::Object)
    }
}

/// A value as the application sees it.
///
/// ```
/// use memcache_client::{TypeTag, Value};
///
/// assert_eq!(Value::from("hi").tag(), TypeTag::Str);
/// assert_eq!(Value::from(42).tag(), TypeTag::Int);
/// assert_eq!(Value::from(vec![Value::Null]).tag(), TypeTag::Array);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Str(_) => TypeTag::Str,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Bool(_) => TypeTag::Bool,
            Value::Null => TypeTag::Null,
            Value::Array(_) => TypeTag::Array,
            Value::Object(_) => TypeTag::Object,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}
