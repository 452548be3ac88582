//! Value persistence and exchange with external systems
//!
//! `TypedValue` is a serde mirror of the plain-data subset of [`Value`]:
//! scalars, vectors, strings, bytes, containers, media buffers, and enums.
//! Live handles (wires, shards, opaque objects) and unresolved context
//! references have no meaning outside the process and refuse to serialize.
//!
//! The wire format is bincode; round-trips are lossless for every
//! supported variant.

use crate::value::{ArrayVar, SetKey, Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use weft_core::{Audio, Color, FloatVec2, FloatVec3, FloatVec4, Image, IntVec16, IntVec2, IntVec3, IntVec4, IntVec8};

#[derive(Debug, Clone, PartialEq)]
pub enum SerializeError {
    /// The value carries a live handle that cannot leave the process.
    UnsupportedType(ValueKind),
    /// The byte stream did not decode.
    Malformed(String),
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializeError::UnsupportedType(kind) => {
                write!(f, "cannot serialize values of type {kind}")
            }
            SerializeError::Malformed(msg) => write!(f, "malformed value bytes: {msg}"),
        }
    }
}

impl std::error::Error for SerializeError {}

/// The serializable subset of [`Value`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TypedValue {
    None,
    Any,
    Bool(bool),
    Int(i64),
    Int2(IntVec2),
    Int3(IntVec3),
    Int4(IntVec4),
    Int8(IntVec8),
    Int16(IntVec16),
    Float(f64),
    Float2(FloatVec2),
    Float3(FloatVec3),
    Float4(FloatVec4),
    Color(Color),
    String(String),
    Path(String),
    Bytes(Vec<u8>),
    Seq(Vec<TypedValue>),
    Table(HashMap<String, TypedValue>),
    Set(Vec<TypedValue>),
    Array { inner: u8, data: Vec<u8> },
    Image(Image),
    Audio(Audio),
    Enum { vendor_id: i32, type_id: i32, value: i32 },
}

impl TryFrom<&Value> for TypedValue {
    type Error = SerializeError;

    fn try_from(value: &Value) -> Result<TypedValue, SerializeError> {
        Ok(match value {
            Value::None => TypedValue::None,
            Value::Any => TypedValue::Any,
            Value::Bool(v) => TypedValue::Bool(*v),
            Value::Int(v) => TypedValue::Int(*v),
            Value::Int2(v) => TypedValue::Int2(*v),
            Value::Int3(v) => TypedValue::Int3(*v),
            Value::Int4(v) => TypedValue::Int4(*v),
            Value::Int8(v) => TypedValue::Int8(*v),
            Value::Int16(v) => TypedValue::Int16(*v),
            Value::Float(v) => TypedValue::Float(*v),
            Value::Float2(v) => TypedValue::Float2(*v),
            Value::Float3(v) => TypedValue::Float3(*v),
            Value::Float4(v) => TypedValue::Float4(*v),
            Value::Color(v) => TypedValue::Color(*v),
            Value::String(s) => TypedValue::String(s.to_string()),
            Value::Path(s) => TypedValue::Path(s.to_string()),
            Value::Bytes(b) => TypedValue::Bytes(b.to_vec()),
            Value::Seq(items) => TypedValue::Seq(
                items.iter().map(TypedValue::try_from).collect::<Result<_, _>>()?,
            ),
            Value::Table(map) => {
                let mut out = HashMap::with_capacity(map.len());
                for (k, v) in map.iter() {
                    out.insert(k.clone(), TypedValue::try_from(v)?);
                }
                TypedValue::Table(out)
            }
            Value::Set(set) => TypedValue::Set(
                set.iter().map(|k| TypedValue::try_from(&k.0)).collect::<Result<_, _>>()?,
            ),
            Value::Array(a) => {
                TypedValue::Array { inner: a.inner as u8, data: a.bytes().to_vec() }
            }
            Value::Image(img) => TypedValue::Image((**img).clone()),
            Value::Audio(a) => TypedValue::Audio((**a).clone()),
            Value::Enum { vendor_id, type_id, value } => {
                TypedValue::Enum { vendor_id: *vendor_id, type_id: *type_id, value: *value }
            }
            other @ (Value::ContextVar(_)
            | Value::Object(_)
            | Value::Wire(_)
            | Value::ShardRef(_)) => {
                return Err(SerializeError::UnsupportedType(other.kind()))
            }
        })
    }
}

impl From<TypedValue> for Value {
    fn from(value: TypedValue) -> Value {
        match value {
            TypedValue::None => Value::None,
            TypedValue::Any => Value::Any,
            TypedValue::Bool(v) => Value::Bool(v),
            TypedValue::Int(v) => Value::Int(v),
            TypedValue::Int2(v) => Value::Int2(v),
            TypedValue::Int3(v) => Value::Int3(v),
            TypedValue::Int4(v) => Value::Int4(v),
            TypedValue::Int8(v) => Value::Int8(v),
            TypedValue::Int16(v) => Value::Int16(v),
            TypedValue::Float(v) => Value::Float(v),
            TypedValue::Float2(v) => Value::Float2(v),
            TypedValue::Float3(v) => Value::Float3(v),
            TypedValue::Float4(v) => Value::Float4(v),
            TypedValue::Color(v) => Value::Color(v),
            TypedValue::String(s) => Value::string(s),
            TypedValue::Path(s) => Value::Path(Arc::from(s.as_str())),
            TypedValue::Bytes(b) => Value::bytes(b),
            TypedValue::Seq(items) => Value::Seq(items.into_iter().map(Value::from).collect()),
            TypedValue::Table(map) => {
                let mut out = Value::table();
                for (k, v) in map {
                    // key collisions are impossible coming from a map
                    let _ = out.table_insert(k, Value::from(v));
                }
                out
            }
            TypedValue::Set(items) => {
                let set = items.into_iter().map(|v| SetKey(Value::from(v))).collect();
                Value::Set(Box::new(set))
            }
            TypedValue::Array { inner, data } => {
                Value::Array(ArrayVar::from_raw(array_kind(inner), data))
            }
            TypedValue::Image(img) => Value::Image(Arc::new(img)),
            TypedValue::Audio(a) => Value::Audio(Arc::new(a)),
            TypedValue::Enum { vendor_id, type_id, value } => {
                Value::Enum { vendor_id, type_id, value }
            }
        }
    }
}

fn array_kind(tag: u8) -> ValueKind {
    match tag {
        x if x == ValueKind::Float as u8 => ValueKind::Float,
        x if x == ValueKind::Bool as u8 => ValueKind::Bool,
        x if x == ValueKind::Int2 as u8 => ValueKind::Int2,
        x if x == ValueKind::Float2 as u8 => ValueKind::Float2,
        x if x == ValueKind::Color as u8 => ValueKind::Color,
        _ => ValueKind::Int,
    }
}

/// Serialize a plain-data value to bytes.
pub fn value_to_bytes(value: &Value) -> Result<Vec<u8>, SerializeError> {
    let typed = TypedValue::try_from(value)?;
    bincode::serialize(&typed).map_err(|e| SerializeError::Malformed(e.to_string()))
}

/// Deserialize bytes produced by [`value_to_bytes`].
pub fn value_from_bytes(bytes: &[u8]) -> Result<Value, SerializeError> {
    let typed: TypedValue =
        bincode::deserialize(bytes).map_err(|e| SerializeError::Malformed(e.to_string()))?;
    Ok(Value::from(typed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) -> Value {
        value_from_bytes(&value_to_bytes(&v).unwrap()).unwrap()
    }

    #[test]
    fn test_scalar_roundtrip() {
        assert_eq!(roundtrip(Value::None), Value::None);
        assert_eq!(roundtrip(Value::Int(-7)), Value::Int(-7));
        assert_eq!(roundtrip(Value::Float(2.5)), Value::Float(2.5));
        assert_eq!(roundtrip(Value::string("weft")), Value::string("weft"));
        assert_eq!(roundtrip(Value::bytes([1u8, 2, 3])), Value::bytes([1u8, 2, 3]));
    }

    #[test]
    fn test_container_roundtrip() {
        let mut table = Value::table();
        table.table_insert("xs", Value::seq(vec![Value::Int(1), Value::Int(2)])).unwrap();
        table.table_insert("flag", Value::Bool(true)).unwrap();
        let back = roundtrip(table.clone());
        assert_eq!(back, table);
        assert_eq!(back.hash128(), table.hash128());
    }

    #[test]
    fn test_vector_and_media_roundtrip() {
        let img = Value::Image(Arc::new(Image::new(2, 1, 4, 0, vec![0u8; 8])));
        assert_eq!(roundtrip(img.clone()), img);

        let vec = Value::Int2(IntVec2::new([i64::MIN, i64::MAX]));
        assert_eq!(roundtrip(vec.clone()), vec);
    }

    #[test]
    fn test_live_handles_refuse_to_serialize() {
        let wire = Value::Wire(crate::wire::Wire::new("w"));
        match value_to_bytes(&wire) {
            Err(SerializeError::UnsupportedType(ValueKind::Wire)) => {}
            other => panic!("expected UnsupportedType(Wire), got {other:?}"),
        }
        assert!(value_to_bytes(&Value::context_var("x")).is_err());
    }

    #[test]
    fn test_malformed_bytes() {
        assert!(matches!(value_from_bytes(&[0xff; 3]), Err(SerializeError::Malformed(_))));
    }
}
