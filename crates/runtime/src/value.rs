//! Value: what wires talk about
//!
//! A `Value` is the polymorphic unit that travels from shard to shard. It is
//! a tagged union over scalars, fixed-width vectors, strings, containers,
//! media buffers, and references to wires and shards.
//!
//! # Ownership
//!
//! Deep ownership follows Rust: containers own their elements, `Clone` is
//! the deep copy, `Drop` is destroy. Immutable payloads (strings, bytes,
//! images, audio) sit behind `Arc`, so cloning them is a refcount bump and
//! host-injected buffers are never freed by the runtime while the host still
//! holds its own reference.
//!
//! # Equality and ordering
//!
//! Equality is value-semantic and never crosses tags. Floats (and float
//! vector lanes) compare with a single-precision-epsilon tolerance.
//! Ordering is total for numerics, strings, bytes, and blittable arrays,
//! recursive-lexicographic for sequences and tables, and `Undefined` for
//! everything else; callers building a total order must filter `Undefined`.

use crate::shard::Shard;
use crate::wire::Wire;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use weft_core::hash::Hash128;
use weft_core::vectors::FLOAT_EPSILON;
use weft_core::{
    Audio, Color, FloatVec2, FloatVec3, FloatVec4, Image, IntVec16, IntVec2, IntVec3, IntVec4,
    IntVec8,
};

/// The tag of a [`Value`]. Discriminants are stable: they feed content
/// hashing and must not be reordered.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    None = 0,
    Any = 1,
    Enum = 2,
    Bool = 3,
    Int = 4,
    Int2 = 5,
    Int3 = 6,
    Int4 = 7,
    Int8 = 8,
    Int16 = 9,
    Float = 10,
    Float2 = 11,
    Float3 = 12,
    Float4 = 13,
    Color = 14,
    ShardRef = 15,
    Bytes = 51,
    String = 52,
    Path = 53,
    ContextVar = 54,
    Image = 55,
    Seq = 56,
    Table = 57,
    Wire = 58,
    Object = 59,
    Array = 60,
    Set = 61,
    Audio = 62,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Hook set for opaque host objects carried inside values. The optional
/// methods mirror the object vtable hosts can register: content hashing and
/// byte serialization; identity is the fallback for both.
pub trait ObjectPayload: std::any::Any + Send + Sync {
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn std::any::Any;

    /// Stable content hash, if the object can provide one.
    fn content_hash(&self) -> Option<u128> {
        None
    }

    /// Byte serialization, if the object supports it.
    fn serialize(&self) -> Option<Vec<u8>> {
        None
    }
}

/// An opaque host object: `(vendor_id, type_id)` plus a shared payload.
#[derive(Clone)]
pub struct ObjectVar {
    pub vendor_id: i32,
    pub type_id: i32,
    pub payload: Arc<dyn ObjectPayload>,
}

impl ObjectVar {
    pub fn new(vendor_id: i32, type_id: i32, payload: Arc<dyn ObjectPayload>) -> Self {
        Self { vendor_id, type_id, payload }
    }
}

impl fmt::Debug for ObjectVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectVar")
            .field("vendor_id", &self.vendor_id)
            .field("type_id", &self.type_id)
            .field("payload", &self.payload.type_name())
            .finish()
    }
}

// Objects compare by payload identity unless both sides hash their content.
impl PartialEq for ObjectVar {
    fn eq(&self, other: &Self) -> bool {
        if self.vendor_id != other.vendor_id || self.type_id != other.type_id {
            return false;
        }
        match (self.payload.content_hash(), other.payload.content_hash()) {
            (Some(a), Some(b)) => a == b,
            _ => Arc::ptr_eq(&self.payload, &other.payload),
        }
    }
}

/// A shared reference to a single shard instance.
#[derive(Clone)]
pub struct ShardVar(pub Arc<Mutex<Box<dyn Shard>>>);

impl ShardVar {
    pub fn new(shard: Box<dyn Shard>) -> Self {
        Self(Arc::new(Mutex::new(shard)))
    }

    pub fn shard_name(&self) -> &'static str {
        self.0.lock().expect("shard lock poisoned").name()
    }
}

impl fmt::Debug for ShardVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardVar({})", self.shard_name())
    }
}

impl PartialEq for ShardVar {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Homogeneous blittable array: an inner tag plus one packed byte span.
/// Cloning copies the span in a single memcpy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayVar {
    pub inner: ValueKind,
    data: Vec<u8>,
}

impl ArrayVar {
    pub fn new(inner: ValueKind) -> Self {
        Self { inner, data: Vec::new() }
    }

    pub fn from_ints(values: &[i64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self { inner: ValueKind::Int, data }
    }

    /// Rebuild from a raw packed span, as produced by [`ArrayVar::bytes`].
    pub fn from_raw(inner: ValueKind, data: Vec<u8>) -> Self {
        Self { inner, data }
    }

    pub fn from_floats(values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Self { inner: ValueKind::Float, data }
    }

    pub fn as_ints(&self) -> Vec<i64> {
        self.data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().expect("chunk is 8 bytes")))
            .collect()
    }

    pub fn as_floats(&self) -> Vec<f64> {
        self.data
            .chunks_exact(8)
            .map(|c| f64::from_bits(u64::from_le_bytes(c.try_into().expect("chunk is 8 bytes"))))
            .collect()
    }

    pub fn stride(&self) -> usize {
        match self.inner {
            ValueKind::Int | ValueKind::Float => 8,
            ValueKind::Int2 | ValueKind::Float2 => 16,
            ValueKind::Color => 4,
            ValueKind::Bool => 1,
            _ => 8,
        }
    }

    pub fn len(&self) -> usize {
        if self.stride() == 0 {
            0
        } else {
            self.data.len() / self.stride()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Exact-equality wrapper so values can live in hashed sets. Floats compare
/// and hash by bit pattern here; the epsilon rule applies only to direct
/// value comparison, never to set membership.
#[derive(Debug, Clone)]
pub struct SetKey(pub Value);

impl PartialEq for SetKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.hash128() == other.0.hash128()
    }
}

impl Eq for SetKey {}

impl std::hash::Hash for SetKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u128(self.0.hash128());
    }
}

/// Result of a value comparison. `Undefined` marks pairs that have no
/// meaningful order (mixed tags, objects, media buffers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrder {
    Less,
    Equal,
    Greater,
    Undefined,
}

impl ValueOrder {
    fn from_ord(o: std::cmp::Ordering) -> Self {
        match o {
            std::cmp::Ordering::Less => ValueOrder::Less,
            std::cmp::Ordering::Equal => ValueOrder::Equal,
            std::cmp::Ordering::Greater => ValueOrder::Greater,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
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
    String(Arc<str>),
    Path(Arc<str>),
    /// A label resolved against context variables at warmup.
    ContextVar(Arc<str>),
    Bytes(Arc<[u8]>),
    Seq(Vec<Value>),
    Table(Box<HashMap<String, Value>>),
    Set(Box<HashSet<SetKey>>),
    Array(ArrayVar),
    Image(Arc<Image>),
    Audio(Arc<Audio>),
    Enum {
        vendor_id: i32,
        type_id: i32,
        value: i32,
    },
    Object(ObjectVar),
    Wire(Wire),
    ShardRef(ShardVar),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::None => ValueKind::None,
            Value::Any => ValueKind::Any,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Int2(_) => ValueKind::Int2,
            Value::Int3(_) => ValueKind::Int3,
            Value::Int4(_) => ValueKind::Int4,
            Value::Int8(_) => ValueKind::Int8,
            Value::Int16(_) => ValueKind::Int16,
            Value::Float(_) => ValueKind::Float,
            Value::Float2(_) => ValueKind::Float2,
            Value::Float3(_) => ValueKind::Float3,
            Value::Float4(_) => ValueKind::Float4,
            Value::Color(_) => ValueKind::Color,
            Value::String(_) => ValueKind::String,
            Value::Path(_) => ValueKind::Path,
            Value::ContextVar(_) => ValueKind::ContextVar,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Seq(_) => ValueKind::Seq,
            Value::Table(_) => ValueKind::Table,
            Value::Set(_) => ValueKind::Set,
            Value::Array(_) => ValueKind::Array,
            Value::Image(_) => ValueKind::Image,
            Value::Audio(_) => ValueKind::Audio,
            Value::Enum { .. } => ValueKind::Enum,
            Value::Object(_) => ValueKind::Object,
            Value::Wire(_) => ValueKind::Wire,
            Value::ShardRef(_) => ValueKind::ShardRef,
        }
    }

    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(Arc::from(s.as_ref()))
    }

    pub fn context_var(name: impl AsRef<str>) -> Value {
        Value::ContextVar(Arc::from(name.as_ref()))
    }

    pub fn bytes(b: impl AsRef<[u8]>) -> Value {
        Value::Bytes(Arc::from(b.as_ref()))
    }

    pub fn seq(items: impl Into<Vec<Value>>) -> Value {
        Value::Seq(items.into())
    }

    pub fn table() -> Value {
        Value::Table(Box::default())
    }

    pub fn set() -> Value {
        Value::Set(Box::default())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Path(s) | Value::ContextVar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> Option<&Wire> {
        match self {
            Value::Wire(w) => Some(w),
            _ => None,
        }
    }

    /// Three-way comparison per the ordering rules in the module docs.
    pub fn compare(&self, other: &Value) -> ValueOrder {
        use ValueOrder::*;
        if self.kind() != other.kind() {
            return Undefined;
        }
        match (self, other) {
            (Value::None, Value::None) | (Value::Any, Value::Any) => Equal,
            (Value::Bool(a), Value::Bool(b)) => ValueOrder::from_ord(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => ValueOrder::from_ord(a.cmp(b)),
            (Value::Int2(a), Value::Int2(b)) => ValueOrder::from_ord(a.cmp(b)),
            (Value::Int3(a), Value::Int3(b)) => ValueOrder::from_ord(a.cmp(b)),
            (Value::Int4(a), Value::Int4(b)) => ValueOrder::from_ord(a.cmp(b)),
            (Value::Int8(a), Value::Int8(b)) => ValueOrder::from_ord(a.cmp(b)),
            (Value::Int16(a), Value::Int16(b)) => ValueOrder::from_ord(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => {
                if (a - b).abs() <= FLOAT_EPSILON {
                    Equal
                } else {
                    a.partial_cmp(b).map(ValueOrder::from_ord).unwrap_or(Undefined)
                }
            }
            (Value::Float2(a), Value::Float2(b)) => {
                a.partial_cmp(b).map(ValueOrder::from_ord).unwrap_or(Undefined)
            }
            (Value::Float3(a), Value::Float3(b)) => {
                a.partial_cmp(b).map(ValueOrder::from_ord).unwrap_or(Undefined)
            }
            (Value::Float4(a), Value::Float4(b)) => {
                a.partial_cmp(b).map(ValueOrder::from_ord).unwrap_or(Undefined)
            }
            (Value::Color(a), Value::Color(b)) => ValueOrder::from_ord(a.cmp(b)),
            (Value::String(a), Value::String(b))
            | (Value::Path(a), Value::Path(b))
            | (Value::ContextVar(a), Value::ContextVar(b)) => {
                ValueOrder::from_ord(a.as_bytes().cmp(b.as_bytes()))
            }
            (Value::Bytes(a), Value::Bytes(b)) => ValueOrder::from_ord(a.cmp(b)),
            (Value::Array(a), Value::Array(b)) => {
                if a.inner != b.inner {
                    Undefined
                } else {
                    ValueOrder::from_ord(a.bytes().cmp(b.bytes()))
                }
            }
            (Value::Enum { vendor_id: va, type_id: ta, value: a },
             Value::Enum { vendor_id: vb, type_id: tb, value: b }) => {
                if va != vb || ta != tb {
                    Undefined
                } else {
                    ValueOrder::from_ord(a.cmp(b))
                }
            }
            (Value::Seq(a), Value::Seq(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y) {
                        Equal => continue,
                        other => return other,
                    }
                }
                ValueOrder::from_ord(a.len().cmp(&b.len()))
            }
            (Value::Table(a), Value::Table(b)) => {
                // recursive lex compare over key-sorted entries
                let mut ka: Vec<&String> = a.keys().collect();
                let mut kb: Vec<&String> = b.keys().collect();
                ka.sort();
                kb.sort();
                for (x, y) in ka.iter().zip(kb.iter()) {
                    match x.cmp(y) {
                        std::cmp::Ordering::Equal => {}
                        o => return ValueOrder::from_ord(o),
                    }
                    match a[*x].compare(&b[*y]) {
                        Equal => continue,
                        other => return other,
                    }
                }
                ValueOrder::from_ord(ka.len().cmp(&kb.len()))
            }
            _ => Undefined,
        }
    }

    /// Deterministic 128-bit content hash. Order-sensitive for sequences and
    /// arrays; tables and sets fold element hashes in sorted order so
    /// iteration order never leaks into the digest.
    pub fn hash128(&self) -> u128 {
        let mut h = Hash128::new();
        self.hash_into(&mut h);
        h.finish128()
    }

    fn hash_into(&self, h: &mut Hash128) {
        h.update_tag(self.kind() as u8);
        match self {
            Value::None | Value::Any => {}
            Value::Bool(v) => h.update_u8(*v as u8),
            Value::Int(v) => h.update_i64(*v),
            Value::Int2(v) => {
                for lane in v.0 {
                    h.update_i64(lane);
                }
            }
            Value::Int3(v) => {
                for lane in v.0 {
                    h.update_i64(lane as i64);
                }
            }
            Value::Int4(v) => {
                for lane in v.0 {
                    h.update_i64(lane as i64);
                }
            }
            Value::Int8(v) => {
                for lane in v.0 {
                    h.update_i64(lane as i64);
                }
            }
            Value::Int16(v) => {
                for lane in v.0 {
                    h.update_i64(lane as i64);
                }
            }
            Value::Float(v) => h.update_f64(*v),
            Value::Float2(v) => {
                for bits in v.to_bits() {
                    h.update_u64(bits);
                }
            }
            Value::Float3(v) => {
                for bits in v.to_bits() {
                    h.update_u64(bits);
                }
            }
            Value::Float4(v) => {
                for bits in v.to_bits() {
                    h.update_u64(bits);
                }
            }
            Value::Color(c) => h.update_bytes(&c.to_array()),
            Value::String(s) | Value::Path(s) | Value::ContextVar(s) => {
                h.update_bytes(s.as_bytes())
            }
            Value::Bytes(b) => h.update_bytes(b),
            Value::Seq(items) => {
                h.update_u64(items.len() as u64);
                for item in items {
                    item.hash_into(h);
                }
            }
            Value::Table(map) => {
                let mut entries: Vec<u128> = map
                    .iter()
                    .map(|(k, v)| {
                        let mut eh = Hash128::new();
                        eh.update_bytes(k.as_bytes());
                        v.hash_into(&mut eh);
                        eh.finish128()
                    })
                    .collect();
                entries.sort_unstable();
                h.update_u64(entries.len() as u64);
                for e in entries {
                    h.update_hash(e);
                }
            }
            Value::Set(set) => {
                let mut entries: Vec<u128> = set.iter().map(|k| k.0.hash128()).collect();
                entries.sort_unstable();
                h.update_u64(entries.len() as u64);
                for e in entries {
                    h.update_hash(e);
                }
            }
            Value::Array(a) => {
                h.update_tag(a.inner as u8);
                h.update_bytes(a.bytes());
            }
            Value::Image(img) => {
                h.update_u64(img.width as u64);
                h.update_u64(img.height as u64);
                h.update_u8(img.channels);
                h.update_u8(img.flags);
                h.update_bytes(&img.data);
            }
            Value::Audio(a) => {
                h.update_u32(a.sample_rate);
                h.update_u64(a.frame_count as u64);
                h.update_u64(a.channels as u64);
                for s in &a.samples {
                    h.update_u32(s.to_bits());
                }
            }
            Value::Enum { vendor_id, type_id, value } => {
                h.update_u32(*vendor_id as u32);
                h.update_u32(*type_id as u32);
                h.update_u32(*value as u32);
            }
            Value::Object(o) => {
                h.update_u32(o.vendor_id as u32);
                h.update_u32(o.type_id as u32);
                if let Some(ch) = o.payload.content_hash() {
                    h.update_hash(ch);
                }
            }
            Value::Wire(w) => h.update_bytes(w.name().as_bytes()),
            Value::ShardRef(s) => h.update_bytes(s.shard_name().as_bytes()),
        }
    }

    // ---- sequence operations ----

    pub fn seq_push(&mut self, v: Value) -> crate::error::Result<()> {
        match self {
            Value::Seq(items) => {
                items.push(v);
                Ok(())
            }
            other => Err(not_a("Seq", other)),
        }
    }

    pub fn seq_pop(&mut self) -> crate::error::Result<Option<Value>> {
        match self {
            Value::Seq(items) => Ok(items.pop()),
            other => Err(not_a("Seq", other)),
        }
    }

    pub fn seq_insert(&mut self, index: usize, v: Value) -> crate::error::Result<()> {
        match self {
            Value::Seq(items) => {
                if index > items.len() {
                    return Err(crate::error::RuntimeError::invalid_var_type(format!(
                        "seq insert out of range: {index} > {}",
                        items.len()
                    )));
                }
                items.insert(index, v);
                Ok(())
            }
            other => Err(not_a("Seq", other)),
        }
    }

    pub fn seq_remove(&mut self, index: usize) -> crate::error::Result<Value> {
        match self {
            Value::Seq(items) => {
                if index >= items.len() {
                    return Err(crate::error::RuntimeError::invalid_var_type(format!(
                        "seq remove out of range: {index} >= {}",
                        items.len()
                    )));
                }
                Ok(items.remove(index))
            }
            other => Err(not_a("Seq", other)),
        }
    }

    pub fn seq_resize(&mut self, len: usize) -> crate::error::Result<()> {
        match self {
            Value::Seq(items) => {
                items.resize(len, Value::None);
                Ok(())
            }
            other => Err(not_a("Seq", other)),
        }
    }

    // ---- table operations ----

    pub fn table_insert(&mut self, key: impl Into<String>, v: Value) -> crate::error::Result<()> {
        match self {
            Value::Table(map) => {
                map.insert(key.into(), v);
                Ok(())
            }
            other => Err(not_a("Table", other)),
        }
    }

    pub fn table_get(&self, key: &str) -> crate::error::Result<Option<&Value>> {
        match self {
            Value::Table(map) => Ok(map.get(key)),
            other => Err(not_a("Table", other)),
        }
    }

    pub fn table_contains(&self, key: &str) -> crate::error::Result<bool> {
        match self {
            Value::Table(map) => Ok(map.contains_key(key)),
            other => Err(not_a("Table", other)),
        }
    }

    pub fn table_remove(&mut self, key: &str) -> crate::error::Result<Option<Value>> {
        match self {
            Value::Table(map) => Ok(map.remove(key)),
            other => Err(not_a("Table", other)),
        }
    }

    pub fn table_clear(&mut self) -> crate::error::Result<()> {
        match self {
            Value::Table(map) => {
                map.clear();
                Ok(())
            }
            other => Err(not_a("Table", other)),
        }
    }

    pub fn table_iter(&self) -> crate::error::Result<impl Iterator<Item = (&String, &Value)>> {
        match self {
            Value::Table(map) => Ok(map.iter()),
            other => Err(not_a("Table", other)),
        }
    }

    // ---- set operations ----

    /// Returns true when the value was newly added.
    pub fn set_include(&mut self, v: Value) -> crate::error::Result<bool> {
        match self {
            Value::Set(set) => Ok(set.insert(SetKey(v))),
            other => Err(not_a("Set", other)),
        }
    }

    /// Returns true when the value was present and removed.
    pub fn set_exclude(&mut self, v: &Value) -> crate::error::Result<bool> {
        match self {
            Value::Set(set) => Ok(set.remove(&SetKey(v.clone()))),
            other => Err(not_a("Set", other)),
        }
    }

    pub fn set_contains(&self, v: &Value) -> crate::error::Result<bool> {
        match self {
            Value::Set(set) => Ok(set.contains(&SetKey(v.clone()))),
            other => Err(not_a("Set", other)),
        }
    }

    pub fn set_clear(&mut self) -> crate::error::Result<()> {
        match self {
            Value::Set(set) => {
                set.clear();
                Ok(())
            }
            other => Err(not_a("Set", other)),
        }
    }

    pub fn set_iter(&self) -> crate::error::Result<impl Iterator<Item = &Value>> {
        match self {
            Value::Set(set) => Ok(set.iter().map(|k| &k.0)),
            other => Err(not_a("Set", other)),
        }
    }
}

fn not_a(wanted: &str, got: &Value) -> crate::error::RuntimeError {
    crate::error::RuntimeError::invalid_var_type(format!("expected {wanted}, got {}", got.kind()))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.kind() != other.kind() {
            return false;
        }
        match (self, other) {
            (Value::None, Value::None) | (Value::Any, Value::Any) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int2(a), Value::Int2(b)) => a == b,
            (Value::Int3(a), Value::Int3(b)) => a == b,
            (Value::Int4(a), Value::Int4(b)) => a == b,
            (Value::Int8(a), Value::Int8(b)) => a == b,
            (Value::Int16(a), Value::Int16(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => (a - b).abs() <= FLOAT_EPSILON,
            (Value::Float2(a), Value::Float2(b)) => a == b,
            (Value::Float3(a), Value::Float3(b)) => a == b,
            (Value::Float4(a), Value::Float4(b)) => a == b,
            (Value::Color(a), Value::Color(b)) => a == b,
            (Value::String(a), Value::String(b))
            | (Value::Path(a), Value::Path(b))
            | (Value::ContextVar(a), Value::ContextVar(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Image(a), Value::Image(b)) => a == b,
            (Value::Audio(a), Value::Audio(b)) => a == b,
            (Value::Enum { vendor_id: va, type_id: ta, value: a },
             Value::Enum { vendor_id: vb, type_id: tb, value: b }) => {
                va == vb && ta == tb && a == b
            }
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Wire(a), Value::Wire(b)) => a.same_wire(b),
            (Value::ShardRef(a), Value::ShardRef(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_tag_is_unequal_and_unordered() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Int(1).compare(&Value::Float(1.0)), ValueOrder::Undefined);
    }

    #[test]
    fn test_float_epsilon_equality() {
        let a = Value::Float(1.0);
        let b = Value::Float(1.0 + FLOAT_EPSILON / 2.0);
        assert_eq!(a, b);
        let c = Value::Float(1.0 + 1.0e-3);
        assert_ne!(a, c);
        assert_eq!(a.compare(&c), ValueOrder::Less);
    }

    #[test]
    fn test_vector_ordering() {
        let a = Value::Int2(IntVec2::new([1, 5]));
        let b = Value::Int2(IntVec2::new([1, 9]));
        assert_eq!(a.compare(&b), ValueOrder::Less);
        assert_eq!(b.compare(&a), ValueOrder::Greater);
        assert_eq!(a.compare(&a.clone()), ValueOrder::Equal);
    }

    #[test]
    fn test_seq_recursive_lex_compare() {
        let a = Value::seq(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::seq(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(a.compare(&b), ValueOrder::Less);

        // shorter prefix orders first
        let c = Value::seq(vec![Value::Int(1)]);
        assert_eq!(c.compare(&a), ValueOrder::Less);

        // heterogeneous shapes have no order
        let d = Value::seq(vec![Value::string("x")]);
        assert_eq!(a.compare(&d), ValueOrder::Undefined);
    }

    #[test]
    fn test_equal_implies_hash_equal() {
        let mut t1 = Value::table();
        t1.table_insert("a", Value::Int(1)).unwrap();
        t1.table_insert("b", Value::seq(vec![Value::string("x")])).unwrap();
        let mut t2 = Value::table();
        // reversed insertion order
        t2.table_insert("b", Value::seq(vec![Value::string("x")])).unwrap();
        t2.table_insert("a", Value::Int(1)).unwrap();
        assert_eq!(t1, t2);
        assert_eq!(t1.hash128(), t2.hash128());
    }

    #[test]
    fn test_hash_is_order_sensitive_for_seq() {
        let a = Value::seq(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::seq(vec![Value::Int(2), Value::Int(1)]);
        assert_ne!(a.hash128(), b.hash128());
    }

    #[test]
    fn test_hash_crosses_tags() {
        assert_ne!(Value::Int(0).hash128(), Value::Float(0.0).hash128());
        assert_ne!(Value::None.hash128(), Value::Any.hash128());
    }

    #[test]
    fn test_clone_leaves_source_unchanged() {
        let mut original = Value::table();
        original.table_insert("k", Value::seq(vec![Value::Int(7)])).unwrap();
        let snapshot = original.hash128();
        {
            let mut copy = original.clone();
            copy.table_insert("k", Value::Int(0)).unwrap();
            copy.table_insert("extra", Value::None).unwrap();
        }
        assert_eq!(original.hash128(), snapshot);
    }

    #[test]
    fn test_set_membership_is_exact() {
        let mut s = Value::set();
        assert!(s.set_include(Value::Int(3)).unwrap());
        assert!(!s.set_include(Value::Int(3)).unwrap());
        assert!(s.set_contains(&Value::Int(3)).unwrap());
        assert!(s.set_exclude(&Value::Int(3)).unwrap());
        assert!(!s.set_contains(&Value::Int(3)).unwrap());
    }

    #[test]
    fn test_array_blittable_roundtrip() {
        let a = ArrayVar::from_ints(&[1, -2, 3]);
        assert_eq!(a.len(), 3);
        assert_eq!(a.as_ints(), vec![1, -2, 3]);
        let v1 = Value::Array(a.clone());
        let v2 = Value::Array(ArrayVar::from_ints(&[1, -2, 3]));
        assert_eq!(v1, v2);
        assert_eq!(v1.hash128(), v2.hash128());
        assert_eq!(
            Value::Array(ArrayVar::from_ints(&[1, 2])).compare(&Value::Array(ArrayVar::from_ints(&[1, 3]))),
            ValueOrder::Less
        );
    }

    #[test]
    fn test_seq_editing_ops() {
        let mut s = Value::seq(vec![Value::Int(1), Value::Int(3)]);
        s.seq_insert(1, Value::Int(2)).unwrap();
        assert_eq!(s, Value::seq(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        assert_eq!(s.seq_remove(0).unwrap(), Value::Int(1));
        s.seq_push(Value::Int(4)).unwrap();
        assert_eq!(s.seq_pop().unwrap(), Some(Value::Int(4)));
        s.seq_resize(4).unwrap();
        assert_eq!(s, Value::seq(vec![Value::Int(2), Value::Int(3), Value::None, Value::None]));
        assert!(s.seq_insert(99, Value::None).is_err());
        assert!(s.seq_remove(99).is_err());
    }

    #[test]
    fn test_float_array_roundtrip() {
        let a = ArrayVar::from_floats(&[0.5, -2.0]);
        assert_eq!(a.as_floats(), vec![0.5, -2.0]);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_container_ops_reject_wrong_kind() {
        let mut v = Value::Int(1);
        assert!(v.seq_push(Value::None).is_err());
        assert!(v.table_insert("x", Value::None).is_err());
        assert!(v.set_include(Value::None).is_err());
    }

    #[test]
    fn test_enum_compare_requires_same_registration() {
        let a = Value::Enum { vendor_id: 1, type_id: 2, value: 5 };
        let b = Value::Enum { vendor_id: 1, type_id: 3, value: 5 };
        assert_ne!(a, b);
        assert_eq!(a.compare(&b), ValueOrder::Undefined);
        let c = Value::Enum { vendor_id: 1, type_id: 2, value: 9 };
        assert_eq!(a.compare(&c), ValueOrder::Less);
    }
}
