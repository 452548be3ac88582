//! Type descriptors and compose-time type algebra
//!
//! `TypeInfo` is the structural description the composer propagates through
//! a wire: every shard declares the input shapes it accepts and the output
//! shapes it can produce, and `matches` decides compatibility.
//!
//! Deriving a type from a concrete value preserves the observed structure;
//! structural equality and the type hash both ignore validation-only payload
//! (numeric bounds, fixed sizes, the recursive-self marker).

use crate::error::{Result, RuntimeError};
use crate::shard::ExposedInfo;
use crate::value::{Value, ValueKind};
use weft_core::hash::Hash128;

/// Path type payload: what a path parameter is allowed to point at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathType {
    pub extensions: Vec<String>,
    pub is_file: bool,
    pub existing: bool,
    pub relative: bool,
}

/// Sequence type payload: the set of allowed element types. The
/// `self_recursive` marker stands in for "a seq of this same type" so cyclic
/// shapes never need a cyclic descriptor graph.
#[derive(Debug, Clone, Default)]
pub struct SeqType {
    pub of: Vec<TypeInfo>,
    pub self_recursive: bool,
    pub fixed_size: Option<u32>,
}

/// Table type payload. With `keys`, `types` runs parallel to it (one type
/// per key); without keys it is the set of allowed value types.
#[derive(Debug, Clone, Default)]
pub struct TableType {
    pub keys: Vec<String>,
    pub types: Vec<TypeInfo>,
}

#[derive(Debug, Clone, Default)]
pub enum TypeInfo {
    #[default]
    None,
    Any,
    Bool,
    Int {
        bounds: Option<(i64, i64)>,
    },
    Int2,
    Int3,
    Int4,
    Int8,
    Int16,
    Float {
        bounds: Option<(f64, f64)>,
    },
    Float2,
    Float3,
    Float4,
    Color,
    String,
    Path(PathType),
    /// Accepts a context variable holding any of the listed types.
    ContextVar {
        of: Vec<TypeInfo>,
    },
    Bytes,
    Seq(SeqType),
    Table(TableType),
    Set {
        of: Vec<TypeInfo>,
    },
    Array {
        of: ValueKind,
        fixed_size: Option<u32>,
    },
    Image,
    Audio,
    Enum {
        vendor_id: i32,
        type_id: i32,
    },
    Object {
        vendor_id: i32,
        type_id: i32,
    },
    Wire,
    ShardRef,
}

impl TypeInfo {
    pub fn int() -> TypeInfo {
        TypeInfo::Int { bounds: None }
    }

    pub fn float() -> TypeInfo {
        TypeInfo::Float { bounds: None }
    }

    pub fn seq_of(of: Vec<TypeInfo>) -> TypeInfo {
        TypeInfo::Seq(SeqType { of, self_recursive: false, fixed_size: None })
    }

    /// An untyped sequence: any element shape accepted.
    pub fn any_seq() -> TypeInfo {
        TypeInfo::seq_of(Vec::new())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            TypeInfo::None => ValueKind::None,
            TypeInfo::Any => ValueKind::Any,
            TypeInfo::Bool => ValueKind::Bool,
            TypeInfo::Int { .. } => ValueKind::Int,
            TypeInfo::Int2 => ValueKind::Int2,
            TypeInfo::Int3 => ValueKind::Int3,
            TypeInfo::Int4 => ValueKind::Int4,
            TypeInfo::Int8 => ValueKind::Int8,
            TypeInfo::Int16 => ValueKind::Int16,
            TypeInfo::Float { .. } => ValueKind::Float,
            TypeInfo::Float2 => ValueKind::Float2,
            TypeInfo::Float3 => ValueKind::Float3,
            TypeInfo::Float4 => ValueKind::Float4,
            TypeInfo::Color => ValueKind::Color,
            TypeInfo::String => ValueKind::String,
            TypeInfo::Path(_) => ValueKind::Path,
            TypeInfo::ContextVar { .. } => ValueKind::ContextVar,
            TypeInfo::Bytes => ValueKind::Bytes,
            TypeInfo::Seq(_) => ValueKind::Seq,
            TypeInfo::Table(_) => ValueKind::Table,
            TypeInfo::Set { .. } => ValueKind::Set,
            TypeInfo::Array { .. } => ValueKind::Array,
            TypeInfo::Image => ValueKind::Image,
            TypeInfo::Audio => ValueKind::Audio,
            TypeInfo::Enum { .. } => ValueKind::Enum,
            TypeInfo::Object { .. } => ValueKind::Object,
            TypeInfo::Wire => ValueKind::Wire,
            TypeInfo::ShardRef => ValueKind::ShardRef,
        }
    }

    /// Build the minimal type that accepts `value`.
    pub fn derive(value: &Value) -> TypeInfo {
        Self::derive_in_scope(value, &[])
    }

    /// Like [`TypeInfo::derive`], resolving `ContextVar` payloads against an
    /// exposed-variable scope.
    pub fn derive_in_scope(value: &Value, scope: &[ExposedInfo]) -> TypeInfo {
        match value {
            Value::None => TypeInfo::None,
            Value::Any => TypeInfo::Any,
            Value::Bool(_) => TypeInfo::Bool,
            Value::Int(_) => TypeInfo::int(),
            Value::Int2(_) => TypeInfo::Int2,
            Value::Int3(_) => TypeInfo::Int3,
            Value::Int4(_) => TypeInfo::Int4,
            Value::Int8(_) => TypeInfo::Int8,
            Value::Int16(_) => TypeInfo::Int16,
            Value::Float(_) => TypeInfo::float(),
            Value::Float2(_) => TypeInfo::Float2,
            Value::Float3(_) => TypeInfo::Float3,
            Value::Float4(_) => TypeInfo::Float4,
            Value::Color(_) => TypeInfo::Color,
            Value::String(_) => TypeInfo::String,
            Value::Path(_) => TypeInfo::Path(PathType::default()),
            Value::ContextVar(name) => {
                let of = scope
                    .iter()
                    .filter(|e| e.name == **name)
                    .map(|e| e.ty.clone())
                    .collect();
                TypeInfo::ContextVar { of }
            }
            Value::Bytes(_) => TypeInfo::Bytes,
            Value::Seq(items) => {
                let mut of: Vec<TypeInfo> = Vec::new();
                for item in items {
                    let t = Self::derive_in_scope(item, scope);
                    if !of.iter().any(|o| o.same_type(&t)) {
                        of.push(t);
                    }
                }
                TypeInfo::Seq(SeqType { of, self_recursive: false, fixed_size: None })
            }
            Value::Table(map) => {
                let mut keys: Vec<String> = map.keys().cloned().collect();
                keys.sort();
                let types = keys
                    .iter()
                    .map(|k| Self::derive_in_scope(&map[k], scope))
                    .collect();
                TypeInfo::Table(TableType { keys, types })
            }
            Value::Set(set) => {
                let mut of: Vec<TypeInfo> = Vec::new();
                for k in set.iter() {
                    let t = Self::derive_in_scope(&k.0, scope);
                    if !of.iter().any(|o| o.same_type(&t)) {
                        of.push(t);
                    }
                }
                TypeInfo::Set { of }
            }
            Value::Array(a) => TypeInfo::Array { of: a.inner, fixed_size: None },
            Value::Image(_) => TypeInfo::Image,
            Value::Audio(_) => TypeInfo::Audio,
            Value::Enum { vendor_id, type_id, .. } => {
                TypeInfo::Enum { vendor_id: *vendor_id, type_id: *type_id }
            }
            Value::Object(o) => TypeInfo::Object { vendor_id: o.vendor_id, type_id: o.type_id },
            Value::Wire(_) => TypeInfo::Wire,
            Value::ShardRef(_) => TypeInfo::ShardRef,
        }
    }

    /// Structural equality. Sequence element types compare as sets; keyed
    /// tables compare keys in order. Validation payload (bounds, fixed
    /// sizes, the self marker) does not participate.
    pub fn same_type(&self, other: &TypeInfo) -> bool {
        if self.kind() != other.kind() {
            return false;
        }
        match (self, other) {
            (TypeInfo::Seq(a), TypeInfo::Seq(b)) => type_sets_equal(&a.of, &b.of),
            (TypeInfo::Set { of: a }, TypeInfo::Set { of: b }) => type_sets_equal(a, b),
            (TypeInfo::ContextVar { of: a }, TypeInfo::ContextVar { of: b }) => {
                type_sets_equal(a, b)
            }
            (TypeInfo::Table(a), TypeInfo::Table(b)) => {
                a.keys == b.keys
                    && a.types.len() == b.types.len()
                    && a.types.iter().zip(b.types.iter()).all(|(x, y)| x.same_type(y))
            }
            (TypeInfo::Array { of: a, .. }, TypeInfo::Array { of: b, .. }) => a == b,
            (TypeInfo::Enum { vendor_id: va, type_id: ta },
             TypeInfo::Enum { vendor_id: vb, type_id: tb })
            | (TypeInfo::Object { vendor_id: va, type_id: ta },
               TypeInfo::Object { vendor_id: vb, type_id: tb }) => va == vb && ta == tb,
            (TypeInfo::Path(a), TypeInfo::Path(b)) => a == b,
            _ => true,
        }
    }

    /// Structural 128-bit hash. Equal types hash equal; `fixed_size` and the
    /// self-recursion marker are excluded on purpose.
    pub fn type_hash(&self) -> u128 {
        let mut h = Hash128::new();
        self.hash_into(&mut h);
        h.finish128()
    }

    fn hash_into(&self, h: &mut Hash128) {
        h.update_tag(self.kind() as u8);
        match self {
            TypeInfo::Seq(s) => hash_type_set(&s.of, h),
            TypeInfo::Set { of } | TypeInfo::ContextVar { of } => hash_type_set(of, h),
            TypeInfo::Table(t) => {
                h.update_u64(t.keys.len() as u64);
                for (k, ty) in t.keys.iter().zip(t.types.iter()) {
                    h.update_bytes(k.as_bytes());
                    ty.hash_into(h);
                }
                if t.keys.is_empty() {
                    hash_type_set(&t.types, h);
                }
            }
            TypeInfo::Array { of, .. } => h.update_tag(*of as u8),
            TypeInfo::Enum { vendor_id, type_id } | TypeInfo::Object { vendor_id, type_id } => {
                h.update_u32(*vendor_id as u32);
                h.update_u32(*type_id as u32);
            }
            TypeInfo::Path(p) => {
                for ext in &p.extensions {
                    h.update_bytes(ext.as_bytes());
                }
                h.update_u8(p.is_file as u8);
                h.update_u8(p.existing as u8);
                h.update_u8(p.relative as u8);
            }
            _ => {}
        }
    }

    /// Whether a value of type `self` can flow where `want` is expected.
    pub fn matches(&self, want: &TypeInfo) -> bool {
        if matches!(want, TypeInfo::Any) || matches!(self, TypeInfo::Any) {
            return true;
        }
        if self.kind() != want.kind() {
            return false;
        }
        match (self, want) {
            (TypeInfo::Seq(have), TypeInfo::Seq(want)) => {
                // empty want element set accepts any sequence
                want.of.is_empty()
                    || have
                        .of
                        .iter()
                        .all(|h| want.of.iter().any(|w| h.matches(w)))
            }
            (TypeInfo::Set { of: have }, TypeInfo::Set { of: want }) => {
                want.is_empty() || have.iter().all(|h| want.iter().any(|w| h.matches(w)))
            }
            (TypeInfo::Table(have), TypeInfo::Table(want)) => {
                if want.keys.is_empty() {
                    want.types.is_empty()
                        || have
                            .types
                            .iter()
                            .all(|h| want.types.iter().any(|w| h.matches(w)))
                } else {
                    // every required key present with an acceptable type
                    want.keys.iter().zip(want.types.iter()).all(|(k, wt)| {
                        have.keys
                            .iter()
                            .position(|hk| hk == k)
                            .map(|i| have.types[i].matches(wt))
                            .unwrap_or(false)
                    })
                }
            }
            (TypeInfo::Array { of: have, .. }, TypeInfo::Array { of: want, .. }) => {
                *want == ValueKind::Any || have == want
            }
            (TypeInfo::Enum { vendor_id: va, type_id: ta },
             TypeInfo::Enum { vendor_id: vb, type_id: tb })
            | (TypeInfo::Object { vendor_id: va, type_id: ta },
               TypeInfo::Object { vendor_id: vb, type_id: tb }) => va == vb && ta == tb,
            _ => true,
        }
    }

    /// Validation of a concrete value against this type, including the
    /// payload `matches` ignores: numeric bounds and fixed container sizes.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let derived = TypeInfo::derive(value);
        if !derived.matches(self) {
            return Err(RuntimeError::invalid_var_type(format!(
                "expected {:?}, got {}",
                self.kind(),
                value.kind()
            )));
        }
        match (self, value) {
            (TypeInfo::Int { bounds: Some((lo, hi)) }, Value::Int(v)) => {
                if v < lo || v > hi {
                    return Err(RuntimeError::invalid_var_type(format!(
                        "int {v} outside [{lo}, {hi}]"
                    )));
                }
            }
            (TypeInfo::Float { bounds: Some((lo, hi)) }, Value::Float(v)) => {
                if v < lo || v > hi {
                    return Err(RuntimeError::invalid_var_type(format!(
                        "float {v} outside [{lo}, {hi}]"
                    )));
                }
            }
            (TypeInfo::Seq(SeqType { fixed_size: Some(n), .. }), Value::Seq(items)) => {
                if items.len() != *n as usize {
                    return Err(RuntimeError::invalid_var_type(format!(
                        "seq length {} != fixed size {n}",
                        items.len()
                    )));
                }
            }
            (TypeInfo::Array { fixed_size: Some(n), .. }, Value::Array(a)) => {
                if a.len() != *n as usize {
                    return Err(RuntimeError::invalid_var_type(format!(
                        "array length {} != fixed size {n}",
                        a.len()
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn type_sets_equal(a: &[TypeInfo], b: &[TypeInfo]) -> bool {
    a.iter().all(|x| b.iter().any(|y| x.same_type(y)))
        && b.iter().all(|x| a.iter().any(|y| x.same_type(y)))
}

fn hash_type_set(types: &[TypeInfo], h: &mut Hash128) {
    let mut hashes: Vec<u128> = types.iter().map(|t| t.type_hash()).collect();
    hashes.sort_unstable();
    h.update_u64(hashes.len() as u64);
    for e in hashes {
        h.update_hash(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_preserves_structure() {
        let mut t = Value::table();
        t.table_insert("n", Value::Int(1)).unwrap();
        t.table_insert("s", Value::string("x")).unwrap();
        let ty = TypeInfo::derive(&t);
        match ty {
            TypeInfo::Table(tt) => {
                assert_eq!(tt.keys, vec!["n".to_string(), "s".to_string()]);
                assert_eq!(tt.types[0].kind(), ValueKind::Int);
                assert_eq!(tt.types[1].kind(), ValueKind::String);
            }
            other => panic!("expected table type, got {other:?}"),
        }
    }

    #[test]
    fn test_seq_element_types_dedup() {
        let v = Value::seq(vec![Value::Int(1), Value::Int(2), Value::string("x")]);
        match TypeInfo::derive(&v) {
            TypeInfo::Seq(s) => assert_eq!(s.of.len(), 2),
            other => panic!("expected seq type, got {other:?}"),
        }
    }

    #[test]
    fn test_same_type_compares_element_sets() {
        let a = TypeInfo::seq_of(vec![TypeInfo::int(), TypeInfo::String]);
        let b = TypeInfo::seq_of(vec![TypeInfo::String, TypeInfo::int()]);
        assert!(a.same_type(&b));
        let c = TypeInfo::seq_of(vec![TypeInfo::String]);
        assert!(!a.same_type(&c));
    }

    #[test]
    fn test_hash_ignores_fixed_size_and_self_marker() {
        let a = TypeInfo::Seq(SeqType {
            of: vec![TypeInfo::int()],
            self_recursive: false,
            fixed_size: None,
        });
        let b = TypeInfo::Seq(SeqType {
            of: vec![TypeInfo::int()],
            self_recursive: true,
            fixed_size: Some(4),
        });
        assert_eq!(a.type_hash(), b.type_hash());
    }

    #[test]
    fn test_matches_any() {
        assert!(TypeInfo::int().matches(&TypeInfo::Any));
        assert!(TypeInfo::Any.matches(&TypeInfo::int()));
        assert!(!TypeInfo::int().matches(&TypeInfo::String));
    }

    #[test]
    fn test_matches_seq_elementwise() {
        let have = TypeInfo::seq_of(vec![TypeInfo::int()]);
        let want = TypeInfo::seq_of(vec![TypeInfo::int(), TypeInfo::float()]);
        assert!(have.matches(&want));
        assert!(!want.matches(&have));
        assert!(want.matches(&TypeInfo::any_seq()));
    }

    #[test]
    fn test_matches_table_required_keys() {
        let have = TypeInfo::Table(TableType {
            keys: vec!["a".into(), "b".into()],
            types: vec![TypeInfo::int(), TypeInfo::String],
        });
        let want = TypeInfo::Table(TableType {
            keys: vec!["a".into()],
            types: vec![TypeInfo::int()],
        });
        assert!(have.matches(&want));
        assert!(!want.matches(&have));
    }

    #[test]
    fn test_validate_bounds() {
        let ty = TypeInfo::Int { bounds: Some((0, 10)) };
        assert!(ty.validate(&Value::Int(5)).is_ok());
        assert!(ty.validate(&Value::Int(11)).is_err());
        assert!(ty.validate(&Value::Float(5.0)).is_err());
    }

    #[test]
    fn test_validate_fixed_size() {
        let ty = TypeInfo::Seq(SeqType {
            of: vec![TypeInfo::int()],
            self_recursive: false,
            fixed_size: Some(2),
        });
        assert!(ty.validate(&Value::seq(vec![Value::Int(1), Value::Int(2)])).is_ok());
        assert!(ty.validate(&Value::seq(vec![Value::Int(1)])).is_err());
    }
}
