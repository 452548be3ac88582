//! Named, reference-counted variables
//!
//! A variable is a shared, mutable `Value` slot. Cloning the `Arc` is the
//! reference increment; dropping it is the release — when the last handle
//! goes away the contained value is destroyed with it. Slots carry two
//! markers the lookup machinery honors:
//!
//! - `protected`: hidden from generic get/set; only consumable as a
//!   parameter wired at compose time.
//! - `external`: injected by the host, so mesh teardown must leave the
//!   storage alone (the host's own `Arc` keeps it alive regardless).

use crate::error::{Result, RuntimeError};
use crate::value::Value;
use std::sync::{Arc, Mutex};

pub type VarRef = Arc<Mutex<Value>>;

pub fn make_var(value: Value) -> VarRef {
    Arc::new(Mutex::new(value))
}

/// Read a variable's current value.
pub fn var_get(var: &VarRef) -> Value {
    var.lock().expect("variable lock poisoned").clone()
}

/// Overwrite a variable's value in place.
pub fn var_set(var: &VarRef, value: Value) {
    *var.lock().expect("variable lock poisoned") = value;
}

/// Number of live references to the slot.
pub fn var_refcount(var: &VarRef) -> usize {
    Arc::strong_count(var)
}

/// A named slot in a wire-local table, mesh refs, or mesh globals.
#[derive(Clone)]
pub struct VarSlot {
    pub var: VarRef,
    pub protected: bool,
    pub external: bool,
}

impl VarSlot {
    pub fn new(value: Value) -> Self {
        Self { var: make_var(value), protected: false, external: false }
    }

    pub fn protected(value: Value) -> Self {
        Self { var: make_var(value), protected: true, external: false }
    }

    /// Wrap a host-owned variable. Teardown never destroys these.
    pub fn external(var: VarRef) -> Self {
        Self { var, protected: false, external: true }
    }
}

/// A shard parameter that is either a literal value or a context-variable
/// label resolved at warmup. Interior-mutable so resolution can happen
/// through a shared shard reference; the binding lock is only ever taken
/// transiently.
#[derive(Default)]
pub struct ParamVar {
    value: Mutex<Value>,
    binding: Mutex<Option<VarRef>>,
}

// Mutex has no Clone; a cloned parameter starts unbound so the copy resolves
// its own variable at warmup.
impl Clone for ParamVar {
    fn clone(&self) -> Self {
        Self { value: Mutex::new(self.raw()), binding: Mutex::new(None) }
    }
}

impl ParamVar {
    pub fn new(value: Value) -> Self {
        Self { value: Mutex::new(value), binding: Mutex::new(None) }
    }

    pub fn set(&self, value: Value) {
        *self.value.lock().expect("param lock poisoned") = value;
    }

    /// The raw parameter as configured (a literal, or the ContextVar label).
    pub fn raw(&self) -> Value {
        self.value.lock().expect("param lock poisoned").clone()
    }

    pub fn is_variable(&self) -> bool {
        matches!(&*self.value.lock().expect("param lock poisoned"), Value::ContextVar(_))
    }

    pub fn variable_name(&self) -> Option<String> {
        match &*self.value.lock().expect("param lock poisoned") {
            Value::ContextVar(name) => Some(name.to_string()),
            _ => None,
        }
    }

    /// Resolve a ContextVar label against the activation context. Literal
    /// parameters warm up to themselves.
    pub fn warmup(&self, ctx: &mut crate::context::Context<'_>) -> Result<()> {
        if let Some(name) = self.variable_name() {
            let var = ctx.reference_variable(&name);
            *self.binding.lock().expect("param lock poisoned") = Some(var);
        }
        Ok(())
    }

    pub fn cleanup(&self) {
        *self.binding.lock().expect("param lock poisoned") = None;
    }

    /// Current value: the bound variable's content, or the literal.
    pub fn get(&self) -> Value {
        if let Some(var) = &*self.binding.lock().expect("param lock poisoned") {
            return var_get(var);
        }
        self.raw()
    }

    /// The bound variable, for callers that write through the parameter.
    pub fn binding(&self) -> Option<VarRef> {
        self.binding.lock().expect("param lock poisoned").clone()
    }

    /// A variable parameter that was never warmed up is a usage error.
    pub fn get_bound(&self) -> Result<Value> {
        if self.is_variable() && self.binding.lock().expect("param lock poisoned").is_none() {
            return Err(RuntimeError::warmup(format!(
                "parameter variable {} read before warmup",
                self.variable_name().unwrap_or_default()
            )));
        }
        Ok(self.get())
    }
}

impl std::fmt::Debug for ParamVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ParamVar({:?})", self.raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_refcount_tracks_references() {
        let v = make_var(Value::Int(1));
        assert_eq!(var_refcount(&v), 1);
        let v2 = v.clone();
        assert_eq!(var_refcount(&v), 2);
        drop(v2);
        assert_eq!(var_refcount(&v), 1);
    }

    #[test]
    fn test_var_set_visible_through_all_refs() {
        let v = make_var(Value::Int(1));
        let alias = v.clone();
        var_set(&v, Value::Int(9));
        assert_eq!(var_get(&alias), Value::Int(9));
    }

    #[test]
    fn test_param_literal() {
        let p = ParamVar::new(Value::Int(42));
        assert!(!p.is_variable());
        assert_eq!(p.get(), Value::Int(42));
    }

    #[test]
    fn test_param_variable_name() {
        let p = ParamVar::new(Value::context_var("speed"));
        assert!(p.is_variable());
        assert_eq!(p.variable_name().as_deref(), Some("speed"));
        assert!(p.get_bound().is_err());
    }

    #[test]
    fn test_slot_markers() {
        let s = VarSlot::protected(Value::None);
        assert!(s.protected && !s.external);
        let e = VarSlot::external(make_var(Value::None));
        assert!(e.external && !e.protected);
    }
}
