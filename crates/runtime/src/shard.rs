//! The shard contract
//!
//! A shard is one operator in a wire: it consumes the previous shard's
//! output and produces the next input. Concrete shards implement the
//! [`Shard`] trait; the engine only ever talks to the capability set, never
//! to concrete types.
//!
//! Lifecycle: `compose` (optional, build phase, exclusive access) →
//! `warmup` (resolve variable references) → `activate` (hot path, shared
//! access, interior-mutable state only) → `cleanup` (release references,
//! symmetric with warmup).
//!
//! `activate` takes `&self` so wires can re-enter their own shard list
//! (recursion through `Recur`, sub-wire dispatch through `Do`). Stateful
//! shards keep their runtime state behind transient locks and never hold
//! one across a nested activation.

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::types::TypeInfo;
use crate::value::{ShardVar, Value};
use crate::wire::Wire;
use dyn_clone::DynClone;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Static description of one configurable parameter.
#[derive(Debug, Clone)]
pub struct ParameterInfo {
    pub name: &'static str,
    pub help: &'static str,
    pub types: Vec<TypeInfo>,
}

impl ParameterInfo {
    pub fn new(name: &'static str, help: &'static str, types: Vec<TypeInfo>) -> Self {
        Self { name, help, types }
    }
}

/// A named variable contract: what a shard exposes to descendants or
/// requires from ancestors.
#[derive(Debug, Clone)]
pub struct ExposedInfo {
    pub name: String,
    pub help: &'static str,
    pub ty: TypeInfo,
    pub mutable: bool,
    pub protected: bool,
    pub table_entry: bool,
    /// Visible to every wire in the mesh, not just descendants.
    pub global: bool,
}

impl ExposedInfo {
    pub fn new(name: impl Into<String>, ty: TypeInfo) -> Self {
        Self {
            name: name.into(),
            help: "",
            ty,
            mutable: false,
            protected: false,
            table_entry: false,
            global: false,
        }
    }

    pub fn mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    pub fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }
}

/// Sink for requirements discovered while composing nested wires; control
/// shards that capture variables read it back after compose.
pub type RequirementSink = Arc<Mutex<HashMap<String, ExposedInfo>>>;

/// Everything a shard's `compose` can see about its position in the wire.
#[derive(Clone, Default)]
pub struct InstanceData {
    pub input_type: TypeInfo,
    /// The wire being composed.
    pub wire: Option<Wire>,
    /// Variables exposed so far, scoped to this wire's subtree.
    pub shared: Vec<ExposedInfo>,
    /// Input types the next shard accepts, as a hint for generic shards.
    pub next_input_types: Vec<TypeInfo>,
    /// When present, nested compose records deep requirements here.
    pub required_sink: Option<RequirementSink>,
    /// Set when the wire will run on a worker thread.
    pub on_worker_thread: bool,
}

impl InstanceData {
    pub fn with_input(input_type: TypeInfo) -> Self {
        Self { input_type, ..Default::default() }
    }
}

/// The operator contract. See the module docs for the lifecycle.
pub trait Shard: DynClone + Send + Sync {
    fn name(&self) -> &'static str;

    /// Stable identity hash of the shard type.
    fn hash(&self) -> u32 {
        weft_core::hash::hash128_bytes(self.name().as_bytes()) as u32
    }

    fn help(&self) -> &'static str {
        ""
    }

    fn input_types(&self) -> Vec<TypeInfo>;

    fn output_types(&self) -> Vec<TypeInfo>;

    fn parameters(&self) -> Vec<ParameterInfo> {
        Vec::new()
    }

    fn set_param(&mut self, index: usize, _value: &Value) -> Result<()> {
        Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index })
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index })
    }

    fn required_variables(&self) -> Vec<ExposedInfo> {
        Vec::new()
    }

    fn exposed_variables(&self) -> Vec<ExposedInfo> {
        Vec::new()
    }

    /// Specialize for the concrete input type. `Ok(None)` means "no custom
    /// compose": the composer picks a signature from the static type sets.
    fn compose(&mut self, _data: &InstanceData) -> Result<Option<TypeInfo>> {
        Ok(None)
    }

    fn warmup(&self, _ctx: &mut Context<'_>) -> Result<()> {
        Ok(())
    }

    /// The hot path. Must not panic and must not yield except through the
    /// context's suspend points.
    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value>;

    fn cleanup(&self) {}

    /// True for shards that end the wire's observable dataflow (Return,
    /// Restart, Fail, Stop): the wire's output type is fixed at this point.
    fn is_flow_stopper(&self) -> bool {
        false
    }
}

dyn_clone::clone_trait_object!(Shard);

pub type ShardBox = Box<dyn Shard>;

/// An inline sequence of shards carried as a parameter (predicate and body
/// lists of If, Maybe, Repeat and friends).
///
/// Stored as `Arc<dyn Shard>` so activation needs no locks and stays
/// re-entrant; `set_param`/`get_param` convert to and from `ShardRef`
/// values by deep clone, so a parameter snapshot never aliases live state.
#[derive(Default)]
pub struct ShardsVar {
    shards: Vec<Arc<dyn Shard>>,
}

impl Clone for ShardsVar {
    fn clone(&self) -> Self {
        Self {
            shards: self
                .shards
                .iter()
                .map(|s| Arc::from(dyn_clone::clone_box(&**s)))
                .collect(),
        }
    }
}

impl std::fmt::Debug for ShardsVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.shards.iter().map(|s| s.name()).collect();
        write!(f, "ShardsVar({names:?})")
    }
}

impl ShardsVar {
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn push(&mut self, shard: ShardBox) {
        self.shards.push(Arc::from(shard));
    }

    /// Accepts `None`, a single `ShardRef`, or a `Seq` of `ShardRef`s.
    pub fn set_param(&mut self, value: &Value) -> Result<()> {
        self.shards.clear();
        match value {
            Value::None => Ok(()),
            Value::ShardRef(s) => {
                self.shards.push(clone_out(s));
                Ok(())
            }
            Value::Seq(items) => {
                for item in items {
                    match item {
                        Value::ShardRef(s) => self.shards.push(clone_out(s)),
                        other => {
                            return Err(RuntimeError::invalid_var_type(format!(
                                "expected ShardRef in shard sequence, got {}",
                                other.kind()
                            )))
                        }
                    }
                }
                Ok(())
            }
            other => Err(RuntimeError::invalid_var_type(format!(
                "expected shards, got {}",
                other.kind()
            ))),
        }
    }

    pub fn get_param(&self) -> Value {
        if self.shards.is_empty() {
            return Value::None;
        }
        Value::Seq(
            self.shards
                .iter()
                .map(|s| Value::ShardRef(ShardVar::new(dyn_clone::clone_box(&**s))))
                .collect(),
        )
    }

    /// Compose the inline sequence against `data`, returning the composed
    /// result of the slice.
    pub fn compose(&mut self, data: &InstanceData) -> Result<crate::compose::ComposeResult> {
        let mut refs: Vec<&mut dyn Shard> = Vec::with_capacity(self.shards.len());
        for arc in self.shards.iter_mut() {
            match Arc::get_mut(arc) {
                Some(s) => refs.push(s),
                None => {
                    return Err(RuntimeError::compose(
                        "cannot compose a shard sequence that is currently shared",
                    ))
                }
            }
        }
        crate::compose::compose_slice(&mut refs, data)
    }

    pub fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        for s in &self.shards {
            s.warmup(ctx)?;
        }
        Ok(())
    }

    pub fn cleanup(&self) {
        for s in self.shards.iter().rev() {
            s.cleanup();
        }
    }

    /// Run the sequence. Flow-state changes (Return, Restart, Stop, Error)
    /// short-circuit; the caller inspects the context afterwards.
    pub fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let mut current = input.clone();
        for s in &self.shards {
            match s.activate(ctx, &current) {
                Ok(out) => current = out,
                Err(e) => {
                    ctx.fail_flow(e.message());
                    return Ok(current);
                }
            }
            if !ctx.should_continue() {
                break;
            }
        }
        Ok(current)
    }
}

fn clone_out(s: &ShardVar) -> Arc<dyn Shard> {
    let guard = s.0.lock().expect("shard lock poisoned");
    Arc::from(dyn_clone::clone_box(&**guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Probe;

    impl Shard for Probe {
        fn name(&self) -> &'static str {
            "Probe"
        }

        fn input_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Any]
        }

        fn output_types(&self) -> Vec<TypeInfo> {
            vec![TypeInfo::Any]
        }

        fn activate(&self, _ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
            Ok(input.clone())
        }
    }

    #[test]
    fn test_default_param_accessors_reject_any_index() {
        let mut p = Probe;
        assert!(matches!(
            p.set_param(0, &Value::None),
            Err(RuntimeError::InvalidParameterIndex { shard: "Probe", index: 0 })
        ));
        assert!(p.get_param(2).is_err());
    }

    #[test]
    fn test_shard_hash_is_stable_per_name() {
        assert_eq!(Probe.hash(), Probe.hash());
    }

    #[test]
    fn test_shards_var_param_roundtrip() {
        let mut sv = ShardsVar::default();
        sv.set_param(&Value::Seq(vec![
            Value::ShardRef(ShardVar::new(Box::new(Probe))),
            Value::ShardRef(ShardVar::new(Box::new(Probe))),
        ]))
        .unwrap();
        assert_eq!(sv.len(), 2);

        let back = sv.get_param();
        match back {
            Value::Seq(items) => assert_eq!(items.len(), 2),
            other => panic!("expected seq, got {other:?}"),
        }

        sv.set_param(&Value::None).unwrap();
        assert!(sv.is_empty());
    }

    #[test]
    fn test_shards_var_rejects_non_shards() {
        let mut sv = ShardsVar::default();
        assert!(sv.set_param(&Value::Int(3)).is_err());
        assert!(sv.set_param(&Value::Seq(vec![Value::Int(3)])).is_err());
    }

    #[test]
    fn test_shards_var_clone_is_deep() {
        let mut sv = ShardsVar::default();
        sv.push(Box::new(Probe));
        let copy = sv.clone();
        assert_eq!(copy.len(), 1);
        assert!(!Arc::ptr_eq(
            // both sides hold their own instance
            &sv.shards[0],
            &copy.shards[0]
        ));
    }
}
