//! Compose: type propagation and variable-exposure analysis
//!
//! Every wire must compose before it runs. Compose walks the shard list
//! start to end, threading the concrete input type through each shard,
//! accumulating the exposed-variable scope, and collecting the requirements
//! the wire cannot satisfy itself. The first flow-stopper fixes the wire's
//! observable output type; later shards still compose.
//!
//! Re-entrancy: a wire already on the compose stack composes to `Any`
//! immediately — the real output type is patched when the outer call
//! unwinds. A composed wire (hash ≠ 0) never re-composes; its cached
//! artifacts are verified against the caller's scope instead.

use crate::error::{Result, RuntimeError};
use crate::shard::{ExposedInfo, InstanceData, Shard, ShardBox};
use crate::types::TypeInfo;
use crate::wire::Wire;
use std::cell::RefCell;
use std::collections::HashSet;
use weft_core::hash::Hash128;

/// What a compose pass produces.
#[derive(Debug, Clone, Default)]
pub struct ComposeResult {
    pub output_type: TypeInfo,
    /// Variables the composed shards expose to their subtree.
    pub exposed: Vec<ExposedInfo>,
    /// Requirements not satisfied within the composed span.
    pub required: Vec<ExposedInfo>,
    /// True when a flow-stopper fixed the output type.
    pub flow_stopper: bool,
}

thread_local! {
    /// Wires currently being composed on this thread; the recursion guard.
    static COMPOSING: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

struct ComposeGuard(usize);

impl ComposeGuard {
    fn enter(id: usize) -> Option<ComposeGuard> {
        COMPOSING.with(|set| {
            if set.borrow().contains(&id) {
                None
            } else {
                set.borrow_mut().insert(id);
                Some(ComposeGuard(id))
            }
        })
    }
}

impl Drop for ComposeGuard {
    fn drop(&mut self) {
        COMPOSING.with(|set| {
            set.borrow_mut().remove(&self.0);
        });
    }
}

/// Compose a bare shard span against `data`. This is the inner loop wire
/// composition, inline shard parameters (If/Repeat bodies), and branch
/// wires all share.
pub fn compose_slice(shards: &mut [&mut dyn Shard], data: &InstanceData) -> Result<ComposeResult> {
    let mut current = data.input_type.clone();
    let mut shared = data.shared.clone();
    // names exposed by earlier shards of this same span
    let mut local_names: HashSet<String> = HashSet::new();
    let mut result = ComposeResult::default();
    let mut stopper_output: Option<TypeInfo> = None;

    let len = shards.len();
    for i in 0..len {
        let (head, tail) = shards.split_at_mut(i + 1);
        let shard = &mut *head[i];

        let accepted = shard.input_types().iter().any(|t| current.matches(t));
        if !accepted {
            return Err(RuntimeError::compose(format!(
                "shard {} does not accept input of type {:?}",
                shard.name(),
                current.kind()
            )));
        }

        let mut sub = data.clone();
        sub.input_type = current.clone();
        sub.shared = shared.clone();
        sub.next_input_types = tail.first().map(|s| s.input_types()).unwrap_or_default();

        let output = match shard.compose(&sub)? {
            Some(t) => t,
            None => {
                let outs = shard.output_types();
                if outs.len() == 1 {
                    outs.into_iter().next().expect("length checked")
                } else {
                    // ambiguous signatures degrade to Any
                    TypeInfo::Any
                }
            }
        };

        for req in shard.required_variables() {
            if !local_names.contains(&req.name)
                && !result.required.iter().any(|r| r.name == req.name)
            {
                result.required.push(req);
            }
        }

        for exp in shard.exposed_variables() {
            local_names.insert(exp.name.clone());
            shared.push(exp.clone());
            result.exposed.push(exp);
        }

        if shard.is_flow_stopper() && stopper_output.is_none() {
            stopper_output = Some(output.clone());
        }

        current = output;
    }

    if let Some(sink) = &data.required_sink {
        let mut sink = sink.lock().expect("requirement sink poisoned");
        for req in &result.required {
            sink.entry(req.name.clone()).or_insert_with(|| req.clone());
        }
    }

    result.flow_stopper = stopper_output.is_some();
    result.output_type = stopper_output.unwrap_or(current);
    Ok(result)
}

fn compose_shards_and_hash(
    shards: &mut Vec<ShardBox>,
    sub: &InstanceData,
    input_type: &TypeInfo,
) -> Result<(ComposeResult, u128)> {
    let mut refs: Vec<&mut dyn Shard> = Vec::with_capacity(shards.len());
    for b in shards.iter_mut() {
        refs.push(b.as_mut());
    }
    let result = compose_slice(&mut refs, sub)?;
    drop(refs);

    // structural only: a pool clone must hash identically to its
    // template, so the wire's name stays out
    let mut h = Hash128::new();
    h.update_hash(input_type.type_hash());
    for s in shards.iter() {
        h.update_u32(s.hash());
        for p in 0..s.parameters().len() {
            if let Ok(v) = s.get_param(p) {
                h.update_hash(v.hash128());
            }
        }
    }
    Ok((result, h.finish128()))
}

/// Compose a wire with the presented instance data, filling its composed
/// artifacts (input/output types, requirements, exposed globals, hash).
pub fn compose_wire(wire: &Wire, data: &InstanceData) -> Result<ComposeResult> {
    // cache: a composed wire only gets verified, never re-walked
    if wire.composed_hash() != 0 {
        return verify_already_composed(wire, data);
    }

    let guard = match ComposeGuard::enter(wire.id()) {
        Some(g) => g,
        None => {
            // recursive reference: resolve to Any, patched on unwind
            tracing::debug!(wire = %wire.name(), "compose recursion, deferring to Any");
            return Ok(ComposeResult { output_type: TypeInfo::Any, ..Default::default() });
        }
    };

    tracing::trace!(wire = %wire.name(), input = ?data.input_type.kind(), "composing wire");

    let mut sub = data.clone();
    sub.wire = Some(wire.clone());

    let (result, hash) =
        wire.with_shards_mut(|shards| compose_shards_and_hash(shards, &sub, &data.input_type))?;
    drop(guard);

    // anything the wire still requires must come from the caller's scope
    for req in &result.required {
        let available = data.shared.iter().any(|e| e.name == req.name);
        if !available {
            return Err(RuntimeError::compose(format!(
                "wire {} requires variable {} which is not exposed in scope",
                wire.name(),
                req.name
            )));
        }
        wire.add_deep_requirement(req.clone());
    }

    wire.set_input_type(data.input_type.clone());
    wire.set_output_type(result.output_type.clone());
    wire.set_required_variables(result.required.clone());
    wire.set_exposed_globals(result.exposed.iter().filter(|e| e.global).cloned().collect());
    wire.set_composed_hash(if hash == 0 { 1 } else { hash });

    tracing::trace!(wire = %wire.name(), output = ?result.output_type.kind(), "wire composed");
    Ok(result)
}

/// Verification pass for the compose cache: the presented input type must
/// match the recorded one and every recorded requirement must still be
/// satisfiable; recorded deep requirements propagate to the caller's sink.
fn verify_already_composed(wire: &Wire, data: &InstanceData) -> Result<ComposeResult> {
    let recorded = wire.input_type();
    if !data.input_type.matches(&recorded) && !recorded.same_type(&data.input_type) {
        return Err(RuntimeError::compose(format!(
            "wire {} was composed for input {:?} but is called with {:?}",
            wire.name(),
            recorded.kind(),
            data.input_type.kind()
        )));
    }

    for req in wire.required_variables() {
        if !data.shared.iter().any(|e| e.name == req.name) {
            return Err(RuntimeError::compose(format!(
                "wire {} is missing required variable {}",
                wire.name(),
                req.name
            )));
        }
    }

    if let Some(sink) = &data.required_sink {
        let mut sink = sink.lock().expect("requirement sink poisoned");
        for (name, info) in wire.deep_requirements() {
            sink.entry(name).or_insert(info);
        }
    }

    Ok(ComposeResult {
        output_type: wire.output_type(),
        exposed: wire.exposed_globals(),
        required: wire.required_variables(),
        flow_stopper: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shards::core::{ConstShard, GetShard, MathAdd, MathMultiply, SetShard};
    use crate::value::{Value, ValueKind};

    fn arithmetic_wire() -> Wire {
        let w = Wire::new("arith");
        w.add_shard(Box::new(ConstShard::new(Value::Int(3)))).unwrap();
        w.add_shard(Box::new(MathAdd::new(Value::Int(4)))).unwrap();
        w.add_shard(Box::new(MathMultiply::new(Value::Int(2)))).unwrap();
        w
    }

    #[test]
    fn test_type_propagation() {
        let w = arithmetic_wire();
        let data = InstanceData::with_input(TypeInfo::None);
        let result = compose_wire(&w, &data).unwrap();
        assert_eq!(result.output_type.kind(), ValueKind::Int);
        assert_ne!(w.composed_hash(), 0);
        assert_eq!(w.output_type().kind(), ValueKind::Int);
    }

    #[test]
    fn test_compose_is_idempotent() {
        let w = arithmetic_wire();
        let data = InstanceData::with_input(TypeInfo::None);
        let first = compose_wire(&w, &data).unwrap();
        let second = compose_wire(&w, &data).unwrap();
        assert!(first.output_type.same_type(&second.output_type));
    }

    #[test]
    fn test_recompose_requires_cleared_hash() {
        let w = arithmetic_wire();
        let data = InstanceData::with_input(TypeInfo::None);
        compose_wire(&w, &data).unwrap();

        // a different input type against the cache is rejected
        let other = InstanceData::with_input(TypeInfo::String);
        assert!(compose_wire(&w, &other).is_err());

        // clearing the hash permits a fresh compose
        w.clear_composed_hash();
        assert!(compose_wire(&w, &data).is_ok());
    }

    #[test]
    fn test_type_mismatch_is_fatal() {
        let w = Wire::new("bad");
        w.add_shard(Box::new(ConstShard::new(Value::string("text")))).unwrap();
        w.add_shard(Box::new(MathAdd::new(Value::Int(1)))).unwrap();
        let err = compose_wire(&w, &InstanceData::with_input(TypeInfo::None)).unwrap_err();
        assert!(matches!(err, RuntimeError::Compose(_)));
    }

    #[test]
    fn test_exposed_satisfies_later_requirement() {
        let w = Wire::new("vars");
        w.add_shard(Box::new(ConstShard::new(Value::Int(1)))).unwrap();
        w.add_shard(Box::new(SetShard::new("n", false))).unwrap();
        w.add_shard(Box::new(GetShard::new("n"))).unwrap();
        let result = compose_wire(&w, &InstanceData::with_input(TypeInfo::None)).unwrap();
        // the Get requirement is satisfied by the earlier Set
        assert!(result.required.is_empty());
        assert!(result.exposed.iter().any(|e| e.name == "n"));
    }

    #[test]
    fn test_unsatisfied_requirement_fails_compose() {
        let w = Wire::new("missing");
        w.add_shard(Box::new(GetShard::new("ghost"))).unwrap();
        let err = compose_wire(&w, &InstanceData::with_input(TypeInfo::None)).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_requirement_satisfied_by_parent_scope_is_deep() {
        let w = Wire::new("child");
        w.add_shard(Box::new(GetShard::new("outer"))).unwrap();

        let mut data = InstanceData::with_input(TypeInfo::None);
        data.shared.push(ExposedInfo::new("outer", TypeInfo::int()));
        let sink: crate::shard::RequirementSink = Default::default();
        data.required_sink = Some(sink.clone());

        compose_wire(&w, &data).unwrap();
        assert!(w.deep_requirements().contains_key("outer"));
        assert!(sink.lock().unwrap().contains_key("outer"));
    }
}
