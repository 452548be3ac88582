//! Parallel runners: TryMany, Expand, Spawn
//!
//! All three fan a template wire out through a doppelganger pool. TryMany
//! maps a sequence across clones (element i to clone i), Expand feeds one
//! scalar to N clones, Spawn schedules a single clone on the caller's mesh
//! and hands back its handle.
//!
//! With one thread the clones are driven round-robin from the calling
//! wire's own suspend loop. With more, each clone gets a private auxiliary
//! mesh and the clones are partitioned across scoped worker threads, a
//! batch per pass, with the calling wire yielding between passes.

use crate::context::{Context, FlowState};
use crate::error::{Result, RuntimeError};
use crate::mesh::Mesh;
use crate::pool::WirePool;
use crate::shard::{ExposedInfo, InstanceData, ParameterInfo, Shard};
use crate::shards::wires::{RunMode, WireBase};
use crate::types::TypeInfo;
use crate::value::Value;
use crate::wire::{Wire, WireState};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Success policy for a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitUntil {
    /// Return the first clone that ends; stop the rest.
    FirstSuccess,
    /// Every clone must end; output is all outputs in submission order.
    #[default]
    AllSuccess,
    /// Output is the outputs of the clones that ended.
    SomeSuccess,
}

pub(crate) const WEFT_VENDOR_ID: i32 = 0x77656674; // 'weft'
pub(crate) const WAIT_UNTIL_TYPE_ID: i32 = 0x7472794d; // 'tryM'

impl WaitUntil {
    fn from_value(value: &Value) -> Result<WaitUntil> {
        match value {
            Value::Enum { vendor_id, type_id, value }
                if *vendor_id == WEFT_VENDOR_ID && *type_id == WAIT_UNTIL_TYPE_ID =>
            {
                match *value {
                    0 => Ok(WaitUntil::FirstSuccess),
                    1 => Ok(WaitUntil::AllSuccess),
                    2 => Ok(WaitUntil::SomeSuccess),
                    other => Err(RuntimeError::invalid_var_type(format!(
                        "unknown WaitUntil value {other}"
                    ))),
                }
            }
            other => Err(RuntimeError::invalid_var_type(format!(
                "expected WaitUntil enum, got {}",
                other.kind()
            ))),
        }
    }

    fn to_value(self) -> Value {
        Value::Enum {
            vendor_id: WEFT_VENDOR_ID,
            type_id: WAIT_UNTIL_TYPE_ID,
            value: match self {
                WaitUntil::FirstSuccess => 0,
                WaitUntil::AllSuccess => 1,
                WaitUntil::SomeSuccess => 2,
            },
        }
    }
}

/// One clone in flight.
struct Slot {
    wire: Wire,
    mesh: Option<Mesh>,
    done: bool,
}

/// Releases every acquired clone when the activation leaves, stopping the
/// ones still in flight (FirstSuccess cancellation and caller-cancel both
/// land here).
struct SlotGuard<'a> {
    pool: &'a WirePool,
    slots: Vec<Slot>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            if let Some(mesh) = &slot.mesh {
                mesh.terminate();
            }
            if !slot.wire.is_terminal() {
                slot.wire.stop();
            }
            self.pool.release(slot.wire);
        }
    }
}

/// The machinery TryMany and Expand share.
#[derive(Clone, Default)]
pub(crate) struct ParallelBase {
    base: WireBase,
    policy: WaitUntil,
    threads: i64,
    coros: i64,
    pool: SharedPool,
    shared_copy: SharedScope,
    clone_input: crate::shards::core::TypeCell,
}

#[derive(Default)]
pub(crate) struct SharedPool(Mutex<Option<Arc<WirePool>>>);

impl Clone for SharedPool {
    fn clone(&self) -> Self {
        // clones rebuild their pool at compose
        SharedPool::default()
    }
}

impl SharedPool {
    fn set(&self, pool: Arc<WirePool>) {
        *self.0.lock().expect("pool slot poisoned") = Some(pool);
    }

    fn get(&self) -> Option<Arc<WirePool>> {
        self.0.lock().expect("pool slot poisoned").clone()
    }
}

#[derive(Default)]
pub(crate) struct SharedScope(Mutex<Vec<ExposedInfo>>);

impl Clone for SharedScope {
    fn clone(&self) -> Self {
        SharedScope(Mutex::new(self.0.lock().expect("scope lock poisoned").clone()))
    }
}

impl SharedScope {
    fn set(&self, scope: Vec<ExposedInfo>) {
        *self.0.lock().expect("scope lock poisoned") = scope;
    }

    fn get(&self) -> Vec<ExposedInfo> {
        self.0.lock().expect("scope lock poisoned").clone()
    }
}

impl ParallelBase {
    fn parameters() -> Vec<ParameterInfo> {
        vec![
            ParameterInfo::new("Wire", "The wire to run many times concurrently.", WireBase::wire_param_types()),
            ParameterInfo::new("Policy", "The success policy.", vec![TypeInfo::Enum {
                vendor_id: WEFT_VENDOR_ID,
                type_id: WAIT_UNTIL_TYPE_ID,
            }]),
            ParameterInfo::new("Threads", "Worker threads to use.", vec![TypeInfo::int()]),
            ParameterInfo::new("Coroutines", "Clones driven per worker pass.", vec![TypeInfo::int()]),
        ]
    }

    fn set_param(&mut self, shard: &'static str, index: usize, value: &Value) -> Result<()> {
        match index {
            0 => {
                self.base.wireref.set(value.clone());
                self.base.set_target(None);
                Ok(())
            }
            1 => {
                self.policy = WaitUntil::from_value(value)?;
                Ok(())
            }
            2 => match value {
                Value::Int(n) => {
                    self.threads = (*n).max(1);
                    Ok(())
                }
                other => Err(RuntimeError::invalid_var_type(format!(
                    "Threads expects Int, got {}",
                    other.kind()
                ))),
            },
            3 => match value {
                Value::Int(n) => {
                    self.coros = (*n).max(1);
                    Ok(())
                }
                other => Err(RuntimeError::invalid_var_type(format!(
                    "Coroutines expects Int, got {}",
                    other.kind()
                ))),
            },
            _ => Err(RuntimeError::InvalidParameterIndex { shard, index }),
        }
    }

    fn get_param(&self, shard: &'static str, index: usize) -> Result<Value> {
        match index {
            0 => Ok(self.base.wireref.raw()),
            1 => Ok(self.policy.to_value()),
            2 => Ok(Value::Int(self.threads.max(1))),
            3 => Ok(Value::Int(self.coros.max(1))),
            _ => Err(RuntimeError::InvalidParameterIndex { shard, index }),
        }
    }

    /// Compose the template and build the pool. `clone_input` is the type
    /// each clone will be composed against.
    fn compose(&mut self, data: &InstanceData, clone_input: TypeInfo) -> Result<Wire> {
        self.base.mode = if self.threads > 1 { RunMode::Detached } else { RunMode::Inline };
        self.base.passthrough = false;
        self.base.capturing = false;

        self.base.compose(data)?;
        let wire = self
            .base
            .target()
            .ok_or_else(|| RuntimeError::compose("parallel runner needs a wire"))?;

        self.shared_copy.set(data.shared.clone());
        self.clone_input.set(clone_input);
        self.pool.set(Arc::new(WirePool::new(wire.clone())));
        Ok(wire)
    }

    fn pool(&self) -> Result<Arc<WirePool>> {
        self.pool
            .get()
            .ok_or_else(|| RuntimeError::activation("parallel runner was not composed"))
    }

    /// Compose a fresh clone the way the template was composed.
    fn compose_clone(&self, wire: &Wire) -> Result<()> {
        let data = InstanceData {
            input_type: self.clone_input.get(),
            wire: Some(wire.clone()),
            shared: self.shared_copy.get(),
            on_worker_thread: self.threads > 1,
            ..Default::default()
        };
        crate::compose::compose_wire(wire, &data).map(|_| ())
    }

    /// Fan out, drive to policy satisfaction, collect.
    fn run(
        &self,
        ctx: &mut Context<'_>,
        inputs: &(dyn Fn(usize) -> Value + Sync),
        len: usize,
    ) -> Result<Value> {
        let pool = self.pool()?;
        let mut guard = SlotGuard { pool: &pool, slots: Vec::with_capacity(len) };
        for _ in 0..len {
            let wire = pool.acquire(|w| self.compose_clone(w))?;
            guard.slots.push(Slot { wire, mesh: None, done: false });
        }

        // indexed so the collected outputs keep submission order no matter
        // which clone finishes first
        let mut results: Vec<Option<Value>> = vec![None; len];
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        loop {
            if ctx.suspend(0.0) != FlowState::Continue {
                // cancelled: the guard stops and releases everything
                return Ok(Value::None);
            }

            if self.threads <= 1 {
                self.drive_inline(ctx, &mut guard.slots, inputs);
            } else {
                self.drive_threaded(&mut guard.slots, inputs);
            }

            for (i, slot) in guard.slots.iter_mut().enumerate() {
                if slot.done || !slot.wire.is_terminal() {
                    continue;
                }
                slot.done = true;
                match slot.wire.state() {
                    WireState::Ended => {
                        let out = slot.wire.finished_output();
                        if self.policy == WaitUntil::FirstSuccess {
                            tracing::debug!(winner = i, "parallel run satisfied");
                            return Ok(out);
                        }
                        results[i] = Some(out);
                        succeeded += 1;
                    }
                    _ => failed += 1,
                }
            }

            if succeeded + failed == len {
                if succeeded == 0 {
                    return Err(RuntimeError::activation("parallel run failed on every wire"));
                }
                return match self.policy {
                    WaitUntil::SomeSuccess => {
                        Ok(Value::Seq(results.into_iter().flatten().collect()))
                    }
                    WaitUntil::AllSuccess => {
                        if succeeded == len {
                            Ok(Value::Seq(results.into_iter().flatten().collect()))
                        } else {
                            Err(RuntimeError::activation(format!(
                                "parallel run failed on {failed} of {len} wires"
                            )))
                        }
                    }
                    // all clones ended and none succeeded is handled above;
                    // FirstSuccess with a winner returned early
                    WaitUntil::FirstSuccess => {
                        Err(RuntimeError::activation("parallel run failed on every wire"))
                    }
                };
            }
        }
    }

    /// One round-robin pass on the calling coroutine.
    fn drive_inline(
        &self,
        ctx: &mut Context<'_>,
        slots: &mut [Slot],
        inputs: &(dyn Fn(usize) -> Value + Sync),
    ) {
        let now = Instant::now();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.done {
                continue;
            }
            if !slot.wire.has_coro() {
                if let Some(mesh) = ctx.mesh.upgrade() {
                    slot.wire.set_mesh(&mesh);
                }
                slot.wire.set_seed_stack(ctx.wire_stack.clone());
                if slot.wire.prepare(None).is_err() {
                    slot.done = true;
                    continue;
                }
                slot.wire.start(inputs(i));
            }
            slot.wire.tick(now);
        }
    }

    /// One pass with the clones partitioned across scoped worker threads,
    /// `coros` clones ticked per worker turn.
    fn drive_threaded(&self, slots: &mut [Slot], inputs: &(dyn Fn(usize) -> Value + Sync)) {
        let threads = (self.threads.max(1) as usize).min(slots.len().max(1));
        let batch = self.coros.max(1) as usize;
        let chunk = slots.len().div_ceil(threads);
        if chunk == 0 {
            return;
        }

        std::thread::scope(|scope| {
            for (c, group) in slots.chunks_mut(chunk).enumerate() {
                let base = c * chunk;
                scope.spawn(move || {
                    for (w, window) in group.chunks_mut(batch).enumerate() {
                        for (k, slot) in window.iter_mut().enumerate() {
                            if slot.done {
                                continue;
                            }
                            let index = base + w * batch + k;
                            let mesh = slot.mesh.get_or_insert_with(Mesh::new);
                            if !slot.wire.has_coro() && !slot.wire.is_terminal() {
                                if mesh.schedule(slot.wire.clone(), inputs(index), false).is_err() {
                                    slot.done = true;
                                    continue;
                                }
                            }
                            mesh.tick();
                        }
                    }
                });
            }
        });
    }
}

// ---------------------------------------------------------------------------

/// Run one clone per element of the input sequence.
#[derive(Clone, Default)]
pub struct TryManyShard {
    base: ParallelBase,
}

impl TryManyShard {
    pub fn with_wire(template: Wire, policy: WaitUntil, threads: i64, coros: i64) -> Self {
        let mut shard = TryManyShard::default();
        shard.base.base.wireref.set(Value::Wire(template));
        shard.base.policy = policy;
        shard.base.threads = threads.max(1);
        shard.base.coros = coros.max(1);
        shard
    }
}

impl Shard for TryManyShard {
    fn name(&self) -> &'static str {
        "TryMany"
    }

    fn help(&self) -> &'static str {
        "Runs a clone of the wire for every element of the input sequence."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::any_seq()]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any, TypeInfo::any_seq()]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        ParallelBase::parameters()
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        self.base.set_param("TryMany", index, value)
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        self.base.get_param("TryMany", index)
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        // element type feeds each clone
        let clone_input = match &data.input_type {
            TypeInfo::Seq(seq) if seq.of.len() == 1 => seq.of[0].clone(),
            _ => TypeInfo::Any,
        };
        let wire = self.base.compose(data, clone_input)?;

        let out = match self.base.policy {
            WaitUntil::FirstSuccess => wire.output_type(),
            _ => TypeInfo::seq_of(vec![wire.output_type()]),
        };
        Ok(Some(out))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.base.base.wireref.warmup(ctx)
    }

    fn cleanup(&self) {
        self.base.base.wireref.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let items = match input {
            Value::Seq(items) => items.clone(),
            other => {
                return Err(RuntimeError::invalid_var_type(format!(
                    "TryMany expects a sequence, got {}",
                    other.kind()
                )))
            }
        };
        if items.is_empty() {
            return Ok(Value::Seq(Vec::new()));
        }
        let len = items.len();
        self.base.run(ctx, &move |i| items[i].clone(), len)
    }
}

/// Run N clones of the wire, each fed the same scalar input.
#[derive(Clone)]
pub struct ExpandShard {
    base: ParallelBase,
    width: i64,
}

impl Default for ExpandShard {
    fn default() -> Self {
        ExpandShard { base: ParallelBase::default(), width: 10 }
    }
}

impl ExpandShard {
    pub fn with_wire(template: Wire, width: i64, policy: WaitUntil) -> Self {
        let mut shard = ExpandShard::default();
        shard.base.base.wireref.set(Value::Wire(template));
        shard.base.policy = policy;
        shard.width = width.max(1);
        shard
    }
}

impl Shard for ExpandShard {
    fn name(&self) -> &'static str {
        "Expand"
    }

    fn help(&self) -> &'static str {
        "Runs N clones of the wire on the same input."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any, TypeInfo::any_seq()]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        let mut params =
            vec![ParameterInfo::new("Size", "The expansion size.", vec![TypeInfo::int()])];
        params.extend(ParallelBase::parameters());
        params
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        if index == 0 {
            return match value {
                Value::Int(n) => {
                    self.width = (*n).max(1);
                    Ok(())
                }
                other => Err(RuntimeError::invalid_var_type(format!(
                    "Expand Size expects Int, got {}",
                    other.kind()
                ))),
            };
        }
        self.base.set_param("Expand", index - 1, value)
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        if index == 0 {
            return Ok(Value::Int(self.width));
        }
        self.base.get_param("Expand", index - 1)
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        let wire = self.base.compose(data, data.input_type.clone())?;
        let out = match self.base.policy {
            WaitUntil::FirstSuccess => wire.output_type(),
            _ => TypeInfo::seq_of(vec![wire.output_type()]),
        };
        Ok(Some(out))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.base.base.wireref.warmup(ctx)
    }

    fn cleanup(&self) {
        self.base.base.wireref.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let scalar = input.clone();
        self.base.run(ctx, &move |_| scalar.clone(), self.width.max(1) as usize)
    }
}

// ---------------------------------------------------------------------------

/// Fire-and-forget: acquire one clone, capture, schedule it on the
/// caller's mesh, and output its handle.
#[derive(Clone)]
pub struct SpawnShard {
    base: WireBase,
    pool: SharedPool,
    shared_copy: SharedScope,
    clone_input: crate::shards::core::TypeCell,
}

impl Default for SpawnShard {
    fn default() -> Self {
        let mut base = WireBase::default();
        base.mode = RunMode::Detached;
        base.capturing = true;
        SpawnShard {
            base,
            pool: SharedPool::default(),
            shared_copy: SharedScope::default(),
            clone_input: Default::default(),
        }
    }
}

impl SpawnShard {
    pub fn with_wire(template: Wire) -> Self {
        let shard = SpawnShard::default();
        shard.base.wireref.set(Value::Wire(template));
        shard
    }
}

impl Shard for SpawnShard {
    fn name(&self) -> &'static str {
        "Spawn"
    }

    fn help(&self) -> &'static str {
        "Schedules a fresh clone of the wire and outputs its handle."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Wire]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Wire", "The wire to spawn.", WireBase::wire_param_types())]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match index {
            0 => {
                self.base.wireref.set(value.clone());
                self.base.set_target(None);
                Ok(())
            }
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(self.base.wireref.raw()),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn required_variables(&self) -> Vec<ExposedInfo> {
        self.base.surfaced_required()
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        self.base.compose(data)?;
        let wire = self
            .base
            .target()
            .ok_or_else(|| RuntimeError::compose("Spawn needs a wire"))?;
        self.shared_copy.set(data.shared.clone());
        self.clone_input.set(data.input_type.clone());
        self.pool.set(Arc::new(WirePool::new(wire)));
        Ok(Some(TypeInfo::Wire))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.base.wireref.warmup(ctx)?;
        self.base.captures.warmup(ctx);
        Ok(())
    }

    fn cleanup(&self) {
        self.base.captures.cleanup();
        self.base.wireref.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let pool = self
            .pool
            .get()
            .ok_or_else(|| RuntimeError::activation("Spawn was not composed"))?;
        let mesh = ctx
            .mesh
            .upgrade()
            .ok_or_else(|| RuntimeError::activation("Spawn: no mesh available"))?;

        let shared = self.shared_copy.get();
        let clone_input = self.clone_input.get();
        let clone = pool.acquire(|w| {
            let data = InstanceData {
                input_type: clone_input.clone(),
                wire: Some(w.clone()),
                shared: shared.clone(),
                ..Default::default()
            };
            crate::compose::compose_wire(w, &data).map(|_| ())
        })?;

        // recycled clones carry stale listeners
        clone.clear_on_stop();
        {
            let pool = pool.clone();
            let recycled = clone.downgrade();
            clone.on_stop(move || {
                if let Some(wire) = recycled.upgrade() {
                    pool.release(wire);
                }
            });
        }

        self.base.captures.inject(&clone);
        mesh.schedule(clone.clone(), input.clone(), false)?;
        Ok(Value::Wire(clone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_until_enum_roundtrip() {
        for policy in [WaitUntil::FirstSuccess, WaitUntil::AllSuccess, WaitUntil::SomeSuccess] {
            assert_eq!(WaitUntil::from_value(&policy.to_value()).unwrap(), policy);
        }
        assert!(WaitUntil::from_value(&Value::Int(0)).is_err());
        assert!(WaitUntil::from_value(&Value::Enum {
            vendor_id: WEFT_VENDOR_ID,
            type_id: WAIT_UNTIL_TYPE_ID,
            value: 9
        })
        .is_err());
    }
}
