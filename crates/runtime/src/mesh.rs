//! Mesh: the cooperative scheduler
//!
//! A mesh owns scheduled wires and advances them one cooperative step per
//! tick, in insertion order. Wires detached during a tick are spliced in
//! right after the wire that spawned them, so they get their first step
//! before the next already-scheduled wire runs.
//!
//! A mesh is single-threaded: its wires are coroutines driven from
//! whichever thread calls `tick`. Meshes on different threads never share
//! state except through explicitly captured variables.

use crate::compose::{compose_wire, ComposeResult};
use crate::context::Flow;
use crate::error::{Result, RuntimeError};
use crate::shard::{ExposedInfo, InstanceData};
use crate::types::TypeInfo;
use crate::value::Value;
use crate::variables::{make_var, var_get, VarRef, VarSlot};
use crate::wire::Wire;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

pub struct MeshData {
    flows: Mutex<Vec<Flow>>,
    /// Flows created mid-tick (Detach, Spawn); spliced in after the
    /// currently ticking flow.
    pending: Mutex<Vec<Flow>>,
    /// Ids of wires currently occupying a scheduler slot.
    scheduled: Mutex<HashSet<usize>>,
    scheduled_wires: Mutex<Vec<Wire>>,
    /// Compose memoization: wire id → composed output type.
    visited: Mutex<HashMap<usize, TypeInfo>>,
    globals: Mutex<HashMap<String, VarSlot>>,
    /// Host-injected, externally-owned variables.
    refs: Mutex<HashMap<String, VarSlot>>,
    errors: Mutex<Vec<String>>,
    /// Exposed set seeded into every schedule-time compose (Branch wires
    /// inherit their parent's scope through this).
    seed_shared: Mutex<Vec<ExposedInfo>>,
}

#[derive(Clone)]
pub struct Mesh(Arc<MeshData>);

#[derive(Clone, Default)]
pub struct WeakMesh(Weak<MeshData>);

impl WeakMesh {
    pub fn upgrade(&self) -> Option<Mesh> {
        self.0.upgrade().map(Mesh)
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl Mesh {
    pub fn new() -> Mesh {
        Mesh(Arc::new(MeshData {
            flows: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            scheduled: Mutex::new(HashSet::new()),
            scheduled_wires: Mutex::new(Vec::new()),
            visited: Mutex::new(HashMap::new()),
            globals: Mutex::new(HashMap::new()),
            refs: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            seed_shared: Mutex::new(Vec::new()),
        }))
    }

    pub fn downgrade(&self) -> WeakMesh {
        WeakMesh(Arc::downgrade(&self.0))
    }

    pub fn same_mesh(&self, other: &Mesh) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // ---- scheduling ----

    /// Compose (unless already composed and `force_compose` is false),
    /// prepare, and queue a wire. A wire occupies at most one slot; a
    /// second schedule while it is queued is a no-op.
    pub fn schedule(&self, wire: Wire, input: Value, force_compose: bool) -> Result<()> {
        {
            let scheduled = self.0.scheduled.lock().expect("mesh lock poisoned");
            if scheduled.contains(&wire.id()) {
                return Ok(());
            }
        }

        wire.set_mesh(self);

        if wire.composed_hash() == 0 || force_compose {
            if force_compose {
                wire.clear_composed_hash();
            }
            let data = InstanceData {
                input_type: TypeInfo::derive(&input),
                wire: Some(wire.clone()),
                shared: self.schedule_scope(),
                ..Default::default()
            };
            let result = compose_wire(&wire, &data)?;
            self.absorb_exposed(&result);
        }

        wire.prepare(None)?;
        wire.start(input);

        let flow = wire.flow().ok_or_else(|| {
            RuntimeError::warmup(format!("wire {} has no flow after prepare", wire.name()))
        })?;

        tracing::debug!(wire = %wire.name(), "scheduled");
        self.0.scheduled.lock().expect("mesh lock poisoned").insert(wire.id());
        self.0.scheduled_wires.lock().expect("mesh lock poisoned").push(wire);
        self.0.pending.lock().expect("mesh lock poisoned").push(flow);
        Ok(())
    }

    /// Remove a wire from the schedule without stopping it.
    pub fn unschedule(&self, wire: &Wire) {
        self.0.scheduled.lock().expect("mesh lock poisoned").remove(&wire.id());
        self.0
            .scheduled_wires
            .lock()
            .expect("mesh lock poisoned")
            .retain(|w| !w.same_wire(wire));
        self.0
            .flows
            .lock()
            .expect("mesh lock poisoned")
            .retain(|f| !f.current().same_wire(wire));
    }

    /// The exposed scope a schedule-time compose sees: the seed set plus
    /// every global and ref, typed from their current values.
    fn schedule_scope(&self) -> Vec<ExposedInfo> {
        let mut shared = self.0.seed_shared.lock().expect("mesh lock poisoned").clone();
        for (name, slot) in self.0.globals.lock().expect("mesh lock poisoned").iter() {
            shared.push(
                ExposedInfo::new(name.clone(), TypeInfo::derive(&var_get(&slot.var)))
                    .mutable()
                    .global(true),
            );
        }
        for (name, slot) in self.0.refs.lock().expect("mesh lock poisoned").iter() {
            shared.push(
                ExposedInfo::new(name.clone(), TypeInfo::derive(&var_get(&slot.var)))
                    .mutable()
                    .global(true),
            );
        }
        shared
    }

    /// Materialize globals a compose pass exposed.
    fn absorb_exposed(&self, result: &ComposeResult) {
        let mut globals = self.0.globals.lock().expect("mesh lock poisoned");
        for info in result.exposed.iter().filter(|e| e.global) {
            globals
                .entry(info.name.clone())
                .or_insert_with(|| VarSlot::new(Value::None));
        }
    }

    // ---- ticking ----

    /// Advance every runnable wire one cooperative step. Returns true while
    /// any wire remains scheduled.
    pub fn tick(&self) -> bool {
        let now = Instant::now();
        self.splice_pending(0);

        let mut i = 0usize;
        loop {
            let flow = {
                let flows = self.0.flows.lock().expect("mesh lock poisoned");
                match flows.get(i) {
                    Some(f) => f.clone(),
                    None => break,
                }
            };

            let wire = flow.current();
            match wire.state() {
                crate::wire::WireState::Starting | crate::wire::WireState::Iterating => {
                    wire.tick(now);
                }
                _ => {}
            }

            // wires detached by this step run before the next slot
            self.splice_pending(i + 1);
            i += 1;
        }

        self.prune()
    }

    fn splice_pending(&self, at: usize) {
        let mut pending = self.0.pending.lock().expect("mesh lock poisoned");
        if pending.is_empty() {
            return;
        }
        let mut flows = self.0.flows.lock().expect("mesh lock poisoned");
        let at = at.min(flows.len());
        for (k, f) in pending.drain(..).enumerate() {
            flows.insert(at + k, f);
        }
    }

    /// Drop finished flows, log failures, release scheduler slots. The
    /// wires themselves stay warm (and on the terminate list) until
    /// something stops them. Returns true while anything is still
    /// scheduled.
    fn prune(&self) -> bool {
        let mut done: Vec<Wire> = Vec::new();
        {
            let mut flows = self.0.flows.lock().expect("mesh lock poisoned");
            flows.retain(|f| {
                let wire = f.current();
                if wire.is_terminal() {
                    done.push(wire);
                    false
                } else {
                    true
                }
            });
        }
        for wire in done {
            if let Some(err) = wire.finished_error() {
                tracing::warn!(wire = %wire.name(), error = %err, "wire failed on mesh");
                self.0
                    .errors
                    .lock()
                    .expect("mesh lock poisoned")
                    .push(format!("{}: {err}", wire.name()));
            }
            // the slot frees up (a pool may recycle this wire later), but
            // the wire stays on the terminate list
            self.0.scheduled.lock().expect("mesh lock poisoned").remove(&wire.id());
        }
        !self.0.flows.lock().expect("mesh lock poisoned").is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.0.flows.lock().expect("mesh lock poisoned").is_empty()
            && self.0.pending.lock().expect("mesh lock poisoned").is_empty()
    }

    /// Block the calling thread; hosts pace their tick loops with this.
    pub fn sleep(&self, seconds: f64) {
        if seconds > 0.0 {
            std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
        }
    }

    /// Stop every wire (most recently scheduled first), fire their on-stop
    /// listeners, then clear the visited cache, refs, and globals.
    pub fn terminate(&self) {
        let flows: Vec<Flow> = {
            let mut guard = self.0.flows.lock().expect("mesh lock poisoned");
            std::mem::take(&mut *guard)
        };
        let mut wires: Vec<Wire> = {
            let mut guard = self.0.scheduled_wires.lock().expect("mesh lock poisoned");
            std::mem::take(&mut *guard)
        };
        {
            let mut guard = self.0.pending.lock().expect("mesh lock poisoned");
            guard.clear();
        }
        // flows may point at wires switched in by Resume that never got a
        // scheduler slot of their own
        for flow in &flows {
            let current = flow.current();
            if !wires.iter().any(|w| w.same_wire(&current)) {
                wires.push(current);
            }
        }
        for wire in wires.iter().rev() {
            wire.stop();
        }
        self.0.scheduled.lock().expect("mesh lock poisoned").clear();
        self.0.visited.lock().expect("mesh lock poisoned").clear();
        self.0.refs.lock().expect("mesh lock poisoned").clear();
        self.0.globals.lock().expect("mesh lock poisoned").clear();
        self.0.seed_shared.lock().expect("mesh lock poisoned").clear();
    }

    // ---- compose memoization ----

    pub fn visited_get(&self, wire_id: usize) -> Option<TypeInfo> {
        self.0.visited.lock().expect("mesh lock poisoned").get(&wire_id).cloned()
    }

    pub fn visited_insert(&self, wire_id: usize, ty: TypeInfo) -> bool {
        use std::collections::hash_map::Entry;
        match self.0.visited.lock().expect("mesh lock poisoned").entry(wire_id) {
            Entry::Occupied(mut e) => {
                e.insert(ty);
                false
            }
            Entry::Vacant(e) => {
                e.insert(ty);
                true
            }
        }
    }

    pub fn visited_contains(&self, wire_id: usize) -> bool {
        self.0.visited.lock().expect("mesh lock poisoned").contains_key(&wire_id)
    }

    // ---- globals and refs ----

    pub fn get_global(&self, name: &str) -> Option<VarRef> {
        self.0
            .globals
            .lock()
            .expect("mesh lock poisoned")
            .get(name)
            .map(|s| s.var.clone())
    }

    pub fn insert_global(&self, name: &str, slot: VarSlot) -> VarRef {
        let var = slot.var.clone();
        self.0
            .globals
            .lock()
            .expect("mesh lock poisoned")
            .insert(name.to_string(), slot);
        var
    }

    pub fn get_ref(&self, name: &str) -> Option<VarRef> {
        self.0
            .refs
            .lock()
            .expect("mesh lock poisoned")
            .get(name)
            .map(|s| s.var.clone())
    }

    /// Inject a host-owned variable. The mesh never destroys it.
    pub fn set_external_variable(&self, name: &str, var: VarRef) {
        self.0
            .refs
            .lock()
            .expect("mesh lock poisoned")
            .insert(name.to_string(), VarSlot::external(var));
    }

    pub fn remove_external_variable(&self, name: &str) {
        self.0.refs.lock().expect("mesh lock poisoned").remove(name);
    }

    /// Allocate an external slot owned by the caller; returns the handle
    /// the host writes through.
    pub fn alloc_external_variable(&self, name: &str, initial: Value) -> VarRef {
        let var = make_var(initial);
        self.set_external_variable(name, var.clone());
        var
    }

    pub fn free_external_variable(&self, name: &str) {
        self.remove_external_variable(name);
    }

    pub fn ref_count(&self) -> usize {
        self.0.refs.lock().expect("mesh lock poisoned").len()
    }

    // ---- diagnostics ----

    pub fn push_error(&self, msg: impl Into<String>) {
        self.0.errors.lock().expect("mesh lock poisoned").push(msg.into());
    }

    pub fn errors(&self) -> Vec<String> {
        self.0.errors.lock().expect("mesh lock poisoned").clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.0.errors.lock().expect("mesh lock poisoned").is_empty()
    }

    pub fn set_seed_shared(&self, shared: Vec<ExposedInfo>) {
        *self.0.seed_shared.lock().expect("mesh lock poisoned") = shared;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shards::core::{ConstShard, MathAdd, PauseShard};

    fn simple_wire(name: &str, base: i64) -> Wire {
        let w = Wire::new(name);
        w.add_shard(Box::new(ConstShard::new(Value::Int(base)))).unwrap();
        w.add_shard(Box::new(MathAdd::new(Value::Int(1)))).unwrap();
        w
    }

    #[test]
    fn test_schedule_tick_terminate_leaves_nothing() {
        let mesh = Mesh::new();
        let w1 = simple_wire("one", 10);
        let w2 = simple_wire("two", 20);
        mesh.schedule(w1.clone(), Value::None, false).unwrap();
        mesh.schedule(w2.clone(), Value::None, false).unwrap();

        while mesh.tick() {}

        assert_eq!(w1.finished_output(), Value::Int(11));
        assert_eq!(w2.finished_output(), Value::Int(21));
        assert!(mesh.is_empty());

        mesh.terminate();
        assert!(mesh.is_empty());
        assert_eq!(mesh.ref_count(), 0);
    }

    #[test]
    fn test_schedule_is_idempotent_per_wire() {
        let mesh = Mesh::new();
        let w = simple_wire("once", 1);
        mesh.schedule(w.clone(), Value::None, false).unwrap();
        mesh.schedule(w.clone(), Value::None, false).unwrap();
        let mut ticks = 0;
        while mesh.tick() {
            ticks += 1;
            assert!(ticks < 100, "wire scheduled twice keeps mesh busy");
        }
        assert_eq!(w.finished_output(), Value::Int(2));
    }

    #[test]
    fn test_suspended_wire_respects_deadline() {
        let mesh = Mesh::new();
        let w = Wire::new("sleeper");
        w.add_shard(Box::new(ConstShard::new(Value::Int(5)))).unwrap();
        w.add_shard(Box::new(PauseShard::new(0.05))).unwrap();
        w.add_shard(Box::new(MathAdd::new(Value::Int(1)))).unwrap();
        mesh.schedule(w.clone(), Value::None, false).unwrap();

        let started = Instant::now();
        while mesh.tick() {
            mesh.sleep(0.005);
        }
        assert!(started.elapsed().as_secs_f64() >= 0.05);
        assert_eq!(w.finished_output(), Value::Int(6));
    }

    #[test]
    fn test_failed_wire_lands_in_error_log_and_mesh_keeps_going() {
        let mesh = Mesh::new();
        let ok = simple_wire("ok", 1);
        let bad = Wire::new("bad");
        bad.add_shard(Box::new(crate::shards::core::FailShard::new("broken"))).unwrap();

        mesh.schedule(bad.clone(), Value::None, false).unwrap();
        mesh.schedule(ok.clone(), Value::None, false).unwrap();
        while mesh.tick() {}

        assert!(bad.has_failed());
        assert_eq!(bad.finished_error().as_deref(), Some("broken"));
        assert_eq!(bad.finished_output(), Value::None);
        assert_eq!(ok.finished_output(), Value::Int(2));
        assert!(mesh.has_errors());
        assert!(mesh.errors()[0].contains("broken"));
    }

    #[test]
    fn test_unschedule_drops_the_slot_without_stopping() {
        let mesh = Mesh::new();
        let w = Wire::new("parked");
        w.set_looped(true);
        w.add_shard(Box::new(PauseShard::new(0.0))).unwrap();
        mesh.schedule(w.clone(), Value::None, false).unwrap();
        mesh.tick();
        assert!(w.is_running());

        mesh.unschedule(&w);
        assert!(mesh.is_empty());
        // the wire itself was not finalized
        assert!(w.is_running());
        w.stop();
    }

    #[test]
    fn test_external_variables_survive_and_release() {
        let mesh = Mesh::new();
        let host = mesh.alloc_external_variable("dial", Value::Float(0.5));
        assert!(mesh.get_ref("dial").is_some());

        mesh.terminate();
        // terminate cleared the mesh side; the host's handle still owns the value
        assert!(mesh.get_ref("dial").is_none());
        assert_eq!(crate::variables::var_get(&host), Value::Float(0.5));
    }
}
