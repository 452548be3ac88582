//! Wire: an ordered sequence of shards executed as a coroutine
//!
//! A `Wire` is a cheap-to-clone handle; all state sits behind the shared
//! `WireData`. Build it by appending shards, compose it, schedule it on a
//! mesh (or drive it by hand with `prepare`/`start`/`tick`).
//!
//! The execution body runs inside the wire's coroutine: warm up every shard
//! left to right on the first resume, then iterate activations until a
//! flow-control signal ends the run. Reaching a terminal state fires the
//! on-stop listeners (LIFO) and hands the flow back to the resumer, but
//! leaves the shards warm; `stop` is what runs cleanup right-to-left and
//! destroys the local variable table. A wire that ended on its own stays
//! warm until its mesh terminates or a user stops it — which is what lets
//! a detached wire outlive its parent.

use crate::context::{Context, Flow, FlowState};
use crate::coro::{Resume, WireCoro, Yield, Yielder};
use crate::error::{Result, RuntimeError};
use crate::mesh::{Mesh, WeakMesh};
use crate::shard::{ExposedInfo, Shard, ShardBox};
use crate::types::TypeInfo;
use crate::value::Value;
use crate::variables::{VarRef, VarSlot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

/// Wire lifecycle. `Pending` is the fresh, never-scheduled state; the
/// documented run cycle is Prepared → Starting → Iterating →
/// Ended | Failed | Stopped.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
    Pending = 0,
    Prepared = 1,
    Starting = 2,
    Iterating = 3,
    Ended = 4,
    Failed = 5,
    Stopped = 6,
}

impl WireState {
    fn from_u8(v: u8) -> WireState {
        match v {
            1 => WireState::Prepared,
            2 => WireState::Starting,
            3 => WireState::Iterating,
            4 => WireState::Ended,
            5 => WireState::Failed,
            6 => WireState::Stopped,
            _ => WireState::Pending,
        }
    }
}

type OnStopFn = Box<dyn FnOnce() + Send>;

pub struct WireData {
    name: Mutex<String>,
    shards: Mutex<Arc<Vec<ShardBox>>>,
    looped: AtomicBool,
    unsafe_wire: AtomicBool,
    root: AtomicBool,
    /// 0 means "use the runtime default".
    stack_size: AtomicUsize,
    state: AtomicU8,

    // composed artifacts
    input_type: Mutex<TypeInfo>,
    output_type: Mutex<TypeInfo>,
    composed_hash: Mutex<u128>,
    required: Mutex<Vec<ExposedInfo>>,
    deep_requirements: Mutex<HashMap<String, ExposedInfo>>,
    exposed_globals: Mutex<Vec<ExposedInfo>>,

    // run state
    variables: Mutex<HashMap<String, VarSlot>>,
    coro: Mutex<Option<WireCoro>>,
    flow: Mutex<Option<Flow>>,
    resumer: Mutex<Option<Wire>>,
    /// Parent wire stack injected before prepare by Step and the parallel
    /// runner, so nested contexts can resolve ancestor variables.
    seed_stack: Mutex<Vec<Wire>>,
    mesh: Mutex<WeakMesh>,
    start_input: Mutex<Value>,
    previous_output: Mutex<Value>,
    finished_output: Mutex<Value>,
    finished_error: Mutex<Option<String>>,
    on_stop: Mutex<Vec<OnStopFn>>,
    resume_at: Mutex<Option<Instant>>,
    /// Inline users currently holding this wire warm (Do/Dispatch).
    warmup_users: AtomicUsize,
    /// Shard cleanup ran for the current run; reset by prepare.
    cleaned: AtomicBool,
}

#[derive(Clone)]
pub struct Wire(Arc<WireData>);

#[derive(Clone, Default)]
pub struct WeakWire(Weak<WireData>);

impl WeakWire {
    pub fn upgrade(&self) -> Option<Wire> {
        self.0.upgrade().map(Wire)
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Wire({} {:?})", self.name(), self.state())
    }
}

impl Wire {
    pub fn new(name: impl Into<String>) -> Wire {
        Wire(Arc::new(WireData {
            name: Mutex::new(name.into()),
            shards: Mutex::new(Arc::new(Vec::new())),
            looped: AtomicBool::new(false),
            unsafe_wire: AtomicBool::new(false),
            root: AtomicBool::new(false),
            stack_size: AtomicUsize::new(0),
            state: AtomicU8::new(WireState::Pending as u8),
            input_type: Mutex::new(TypeInfo::Any),
            output_type: Mutex::new(TypeInfo::Any),
            composed_hash: Mutex::new(0),
            required: Mutex::new(Vec::new()),
            deep_requirements: Mutex::new(HashMap::new()),
            exposed_globals: Mutex::new(Vec::new()),
            variables: Mutex::new(HashMap::new()),
            coro: Mutex::new(None),
            flow: Mutex::new(None),
            resumer: Mutex::new(None),
            seed_stack: Mutex::new(Vec::new()),
            mesh: Mutex::new(WeakMesh::default()),
            start_input: Mutex::new(Value::None),
            previous_output: Mutex::new(Value::None),
            finished_output: Mutex::new(Value::None),
            finished_error: Mutex::new(None),
            on_stop: Mutex::new(Vec::new()),
            resume_at: Mutex::new(None),
            warmup_users: AtomicUsize::new(0),
            cleaned: AtomicBool::new(false),
        }))
    }

    pub fn downgrade(&self) -> WeakWire {
        WeakWire(Arc::downgrade(&self.0))
    }

    /// Identity: two handles to the same wire.
    pub fn same_wire(&self, other: &Wire) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    // ---- builder surface ----

    pub fn name(&self) -> String {
        self.0.name.lock().expect("wire lock poisoned").clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.name.lock().expect("wire lock poisoned") = name.into();
    }

    pub fn set_looped(&self, looped: bool) -> &Self {
        self.0.looped.store(looped, Ordering::Release);
        self
    }

    pub fn is_looped(&self) -> bool {
        self.0.looped.load(Ordering::Acquire)
    }

    pub fn set_unsafe(&self, v: bool) -> &Self {
        self.0.unsafe_wire.store(v, Ordering::Release);
        self
    }

    pub fn is_unsafe(&self) -> bool {
        self.0.unsafe_wire.load(Ordering::Acquire)
    }

    /// Root wires are compose entry points; the composer never recurses
    /// into one from another wire.
    pub fn set_root(&self, v: bool) -> &Self {
        self.0.root.store(v, Ordering::Release);
        self
    }

    pub fn is_root(&self) -> bool {
        self.0.root.load(Ordering::Acquire)
    }

    pub fn set_stack_size(&self, bytes: usize) -> &Self {
        self.0.stack_size.store(bytes, Ordering::Release);
        self
    }

    /// Append a shard; the wire owns it from here on.
    pub fn add_shard(&self, shard: ShardBox) -> Result<()> {
        let mut guard = self.0.shards.lock().expect("wire lock poisoned");
        match Arc::get_mut(&mut guard) {
            Some(list) => {
                list.push(shard);
                Ok(())
            }
            None => Err(RuntimeError::compose(format!(
                "cannot add shards to running wire {}",
                self.name()
            ))),
        }
    }

    pub fn remove_shard(&self, index: usize) -> Result<ShardBox> {
        let mut guard = self.0.shards.lock().expect("wire lock poisoned");
        match Arc::get_mut(&mut guard) {
            Some(list) if index < list.len() => Ok(list.remove(index)),
            Some(list) => Err(RuntimeError::compose(format!(
                "shard index {index} out of range ({} shards)",
                list.len()
            ))),
            None => Err(RuntimeError::compose(format!(
                "cannot remove shards from running wire {}",
                self.name()
            ))),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.0.shards.lock().expect("wire lock poisoned").len()
    }

    pub(crate) fn shards_arc(&self) -> Arc<Vec<ShardBox>> {
        self.0.shards.lock().expect("wire lock poisoned").clone()
    }

    /// Exclusive access for the composer. Fails while the wire runs.
    pub(crate) fn with_shards_mut<R>(
        &self,
        f: impl FnOnce(&mut Vec<ShardBox>) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.0.shards.lock().expect("wire lock poisoned");
        match Arc::get_mut(&mut guard) {
            Some(list) => f(list),
            None => Err(RuntimeError::compose(format!(
                "wire {} is in use and cannot be recomposed",
                self.name()
            ))),
        }
    }

    // ---- state ----

    pub fn state(&self) -> WireState {
        WireState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: WireState) {
        self.0.state.store(s as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), WireState::Starting | WireState::Iterating)
    }

    /// Prepared, starting, or iterating: the wire occupies a scheduler slot.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state(),
            WireState::Prepared | WireState::Starting | WireState::Iterating
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            WireState::Ended | WireState::Failed | WireState::Stopped
        )
    }

    pub fn has_ended(&self) -> bool {
        matches!(self.state(), WireState::Ended | WireState::Failed)
    }

    pub fn has_failed(&self) -> bool {
        self.state() == WireState::Failed
    }

    // ---- composed artifacts ----

    pub fn composed_hash(&self) -> u128 {
        *self.0.composed_hash.lock().expect("wire lock poisoned")
    }

    pub(crate) fn set_composed_hash(&self, h: u128) {
        *self.0.composed_hash.lock().expect("wire lock poisoned") = h;
    }

    /// Clearing the hash is the only way to permit a re-compose.
    pub fn clear_composed_hash(&self) {
        self.set_composed_hash(0);
    }

    pub fn input_type(&self) -> TypeInfo {
        self.0.input_type.lock().expect("wire lock poisoned").clone()
    }

    pub(crate) fn set_input_type(&self, t: TypeInfo) {
        *self.0.input_type.lock().expect("wire lock poisoned") = t;
    }

    pub fn output_type(&self) -> TypeInfo {
        self.0.output_type.lock().expect("wire lock poisoned").clone()
    }

    pub(crate) fn set_output_type(&self, t: TypeInfo) {
        *self.0.output_type.lock().expect("wire lock poisoned") = t;
    }

    pub fn required_variables(&self) -> Vec<ExposedInfo> {
        self.0.required.lock().expect("wire lock poisoned").clone()
    }

    pub(crate) fn set_required_variables(&self, req: Vec<ExposedInfo>) {
        *self.0.required.lock().expect("wire lock poisoned") = req;
    }

    pub fn deep_requirements(&self) -> HashMap<String, ExposedInfo> {
        self.0.deep_requirements.lock().expect("wire lock poisoned").clone()
    }

    pub(crate) fn add_deep_requirement(&self, info: ExposedInfo) {
        self.0
            .deep_requirements
            .lock()
            .expect("wire lock poisoned")
            .insert(info.name.clone(), info);
    }

    pub fn exposed_globals(&self) -> Vec<ExposedInfo> {
        self.0.exposed_globals.lock().expect("wire lock poisoned").clone()
    }

    pub(crate) fn set_exposed_globals(&self, e: Vec<ExposedInfo>) {
        *self.0.exposed_globals.lock().expect("wire lock poisoned") = e;
    }

    // ---- variables ----

    pub fn get_variable(&self, name: &str) -> Option<VarRef> {
        self.0
            .variables
            .lock()
            .expect("wire lock poisoned")
            .get(name)
            .map(|s| s.var.clone())
    }

    pub fn insert_variable(&self, name: &str, slot: VarSlot) -> VarRef {
        let var = slot.var.clone();
        self.0
            .variables
            .lock()
            .expect("wire lock poisoned")
            .insert(name.to_string(), slot);
        var
    }

    /// Clone a value into the wire's table before it runs (variable
    /// capture). Creates the slot if needed.
    pub fn inject_variable(&self, name: &str, value: Value) {
        let mut vars = self.0.variables.lock().expect("wire lock poisoned");
        match vars.get(name) {
            Some(slot) => crate::variables::var_set(&slot.var, value),
            None => {
                vars.insert(name.to_string(), VarSlot::new(value));
            }
        }
    }

    /// Host-owned variable: shared storage, never destroyed by the runtime.
    pub fn set_external_variable(&self, name: &str, var: VarRef) {
        self.0
            .variables
            .lock()
            .expect("wire lock poisoned")
            .insert(name.to_string(), VarSlot::external(var));
    }

    pub fn remove_external_variable(&self, name: &str) {
        let mut vars = self.0.variables.lock().expect("wire lock poisoned");
        if vars.get(name).map(|s| s.external).unwrap_or(false) {
            vars.remove(name);
        }
    }

    pub(crate) fn clear_local_variables(&self) {
        self.0
            .variables
            .lock()
            .expect("wire lock poisoned")
            .retain(|_, slot| slot.external);
    }

    // ---- run bookkeeping ----

    pub fn mesh(&self) -> WeakMesh {
        self.0.mesh.lock().expect("wire lock poisoned").clone()
    }

    pub(crate) fn set_mesh(&self, mesh: &Mesh) {
        *self.0.mesh.lock().expect("wire lock poisoned") = mesh.downgrade();
    }

    pub fn start_input(&self) -> Value {
        self.0.start_input.lock().expect("wire lock poisoned").clone()
    }

    pub(crate) fn set_start_input(&self, v: Value) {
        *self.0.start_input.lock().expect("wire lock poisoned") = v;
    }

    /// The last value this wire produced, updated at every iteration end;
    /// Step reads it between ticks.
    pub fn previous_output(&self) -> Value {
        self.0.previous_output.lock().expect("wire lock poisoned").clone()
    }

    pub(crate) fn set_previous_output(&self, v: Value) {
        *self.0.previous_output.lock().expect("wire lock poisoned") = v;
    }

    pub fn finished_output(&self) -> Value {
        self.0.finished_output.lock().expect("wire lock poisoned").clone()
    }

    pub fn finished_error(&self) -> Option<String> {
        self.0.finished_error.lock().expect("wire lock poisoned").clone()
    }

    pub(crate) fn set_resumer(&self, resumer: Option<Wire>) {
        *self.0.resumer.lock().expect("wire lock poisoned") = resumer;
    }

    pub(crate) fn resumer(&self) -> Option<Wire> {
        self.0.resumer.lock().expect("wire lock poisoned").clone()
    }

    pub(crate) fn set_seed_stack(&self, stack: Vec<Wire>) {
        *self.0.seed_stack.lock().expect("wire lock poisoned") = stack;
    }

    pub fn flow(&self) -> Option<Flow> {
        self.0.flow.lock().expect("wire lock poisoned").clone()
    }

    pub fn resume_at(&self) -> Option<Instant> {
        *self.0.resume_at.lock().expect("wire lock poisoned")
    }

    pub(crate) fn set_resume_at(&self, t: Option<Instant>) {
        *self.0.resume_at.lock().expect("wire lock poisoned") = t;
    }

    /// Register a stop listener. Listeners fire once, in LIFO order, when
    /// the wire finalizes.
    pub fn on_stop(&self, f: impl FnOnce() + Send + 'static) {
        self.0.on_stop.lock().expect("wire lock poisoned").push(Box::new(f));
    }

    pub fn clear_on_stop(&self) {
        self.0.on_stop.lock().expect("wire lock poisoned").clear();
    }

    pub(crate) fn inc_warmup_users(&self) -> usize {
        self.0.warmup_users.fetch_add(1, Ordering::AcqRel)
    }

    /// Saturating decrement: cleanup without a paired warmup must not wrap
    /// the user count. Returns the previous count.
    pub(crate) fn dec_warmup_users(&self) -> usize {
        let mut current = self.0.warmup_users.load(Ordering::Acquire);
        while current > 0 {
            match self.0.warmup_users.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current,
                Err(observed) => current = observed,
            }
        }
        0
    }

    // ---- lifecycle ----

    /// Bind to a flow and construct the coroutine. Idempotent while a
    /// coroutine exists.
    pub fn prepare(&self, flow: Option<Flow>) -> Result<()> {
        let mut coro_guard = self.0.coro.lock().expect("wire lock poisoned");
        if coro_guard.is_some() {
            if self.is_terminal() {
                // stale handle from a finished run; respawn
                *coro_guard = None;
            } else {
                return Ok(());
            }
        }
        let flow = flow.unwrap_or_else(|| Flow::new(self.clone()));
        *self.0.flow.lock().expect("wire lock poisoned") = Some(flow.clone());
        *self.0.finished_error.lock().expect("wire lock poisoned") = None;
        *self.0.finished_output.lock().expect("wire lock poisoned") = Value::None;
        self.set_resume_at(None);

        let stack_size = match self.0.stack_size.load(Ordering::Acquire) {
            0 => crate::coro::default_stack_size(),
            n => n,
        };

        let wire = self.clone();
        let coro = WireCoro::spawn(
            move |yielder, first| wire_runner(wire, flow, yielder, first),
            stack_size,
        )
        .map_err(|e| RuntimeError::warmup(format!("failed to spawn wire coroutine: {e}")))?;

        *coro_guard = Some(coro);
        self.0.cleaned.store(false, Ordering::Release);
        self.set_state(WireState::Prepared);
        Ok(())
    }

    /// Set the input and mark the wire ready to run; the first resume warms
    /// up every shard.
    pub fn start(&self, input: Value) {
        self.set_start_input(input);
        self.set_state(WireState::Starting);
    }

    /// Drive one cooperative step. Honors the suspend deadline.
    pub fn tick(&self, now: Instant) -> WireState {
        if !matches!(self.state(), WireState::Starting | WireState::Iterating) {
            return self.state();
        }
        if let Some(t) = self.resume_at() {
            if now < t {
                return self.state();
            }
        }
        let coro = self.0.coro.lock().expect("wire lock poisoned").clone();
        if let Some(coro) = coro {
            match coro.resume() {
                Yield::Suspended { until } => self.set_resume_at(until),
                Yield::Finished => self.clear_coro(),
            }
        }
        self.state()
    }

    /// Synchronous termination. A running wire is cancelled at its next
    /// suspension point; then (for any wire, including one that already
    /// ended on its own) shard cleanup runs right-to-left and the local
    /// variable table is destroyed. Returns the finished output.
    ///
    /// A wire that ends naturally stays warm until something stops it:
    /// inline users, the pool, or mesh termination. That is what lets a
    /// detached wire outlive the parent that scheduled it.
    pub fn stop(&self) -> Value {
        if !self.is_terminal() {
            let coro = self.0.coro.lock().expect("wire lock poisoned").clone();
            match coro {
                Some(coro) => {
                    coro.cancel();
                    self.clear_coro();
                }
                None => {
                    // never prepared
                    self.set_state(WireState::Stopped);
                    self.fire_on_stop();
                }
            }
        }
        self.finalize_cleanup();
        self.finished_output()
    }

    /// Run shard cleanup (right to left) and destroy wire-local variables,
    /// once per run. Safe only after the coroutine has exited.
    pub(crate) fn finalize_cleanup(&self) {
        if self.0.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        let shards = self.shards_arc();
        for s in shards.iter().rev() {
            s.cleanup();
        }
        self.clear_local_variables();
    }

    pub(crate) fn clear_coro(&self) {
        *self.0.coro.lock().expect("wire lock poisoned") = None;
    }

    pub(crate) fn has_coro(&self) -> bool {
        self.0.coro.lock().expect("wire lock poisoned").is_some()
    }

    pub(crate) fn fire_on_stop(&self) {
        let mut listeners = {
            let mut guard = self.0.on_stop.lock().expect("wire lock poisoned");
            std::mem::take(&mut *guard)
        };
        while let Some(f) = listeners.pop() {
            f();
        }
    }

    pub(crate) fn set_finished(&self, output: Value, error: Option<String>) {
        *self.0.finished_output.lock().expect("wire lock poisoned") = output;
        *self.0.finished_error.lock().expect("wire lock poisoned") = error;
    }

    /// Convenience for hosts and tests: schedule on a fresh mesh, tick to
    /// completion, terminate, and return the finished output.
    pub fn run(&self, input: Value) -> Result<Value> {
        let mesh = Mesh::new();
        mesh.schedule(self.clone(), input, false)?;
        while mesh.tick() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let result = match self.finished_error() {
            Some(err) => Err(RuntimeError::activation(err)),
            None => Ok(self.finished_output()),
        };
        mesh.terminate();
        result
    }
}

// ---- the coroutine body ----

enum RunOutcome {
    Ended(Value),
    Stopped(Value),
    Failed(String),
}

fn wire_runner(wire: Wire, flow: Flow, yielder: Yielder, first: Resume) {
    let mesh = wire.mesh();
    let shards = wire.shards_arc();

    if first == Resume::Cancel {
        tracing::debug!(wire = %wire.name(), "wire cancelled before start");
        finalize(&wire, &flow, RunOutcome::Stopped(Value::None));
        return;
    }

    let mut stack = {
        let mut seed = wire.0.seed_stack.lock().expect("wire lock poisoned");
        std::mem::take(&mut *seed)
    };
    stack.push(wire.clone());

    let mut ctx = Context::new(&yielder, wire.clone(), flow.clone(), mesh);
    ctx.wire_stack = stack;

    // warmup, left to right; a failure unwinds the warmed prefix
    let mut warmed = 0usize;
    let mut warmup_error: Option<String> = None;
    for s in shards.iter() {
        match s.warmup(&mut ctx) {
            Ok(()) => warmed += 1,
            Err(e) => {
                warmup_error = Some(e.message());
                break;
            }
        }
    }
    if let Some(msg) = warmup_error {
        tracing::error!(wire = %wire.name(), error = %msg, warmed, "warmup failed");
        wire.set_finished(Value::None, Some(msg));
        wire.set_state(WireState::Failed);
        wire.fire_on_stop();
        switch_back_to_resumer(&wire, &flow);
        return;
    }

    wire.set_state(WireState::Iterating);

    let outcome = 'run: loop {
        // a cancel or failure delivered while parked between iterations
        // lands here before any further activation
        match ctx.state() {
            FlowState::Stop => break 'run RunOutcome::Stopped(ctx.take_storage()),
            FlowState::Error => {
                break 'run RunOutcome::Failed(
                    ctx.take_error().unwrap_or_else(|| "activation failed".into()),
                )
            }
            _ => {}
        }

        let input = wire.start_input();
        let output = run_shard_seq(&shards, &mut ctx, &input);
        match ctx.state() {
            FlowState::Continue => {
                wire.set_previous_output(output.clone());
                if wire.is_looped() {
                    ctx.suspend(0.0);
                    continue 'run;
                }
                break 'run RunOutcome::Ended(output);
            }
            FlowState::Return => {
                ctx.continue_flow();
                wire.set_previous_output(output.clone());
                break 'run RunOutcome::Ended(output);
            }
            FlowState::Restart => {
                wire.set_start_input(ctx.take_storage());
                ctx.continue_flow();
                continue 'run;
            }
            FlowState::Rebase => {
                // rebase escaping the shard loop re-runs from the top with
                // the original start input
                ctx.continue_flow();
                continue 'run;
            }
            FlowState::Stop => break 'run RunOutcome::Stopped(ctx.take_storage()),
            FlowState::Error => {
                break 'run RunOutcome::Failed(
                    ctx.take_error().unwrap_or_else(|| "activation failed".into()),
                )
            }
        }
    };

    finalize(&wire, &flow, outcome);
}

// Terminal bookkeeping only: shard cleanup is deliberately NOT part of it.
// A wire that ends keeps its shards warm until `stop` (mesh termination,
// inline users, the pool) tears it down, so detached children and stepped
// wires survive the wires that spawned them.
fn finalize(wire: &Wire, flow: &Flow, outcome: RunOutcome) {
    let state = match &outcome {
        RunOutcome::Ended(_) => WireState::Ended,
        RunOutcome::Stopped(_) => WireState::Stopped,
        RunOutcome::Failed(_) => WireState::Failed,
    };
    match outcome {
        RunOutcome::Ended(out) | RunOutcome::Stopped(out) => wire.set_finished(out, None),
        RunOutcome::Failed(msg) => {
            tracing::warn!(wire = %wire.name(), error = %msg, "wire failed");
            wire.set_finished(Value::None, Some(msg));
        }
    }
    // listeners observe the terminal state
    wire.set_state(state);
    wire.fire_on_stop();
    switch_back_to_resumer(wire, flow);
    wire.set_resume_at(None);
}

fn switch_back_to_resumer(wire: &Wire, flow: &Flow) {
    if let Some(resumer) = {
        let mut guard = wire.0.resumer.lock().expect("wire lock poisoned");
        guard.take()
    } {
        if flow.current().same_wire(wire) {
            flow.set_current(resumer);
        }
    }
}

/// Activate a shard slice left to right, threading each output into the
/// next input. Rebase substitutes the iteration's start input and keeps
/// going; any other non-Continue state escapes to the caller, which
/// inspects the context. An activation error is recorded as Error state.
pub fn run_shard_seq<S>(shards: &[S], ctx: &mut Context<'_>, input: &Value) -> Value
where
    S: std::ops::Deref<Target = dyn Shard>,
{
    let start = input.clone();
    let mut current = start.clone();
    for s in shards.iter() {
        match s.activate(ctx, &current) {
            Ok(out) => current = out,
            Err(e) => {
                ctx.fail_flow(e.message());
                return current;
            }
        }
        match ctx.state() {
            FlowState::Continue => {}
            FlowState::Rebase => {
                current = start.clone();
                ctx.continue_flow();
            }
            _ => return current,
        }
    }
    current
}

/// Host-facing variant returning the resulting flow state.
pub fn run_shards<S>(shards: &[S], ctx: &mut Context<'_>, input: &Value) -> (FlowState, Value)
where
    S: std::ops::Deref<Target = dyn Shard>,
{
    let out = run_shard_seq(shards, ctx, input);
    (ctx.state(), out)
}

/// Like [`run_shards`], additionally folding a content hash over every
/// intermediate output. Hosts use the digest to detect divergent runs.
pub fn run_shards_hashed<S>(
    shards: &[S],
    ctx: &mut Context<'_>,
    input: &Value,
) -> (FlowState, Value, u128)
where
    S: std::ops::Deref<Target = dyn Shard>,
{
    let mut digest = weft_core::hash::Hash128::new();
    let start = input.clone();
    let mut current = start.clone();
    for s in shards.iter() {
        match s.activate(ctx, &current) {
            Ok(out) => current = out,
            Err(e) => {
                ctx.fail_flow(e.message());
                break;
            }
        }
        digest.update_hash(current.hash128());
        match ctx.state() {
            FlowState::Continue => {}
            FlowState::Rebase => {
                current = start.clone();
                ctx.continue_flow();
            }
            _ => break,
        }
    }
    (ctx.state(), current, digest.finish128())
}

/// Result of driving a sub-wire inline in the caller's coroutine.
pub(crate) struct SubWireResult {
    pub state: SubRunState,
    pub output: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubRunState {
    Running,
    Restarted,
    Stopped,
    Failed,
}

/// Run a target wire's shards inside the calling coroutine (Do, Recur).
/// The context keeps its flow-state so callers can forward flow stops.
pub(crate) fn run_sub_wire(wire: &Wire, ctx: &mut Context<'_>, input: &Value) -> SubWireResult {
    ctx.wire_stack.push(wire.clone());
    let shards = wire.shards_arc();
    let output = run_shard_seq(&shards, ctx, input);
    ctx.wire_stack.pop();
    wire.set_previous_output(output.clone());
    let state = match ctx.state() {
        FlowState::Restart => SubRunState::Restarted,
        FlowState::Stop => SubRunState::Stopped,
        FlowState::Error => SubRunState::Failed,
        _ => SubRunState::Running,
    };
    SubWireResult { state, output }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shards::core::{ConstShard, MathAdd};

    #[test]
    fn test_builder_surface() {
        let w = Wire::new("build");
        assert_eq!(w.name(), "build");
        w.set_name("renamed");
        assert_eq!(w.name(), "renamed");
        w.set_looped(true).set_unsafe(true);
        assert!(w.is_looped());
        assert!(w.is_unsafe());
        assert_eq!(w.state(), WireState::Pending);

        w.add_shard(Box::new(ConstShard::new(Value::Int(1)))).unwrap();
        w.add_shard(Box::new(MathAdd::new(Value::Int(2)))).unwrap();
        assert_eq!(w.shard_count(), 2);
        let removed = w.remove_shard(1).unwrap();
        assert_eq!(removed.name(), "Math.Add");
        assert_eq!(w.shard_count(), 1);
        assert!(w.remove_shard(9).is_err());
    }

    #[test]
    fn test_wire_identity() {
        let a = Wire::new("a");
        let b = a.clone();
        let c = Wire::new("a");
        assert!(a.same_wire(&b));
        assert!(!a.same_wire(&c));
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_stop_without_prepare_fires_listeners_lifo() {
        let w = Wire::new("idle");
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            w.on_stop(move || order.lock().unwrap().push(tag));
        }
        w.stop();
        assert_eq!(w.state(), WireState::Stopped);
        // LIFO: last registered runs first
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn test_run_shards_hashed_is_deterministic() {
        let coro = crate::coro::WireCoro::spawn(
            |y, _first| {
                let wire = Wire::new("hashed");
                let flow = Flow::new(wire.clone());
                let mut ctx = Context::new(&y, wire.clone(), flow.clone(), WeakMesh::default());

                let shards: Vec<ShardBox> = vec![
                    Box::new(ConstShard::new(Value::Int(2))),
                    Box::new(MathAdd::new(Value::Int(3))),
                ];
                let (state, out, digest) = run_shards_hashed(&shards, &mut ctx, &Value::None);
                assert_eq!(state, FlowState::Continue);
                assert_eq!(out, Value::Int(5));

                let (_, out2, digest2) = run_shards_hashed(&shards, &mut ctx, &Value::None);
                assert_eq!(out2, Value::Int(5));
                assert_eq!(digest, digest2);

                let diverged: Vec<ShardBox> = vec![
                    Box::new(ConstShard::new(Value::Int(9))),
                    Box::new(MathAdd::new(Value::Int(3))),
                ];
                let (_, _, digest3) = run_shards_hashed(&diverged, &mut ctx, &Value::None);
                assert_ne!(digest, digest3);
            },
            crate::coro::default_stack_size(),
        )
        .unwrap();
        assert_eq!(coro.resume(), Yield::Finished);
    }

    #[test]
    fn test_variable_injection_and_teardown() {
        let w = Wire::new("vars");
        w.inject_variable("n", Value::Int(5));
        assert!(w.get_variable("n").is_some());

        let host_var = crate::variables::make_var(Value::string("host"));
        w.set_external_variable("h", host_var.clone());

        w.clear_local_variables();
        assert!(w.get_variable("n").is_none(), "locals are destroyed");
        assert!(w.get_variable("h").is_some(), "external slots survive");

        w.remove_external_variable("h");
        assert!(w.get_variable("h").is_none());
        // the host's own reference is untouched
        assert_eq!(crate::variables::var_get(&host_var), Value::string("host"));
    }
}
