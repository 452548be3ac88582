//! Wire control shards: Do, Detach, Step, Resume, Start, Wait, Stop,
//! Recur, Branch
//!
//! They all share the `WireBase` contract: a target wire reference (a
//! literal, a globally published name, or a variable), a run mode, a
//! passthrough flag, and a capturing flag. Compose resolves the target,
//! composes it with the descendant-visible scope, and synthesizes the
//! capture list from the target's deep requirements; activation then picks
//! inline, detached, stepped, or flow-switching semantics per shard.

use crate::context::{Context, FlowState};
use crate::error::{Result, RuntimeError};
use crate::mesh::Mesh;
use crate::shard::{ExposedInfo, InstanceData, ParameterInfo, Shard};
use crate::types::TypeInfo;
use crate::value::{Value, ValueKind};
use crate::variables::{var_get, ParamVar, VarRef};
use crate::wire::{run_sub_wire, SubRunState, Wire};
use std::sync::Mutex;
use std::time::Instant;

/// How a control shard drives its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Inline,
    Detached,
    Stepped,
}

/// Capture directives: variable names resolved at warmup and cloned into
/// the target's table right before it runs.
#[derive(Default)]
pub(crate) struct Captures {
    names: Mutex<Vec<String>>,
    bindings: Mutex<Vec<(String, VarRef)>>,
}

impl Clone for Captures {
    fn clone(&self) -> Self {
        Captures {
            names: Mutex::new(self.names.lock().expect("captures lock poisoned").clone()),
            bindings: Mutex::new(Vec::new()),
        }
    }
}

impl Captures {
    pub(crate) fn set_names(&self, names: Vec<String>) {
        *self.names.lock().expect("captures lock poisoned") = names;
    }

    pub(crate) fn warmup(&self, ctx: &mut Context<'_>) {
        let names = self.names.lock().expect("captures lock poisoned").clone();
        let mut bindings = Vec::with_capacity(names.len());
        for name in names {
            let var = ctx.reference_variable(&name);
            bindings.push((name, var));
        }
        *self.bindings.lock().expect("captures lock poisoned") = bindings;
    }

    pub(crate) fn cleanup(&self) {
        self.bindings.lock().expect("captures lock poisoned").clear();
    }

    pub(crate) fn inject(&self, target: &Wire) {
        for (name, var) in self.bindings.lock().expect("captures lock poisoned").iter() {
            target.inject_variable(name, var_get(var));
        }
    }
}

/// The shared contract of every wire control shard.
pub(crate) struct WireBase {
    pub(crate) wireref: ParamVar,
    pub(crate) wire: Mutex<Option<Wire>>,
    pub(crate) passthrough: bool,
    pub(crate) capturing: bool,
    pub(crate) mode: RunMode,
    pub(crate) captures: Captures,
    /// Requirements this shard surfaces to its own wire's composer.
    surfaced_required: Mutex<Vec<ExposedInfo>>,
    /// Globals the composed target exposes (visible only in inline mode).
    surfaced_exposed: Mutex<Vec<ExposedInfo>>,
}

impl Default for WireBase {
    fn default() -> Self {
        WireBase {
            wireref: ParamVar::default(),
            wire: Mutex::new(None),
            passthrough: false,
            capturing: false,
            mode: RunMode::Inline,
            captures: Captures::default(),
            surfaced_required: Mutex::new(Vec::new()),
            surfaced_exposed: Mutex::new(Vec::new()),
        }
    }
}

impl Clone for WireBase {
    fn clone(&self) -> Self {
        WireBase {
            wireref: self.wireref.clone(),
            // target references are shared, they are identity not state
            wire: Mutex::new(self.wire.lock().expect("wire base lock poisoned").clone()),
            passthrough: self.passthrough,
            capturing: self.capturing,
            mode: self.mode,
            captures: self.captures.clone(),
            surfaced_required: Mutex::new(
                self.surfaced_required.lock().expect("wire base lock poisoned").clone(),
            ),
            surfaced_exposed: Mutex::new(
                self.surfaced_exposed.lock().expect("wire base lock poisoned").clone(),
            ),
        }
    }
}

impl WireBase {
    pub(crate) fn wire_param_types() -> Vec<TypeInfo> {
        vec![
            TypeInfo::Wire,
            TypeInfo::String,
            TypeInfo::None,
            TypeInfo::ContextVar { of: vec![TypeInfo::Wire] },
        ]
    }

    pub(crate) fn target(&self) -> Option<Wire> {
        self.wire.lock().expect("wire base lock poisoned").clone()
    }

    pub(crate) fn set_target(&self, wire: Option<Wire>) {
        *self.wire.lock().expect("wire base lock poisoned") = wire;
    }

    /// Static resolution at compose time: literal wire or published name.
    /// Variable references stay unresolved until warmup.
    pub(crate) fn resolve_static(&self) {
        if self.target().is_some() {
            return;
        }
        match self.wireref.raw() {
            Value::Wire(w) => self.set_target(Some(w)),
            Value::String(name) => self.set_target(crate::registry::get_global_wire(&name)),
            _ => {}
        }
    }

    /// Runtime resolution, including variables bound at warmup.
    pub(crate) fn resolve_runtime(&self) -> Option<Wire> {
        if let Some(w) = self.target() {
            return Some(w);
        }
        match self.wireref.get() {
            Value::Wire(w) => {
                self.set_target(Some(w.clone()));
                Some(w)
            }
            Value::String(name) => {
                let found = crate::registry::get_global_wire(&name);
                self.set_target(found.clone());
                found
            }
            _ => None,
        }
    }

    pub(crate) fn requirement_for_variable(&self) -> Vec<ExposedInfo> {
        match self.wireref.variable_name() {
            Some(name) => vec![ExposedInfo::new(name, TypeInfo::Wire)],
            None => Vec::new(),
        }
    }

    /// The compose-time rules every wire-running shard shares. Returns the
    /// shard's own output type.
    pub(crate) fn compose(&self, data: &InstanceData) -> Result<TypeInfo> {
        self.resolve_static();

        let wire = match self.target() {
            Some(w) => w,
            None => {
                tracing::debug!("wire control shard composing with no target");
                return Ok(data.input_type.clone());
            }
        };

        // self references resolve later; the output is not knowable here
        if let Some(host) = &data.wire {
            if host.same_wire(&wire) {
                return Ok(data.input_type.clone());
            }
            if let Some(mesh) = host.mesh().upgrade() {
                wire.set_mesh(&mesh);
            }
        }

        if wire.is_root() {
            return Ok(data.input_type.clone());
        }

        let mesh = wire.mesh().upgrade();

        // record the target before recursing so mutually-referencing wires
        // terminate
        if let Some(mesh) = &mesh {
            if self.passthrough {
                mesh.visited_insert(wire.id(), data.input_type.clone());
            } else if self.mode == RunMode::Stepped {
                mesh.visited_insert(wire.id(), TypeInfo::Any);
            }
        }

        let mut sub = data.clone();
        sub.input_type = data.input_type.clone();
        // a passthrough or stepped reference to an already composed wire
        // does not feed it this call's input, so the cache check must see
        // the recorded type
        if wire.composed_hash() != 0 && (self.passthrough || self.mode == RunMode::Stepped) {
            sub.input_type = wire.input_type();
        }
        if self.mode == RunMode::Detached && !self.capturing {
            // a plain detached target only sees mesh-wide globals
            sub.shared = data.shared.iter().filter(|e| e.global).cloned().collect();
        } else {
            sub.shared = data.shared.clone();
        }
        let sink: crate::shard::RequirementSink = Default::default();
        sub.required_sink = Some(sink.clone());

        let result = crate::compose::compose_wire(&wire, &sub)?;

        // synthesize capture directives from the deep requirements the
        // caller can satisfy with locals
        if self.capturing {
            let requirements = sink.lock().expect("requirement sink poisoned");
            let mut names = Vec::new();
            let mut surfaced = Vec::new();
            for avail in data.shared.iter() {
                if let Some(req) = requirements.get(&avail.name) {
                    if !avail.global {
                        tracing::trace!(variable = %avail.name, wire = %wire.name(), "capturing variable");
                        names.push(avail.name.clone());
                        surfaced.push(req.clone());
                    }
                }
            }
            self.captures.set_names(names);
            *self.surfaced_required.lock().expect("wire base lock poisoned") = surfaced;
        } else {
            *self.surfaced_required.lock().expect("wire base lock poisoned") =
                result.required.clone();
        }

        *self.surfaced_exposed.lock().expect("wire base lock poisoned") =
            result.exposed.iter().filter(|e| e.global).cloned().collect();

        let output = if self.passthrough {
            data.input_type.clone()
        } else {
            match self.mode {
                RunMode::Inline => result.output_type.clone(),
                RunMode::Stepped => TypeInfo::Any,
                RunMode::Detached => data.input_type.clone(),
            }
        };

        if !self.passthrough && self.mode != RunMode::Stepped {
            if let Some(mesh) = &mesh {
                mesh.visited_insert(wire.id(), output.clone());
            }
        }

        Ok(output)
    }

    pub(crate) fn surfaced_required(&self) -> Vec<ExposedInfo> {
        let mut reqs = self.surfaced_required.lock().expect("wire base lock poisoned").clone();
        reqs.extend(self.requirement_for_variable());
        reqs
    }

    pub(crate) fn surfaced_exposed(&self) -> Vec<ExposedInfo> {
        if self.mode == RunMode::Inline {
            self.surfaced_exposed.lock().expect("wire base lock poisoned").clone()
        } else {
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------

/// Inline sub-wire execution: Do (output = target output) and Dispatch
/// (passthrough).
#[derive(Clone)]
pub struct DoShard {
    base: WireBase,
    dispatch: bool,
}

impl DoShard {
    pub fn new_do() -> Self {
        DoShard { base: WireBase::default(), dispatch: false }
    }

    pub fn new_dispatch() -> Self {
        let mut base = WireBase::default();
        base.passthrough = true;
        DoShard { base, dispatch: true }
    }

    pub fn with_wire(target: Wire) -> Self {
        let shard = DoShard::new_do();
        shard.base.wireref.set(Value::Wire(target));
        shard
    }
}

impl Shard for DoShard {
    fn name(&self) -> &'static str {
        if self.dispatch {
            "Dispatch"
        } else {
            "Do"
        }
    }

    fn help(&self) -> &'static str {
        "Runs another wire inline in the current coroutine."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Wire", "The wire to run.", WireBase::wire_param_types())]
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

    fn exposed_variables(&self) -> Vec<ExposedInfo> {
        self.base.surfaced_exposed()
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        self.base.compose(data).map(Some)
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.base.wireref.warmup(ctx)?;
        if let Some(wire) = self.base.resolve_runtime() {
            // first inline user warms the target's shards
            if wire.inc_warmup_users() == 0 {
                let shards = wire.shards_arc();
                ctx.wire_stack.push(wire.clone());
                for s in shards.iter() {
                    if let Err(e) = s.warmup(ctx) {
                        ctx.wire_stack.pop();
                        return Err(e);
                    }
                }
                ctx.wire_stack.pop();
            }
        }
        Ok(())
    }

    fn cleanup(&self) {
        if let Some(wire) = self.base.target() {
            if wire.dec_warmup_users() == 1 {
                let shards = wire.shards_arc();
                for s in shards.iter().rev() {
                    s.cleanup();
                }
                wire.clear_local_variables();
            }
        }
        self.base.wireref.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let wire = match self.base.resolve_runtime() {
            Some(w) => w,
            None => return Ok(input.clone()),
        };

        if wire.is_looped() {
            return self.activate_loop(ctx, &wire, input);
        }

        let res = run_sub_wire(&wire, ctx, input);
        if res.state == SubRunState::Stopped {
            // a (Stop) inside the target ends the target, not the caller
            ctx.continue_flow();
        }
        if self.base.passthrough {
            Ok(input.clone())
        } else {
            Ok(res.output)
        }
    }
}

impl DoShard {
    fn activate_loop(&self, ctx: &mut Context<'_>, wire: &Wire, input: &Value) -> Result<Value> {
        let mut current = input.clone();
        loop {
            let res = run_sub_wire(wire, ctx, &current);
            match res.state {
                SubRunState::Failed => {
                    // error state propagates to the caller
                    return Ok(res.output);
                }
                SubRunState::Restarted => {
                    current = ctx.take_storage();
                    ctx.continue_flow();
                    if ctx.suspend(0.0) != FlowState::Continue {
                        return Ok(res.output);
                    }
                }
                SubRunState::Running if ctx.should_continue() => {
                    if ctx.suspend(0.0) != FlowState::Continue {
                        return Ok(res.output);
                    }
                }
                SubRunState::Stopped => {
                    ctx.continue_flow();
                    return Ok(if self.base.passthrough { input.clone() } else { res.output });
                }
                _ => {
                    // Return escapes to the caller untouched
                    return Ok(if self.base.passthrough { input.clone() } else { res.output });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------

/// Schedule the target on the caller's mesh and move on immediately.
#[derive(Clone)]
pub struct DetachShard {
    base: WireBase,
}

impl Default for DetachShard {
    fn default() -> Self {
        let mut base = WireBase::default();
        base.mode = RunMode::Detached;
        base.passthrough = true;
        base.capturing = true;
        DetachShard { base }
    }
}

impl DetachShard {
    pub fn with_wire(target: Wire) -> Self {
        let shard = DetachShard::default();
        shard.base.wireref.set(Value::Wire(target));
        shard
    }
}

impl Shard for DetachShard {
    fn name(&self) -> &'static str {
        "Detach"
    }

    fn help(&self) -> &'static str {
        "Schedules another wire on the same mesh and returns its own input."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Wire", "The wire to detach.", WireBase::wire_param_types())]
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
        self.base.compose(data).map(Some)
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.base.wireref.warmup(ctx)?;
        self.base.captures.warmup(ctx);
        Ok(())
    }

    fn cleanup(&self) {
        if let Some(wire) = self.base.target() {
            wire.stop();
        }
        self.base.captures.cleanup();
        self.base.wireref.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let wire = self
            .base
            .resolve_runtime()
            .ok_or_else(|| RuntimeError::WireNotFound("Detach target".into()))?;
        self.base.captures.inject(&wire);
        if !wire.is_running() {
            let mesh = ctx
                .mesh
                .upgrade()
                .ok_or_else(|| RuntimeError::activation("Detach: no mesh available"))?;
            mesh.schedule(wire, input.clone(), false)?;
        }
        Ok(input.clone())
    }
}

// ---------------------------------------------------------------------------

/// Drive the target as a child coroutine on its own flow, one cooperative
/// step per activation.
#[derive(Clone)]
pub struct StepShard {
    base: WireBase,
}

impl Default for StepShard {
    fn default() -> Self {
        let mut base = WireBase::default();
        base.mode = RunMode::Stepped;
        StepShard { base }
    }
}

impl StepShard {
    pub fn with_wire(target: Wire) -> Self {
        let shard = StepShard::default();
        shard.base.wireref.set(Value::Wire(target));
        shard
    }
}

impl Shard for StepShard {
    fn name(&self) -> &'static str {
        "Step"
    }

    fn help(&self) -> &'static str {
        "Advances another wire by one cooperative step per activation."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Wire", "The wire to step.", WireBase::wire_param_types())]
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
        self.base.compose(data).map(Some)
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.base.wireref.warmup(ctx)
    }

    fn cleanup(&self) {
        if let Some(wire) = self.base.target() {
            wire.stop();
        }
        self.base.wireref.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let wire = self
            .base
            .resolve_runtime()
            .ok_or_else(|| RuntimeError::WireNotFound("Step target".into()))?;

        // a terminated target restarts from the top; never re-composes
        if wire.is_terminal() {
            wire.stop();
            wire.clear_coro();
        }

        if !wire.has_coro() {
            if let Some(mesh) = ctx.mesh.upgrade() {
                wire.set_mesh(&mesh);
            }
            wire.set_seed_stack(ctx.wire_stack.clone());
            wire.prepare(None)?;
        }

        if !wire.is_running() {
            wire.start(input.clone());
        }

        wire.tick(Instant::now());

        if self.base.passthrough {
            Ok(input.clone())
        } else {
            Ok(wire.previous_output())
        }
    }
}

// ---------------------------------------------------------------------------

/// Switch the flow to another wire; the caller parks inside this shard
/// until something switches back. `Start` always restarts the target from
/// the top.
#[derive(Clone)]
pub struct ResumeShard {
    base: WireBase,
    restart: bool,
}

impl ResumeShard {
    pub fn new_resume() -> Self {
        let mut base = WireBase::default();
        base.mode = RunMode::Detached;
        base.passthrough = true;
        base.capturing = true;
        ResumeShard { base, restart: false }
    }

    pub fn new_start() -> Self {
        let mut shard = ResumeShard::new_resume();
        shard.restart = true;
        shard
    }

    pub fn with_wire(target: Wire, restart: bool) -> Self {
        let shard = if restart { Self::new_start() } else { Self::new_resume() };
        shard.base.wireref.set(Value::Wire(target));
        shard
    }
}

impl Shard for ResumeShard {
    fn name(&self) -> &'static str {
        if self.restart {
            "Start"
        } else {
            "Resume"
        }
    }

    fn help(&self) -> &'static str {
        "Switches flow execution to another wire and suspends the current one."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Wire", "The wire to switch to.", WireBase::wire_param_types())]
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
        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.base.wireref.warmup(ctx)?;
        self.base.captures.warmup(ctx);
        Ok(())
    }

    fn cleanup(&self) {
        // other wires may still resume the target; never stop it here
        self.base.captures.cleanup();
        self.base.wireref.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let current = ctx.current_wire();

        let target = match self.base.resolve_runtime() {
            Some(w) => w,
            // with no explicit target, switch back to whoever resumed us
            None => current.resumer().ok_or_else(|| {
                RuntimeError::WireNotFound(format!("{}: no target and no resumer", self.name()))
            })?,
        };

        ctx.flow.set_current(target.clone());

        if self.restart {
            target.stop();
            target.clear_coro();
        } else if target.has_ended() {
            // allow re-running an ended wire
            target.stop();
            target.clear_coro();
        }

        if !target.has_coro() {
            if let Some(mesh) = ctx.mesh.upgrade() {
                target.set_mesh(&mesh);
            }
            target.prepare(Some(ctx.flow.clone()))?;
        }

        if target.resumer().is_none() {
            target.set_resumer(Some(current));
        }

        self.base.captures.inject(&target);

        if !target.is_running() {
            target.start(input.clone());
        }

        // parks here; the mesh resumes the target on its next tick and
        // comes back when something switches the flow to us again
        ctx.suspend(0.0);

        target.set_resumer(None);
        Ok(input.clone())
    }
}

// ---------------------------------------------------------------------------

/// Suspend until the target wire reaches a terminal state, then surface
/// its output (or error).
#[derive(Clone)]
pub struct WaitShard {
    base: WireBase,
}

impl Default for WaitShard {
    fn default() -> Self {
        WaitShard { base: WireBase::default() }
    }
}

impl WaitShard {
    pub fn with_wire(target: Wire) -> Self {
        let shard = WaitShard::default();
        shard.base.wireref.set(Value::Wire(target));
        shard
    }

    pub fn for_variable(name: &str) -> Self {
        let shard = WaitShard::default();
        shard.base.wireref.set(Value::context_var(name));
        shard
    }

    pub fn passthrough(mut self, v: bool) -> Self {
        self.base.passthrough = v;
        self
    }
}

impl Shard for WaitShard {
    fn name(&self) -> &'static str {
        "Wait"
    }

    fn help(&self) -> &'static str {
        "Waits for another wire to complete before resuming execution."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo::new("Wire", "The wire to wait for.", WireBase::wire_param_types()),
            ParameterInfo::new("Passthrough", "Output this shard's input.", vec![TypeInfo::Bool]),
        ]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match (index, value) {
            (0, v) => {
                self.base.wireref.set(v.clone());
                self.base.set_target(None);
                Ok(())
            }
            (1, Value::Bool(b)) => {
                self.base.passthrough = *b;
                Ok(())
            }
            (1, other) => Err(RuntimeError::invalid_var_type(format!(
                "Wait Passthrough expects Bool, got {}",
                other.kind()
            ))),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(self.base.wireref.raw()),
            1 => Ok(Value::Bool(self.base.passthrough)),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn required_variables(&self) -> Vec<ExposedInfo> {
        self.base.requirement_for_variable()
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        self.base.compose(data).map(Some)
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.base.wireref.warmup(ctx)
    }

    fn cleanup(&self) {
        if self.base.wireref.is_variable() {
            self.base.set_target(None);
        }
        self.base.wireref.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let wire = match self.base.resolve_runtime() {
            Some(w) => w,
            None => {
                tracing::warn!("Wait target is void");
                return Ok(input.clone());
            }
        };

        // every wait is a park-and-recheck loop, including self-waits
        while !wire.is_terminal() {
            if ctx.suspend(0.0) != FlowState::Continue {
                return Ok(input.clone());
            }
        }

        if let Some(err) = wire.finished_error() {
            // a failed target fails the waiter unless a recovery shard wraps it
            return Err(RuntimeError::activation(err));
        }

        if self.base.passthrough {
            Ok(input.clone())
        } else {
            Ok(wire.finished_output())
        }
    }
}

// ---------------------------------------------------------------------------

/// Halt a target wire, or the current one when no target is given.
#[derive(Clone)]
pub struct StopShard {
    base: WireBase,
}

impl Default for StopShard {
    fn default() -> Self {
        let mut base = WireBase::default();
        base.passthrough = true;
        StopShard { base }
    }
}

impl StopShard {
    pub fn with_wire(target: Wire) -> Self {
        let shard = StopShard::default();
        shard.base.wireref.set(Value::Wire(target));
        shard
    }

    pub fn passthrough(mut self, v: bool) -> Self {
        self.base.passthrough = v;
        self
    }
}

impl Shard for StopShard {
    fn name(&self) -> &'static str {
        "Stop"
    }

    fn help(&self) -> &'static str {
        "Stops another wire, or the current wire when none is given."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo::new("Wire", "The wire to stop.", WireBase::wire_param_types()),
            ParameterInfo::new("Passthrough", "Output this shard's input.", vec![TypeInfo::Bool]),
        ]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match (index, value) {
            (0, v) => {
                self.base.wireref.set(v.clone());
                self.base.set_target(None);
                Ok(())
            }
            (1, Value::Bool(b)) => {
                self.base.passthrough = *b;
                Ok(())
            }
            (1, other) => Err(RuntimeError::invalid_var_type(format!(
                "Stop Passthrough expects Bool, got {}",
                other.kind()
            ))),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(self.base.wireref.raw()),
            1 => Ok(Value::Bool(self.base.passthrough)),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn required_variables(&self) -> Vec<ExposedInfo> {
        self.base.requirement_for_variable()
    }

    fn is_flow_stopper(&self) -> bool {
        // only a targetless Stop ends the current wire's dataflow
        matches!(self.base.wireref.raw(), Value::None)
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        self.base.compose(data)?;
        // stopping the current wire: the input becomes the wire's final
        // output, so the types must line up
        if matches!(self.base.wireref.raw(), Value::None) {
            if let Some(host) = &data.wire {
                let out = host.output_type();
                if host.composed_hash() != 0
                    && !data.input_type.matches(&out)
                    && !matches!(out, TypeInfo::Any)
                {
                    return Err(RuntimeError::compose(
                        "Stop input must match the wire's output type",
                    ));
                }
            }
        }
        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.base.wireref.warmup(ctx)
    }

    fn cleanup(&self) {
        if self.base.wireref.is_variable() {
            self.base.set_target(None);
        }
        self.base.wireref.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        match self.base.resolve_runtime() {
            None => {
                ctx.stop_flow(input.clone());
                Ok(input.clone())
            }
            Some(wire) => {
                // stopping any wire on our own call stack must go through
                // the flow signal, not a synchronous cancel
                if ctx.wire_stack.iter().any(|w| w.same_wire(&wire)) {
                    ctx.stop_flow(input.clone());
                    return Ok(input.clone());
                }
                let out = wire.stop();
                if self.base.passthrough {
                    Ok(input.clone())
                } else {
                    Ok(out)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------

/// Re-enter the current wire from its first shard, saving wire-local
/// variables on an implicit stack across the recursion.
#[derive(Default)]
pub struct RecurShard {
    target: Mutex<Option<Wire>>,
    names: Mutex<Vec<String>>,
    bindings: Mutex<Vec<(String, VarRef)>>,
    storage: Mutex<Vec<Vec<Value>>>,
}

impl Clone for RecurShard {
    fn clone(&self) -> Self {
        RecurShard {
            target: Mutex::new(self.target.lock().expect("recur lock poisoned").clone()),
            names: Mutex::new(self.names.lock().expect("recur lock poisoned").clone()),
            bindings: Mutex::new(Vec::new()),
            storage: Mutex::new(Vec::new()),
        }
    }
}

impl Shard for RecurShard {
    fn name(&self) -> &'static str {
        "Recur"
    }

    fn help(&self) -> &'static str {
        "Re-enters the current wire from the top, preserving its locals."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        let wire = data
            .wire
            .clone()
            .ok_or_else(|| RuntimeError::compose("Recur must compose inside a wire"))?;
        *self.target.lock().expect("recur lock poisoned") = Some(wire);

        // every non-global visible variable gets saved across the recursion
        let names: Vec<String> = data
            .shared
            .iter()
            .filter(|e| !e.global)
            .map(|e| e.name.clone())
            .collect();
        *self.names.lock().expect("recur lock poisoned") = names;

        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        let names = self.names.lock().expect("recur lock poisoned").clone();
        let mut bindings = Vec::with_capacity(names.len());
        for name in &names {
            bindings.push((name.clone(), ctx.reference_variable(name)));
        }
        *self.storage.lock().expect("recur lock poisoned") = vec![Vec::new(); bindings.len()];
        *self.bindings.lock().expect("recur lock poisoned") = bindings;
        Ok(())
    }

    fn cleanup(&self) {
        self.bindings.lock().expect("recur lock poisoned").clear();
        self.storage.lock().expect("recur lock poisoned").clear();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let wire = self
            .target
            .lock()
            .expect("recur lock poisoned")
            .clone()
            .ok_or_else(|| RuntimeError::activation("Recur has no wire"))?;

        // push frame
        {
            let bindings = self.bindings.lock().expect("recur lock poisoned");
            let mut storage = self.storage.lock().expect("recur lock poisoned");
            for (i, (_, var)) in bindings.iter().enumerate() {
                storage[i].push(var_get(var));
            }
        }

        // no locks held across the re-entry
        let res = run_sub_wire(&wire, ctx, input);

        // pop frame
        {
            let bindings = self.bindings.lock().expect("recur lock poisoned");
            let mut storage = self.storage.lock().expect("recur lock poisoned");
            for (i, (_, var)) in bindings.iter().enumerate() {
                if let Some(saved) = storage[i].pop() {
                    crate::variables::var_set(var, saved);
                }
            }
        }

        Ok(res.output)
    }
}

// ---------------------------------------------------------------------------

/// A private child mesh driven one tick per activation. Children inherit
/// the parent's exposed scope; their requirements are referenced from the
/// parent at warmup and injected as mesh refs.
pub struct BranchShard {
    wires_param: Value,
    mesh: Mesh,
    run_wires: Mutex<Vec<Wire>>,
    merged_required: Mutex<Vec<ExposedInfo>>,
}

impl Default for BranchShard {
    fn default() -> Self {
        BranchShard {
            wires_param: Value::None,
            mesh: Mesh::new(),
            run_wires: Mutex::new(Vec::new()),
            merged_required: Mutex::new(Vec::new()),
        }
    }
}

impl Clone for BranchShard {
    fn clone(&self) -> Self {
        // clones own a fresh child mesh; compose rebuilds the rest
        BranchShard {
            wires_param: self.wires_param.clone(),
            mesh: Mesh::new(),
            run_wires: Mutex::new(Vec::new()),
            merged_required: Mutex::new(
                self.merged_required.lock().expect("branch lock poisoned").clone(),
            ),
        }
    }
}

impl BranchShard {
    pub fn with_wires(wires: Vec<Wire>) -> Self {
        let mut shard = BranchShard::default();
        shard.wires_param = Value::Seq(wires.into_iter().map(Value::Wire).collect());
        shard
    }

    /// The child scheduler, for hosts that want to observe branch wires.
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    fn compose_sub_wire(&self, data: &InstanceData, wire: &Wire) -> Result<()> {
        wire.set_mesh(&self.mesh);

        let mut sub = data.clone();
        sub.wire = Some(wire.clone());
        let sink: crate::shard::RequirementSink = Default::default();
        sub.required_sink = Some(sink.clone());

        let result = crate::compose::compose_wire(wire, &sub)?;

        let mut merged = self.merged_required.lock().expect("branch lock poisoned");
        for req in result.required {
            if !merged.iter().any(|r| r.name == req.name) {
                merged.push(req);
            }
        }
        let requirements = sink.lock().expect("requirement sink poisoned");
        for avail in data.shared.iter() {
            if requirements.contains_key(&avail.name)
                && !merged.iter().any(|r| r.name == avail.name)
            {
                merged.push(avail.clone());
            }
        }
        drop(requirements);

        self.run_wires.lock().expect("branch lock poisoned").push(wire.clone());
        Ok(())
    }
}

impl Shard for BranchShard {
    fn name(&self) -> &'static str {
        "Branch"
    }

    fn help(&self) -> &'static str {
        "A child mesh that runs one tick for every activation of this shard."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new(
            "Wires",
            "The wires to schedule on this branch.",
            vec![TypeInfo::Wire, TypeInfo::seq_of(vec![TypeInfo::Wire]), TypeInfo::None],
        )]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match index {
            0 => match value {
                Value::None | Value::Wire(_) => {
                    self.wires_param = value.clone();
                    Ok(())
                }
                Value::Seq(items) if items.iter().all(|v| v.kind() == ValueKind::Wire) => {
                    self.wires_param = value.clone();
                    Ok(())
                }
                other => Err(RuntimeError::invalid_var_type(format!(
                    "Branch Wires expects wires, got {}",
                    other.kind()
                ))),
            },
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(self.wires_param.clone()),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn required_variables(&self) -> Vec<ExposedInfo> {
        self.merged_required.lock().expect("branch lock poisoned").clone()
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        self.run_wires.lock().expect("branch lock poisoned").clear();
        self.merged_required.lock().expect("branch lock poisoned").clear();

        match &self.wires_param {
            Value::Wire(w) => self.compose_sub_wire(data, &w.clone())?,
            Value::Seq(items) => {
                for item in items.clone() {
                    if let Value::Wire(w) = item {
                        self.compose_sub_wire(data, &w)?;
                    }
                }
            }
            _ => {}
        }

        // children composed later (at schedule) see the parent's scope
        self.mesh.set_seed_shared(data.shared.clone());
        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        for req in self.merged_required.lock().expect("branch lock poisoned").iter() {
            let var = ctx.reference_variable(&req.name);
            self.mesh.set_external_variable(&req.name, var);
        }
        for wire in self.run_wires.lock().expect("branch lock poisoned").iter() {
            self.mesh
                .schedule(wire.clone(), Value::None, false)
                .map_err(|e| RuntimeError::warmup(e.message()))?;
        }
        Ok(())
    }

    fn cleanup(&self) {
        self.mesh.terminate();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let _ = ctx;
        self.mesh.tick();
        if self.mesh.has_errors() {
            return Err(RuntimeError::activation(format!(
                "branched mesh had errors: {}",
                self.mesh.errors().join("; ")
            )));
        }
        Ok(input.clone())
    }
}
