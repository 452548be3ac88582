//! Core operator set: constants, arithmetic, variables, structured flow
//!
//! These are the operators the engine itself leans on: every stateful one
//! keeps its runtime state behind a transient lock and never holds it
//! across a nested activation, which keeps wire re-entry (Recur, Do on the
//! current wire) deadlock-free.

use crate::context::{Context, FlowState};
use crate::error::{Result, RuntimeError};
use crate::shard::{ExposedInfo, InstanceData, ParameterInfo, Shard, ShardsVar};
use crate::types::TypeInfo;
use crate::value::{Value, ValueKind, ValueOrder};
use crate::variables::{var_get, var_set, ParamVar, VarRef};
use std::sync::Mutex;

/// Warmup-resolved variable binding. Clones start unbound so a duplicated
/// shard resolves its own slot.
#[derive(Default)]
pub(crate) struct Binding(Mutex<Option<VarRef>>);

impl Clone for Binding {
    fn clone(&self) -> Self {
        Binding::default()
    }
}

impl Binding {
    pub fn set(&self, var: VarRef) {
        *self.0.lock().expect("binding lock poisoned") = Some(var);
    }

    pub fn clear(&self) {
        *self.0.lock().expect("binding lock poisoned") = None;
    }

    pub fn get(&self) -> Option<VarRef> {
        self.0.lock().expect("binding lock poisoned").clone()
    }
}

/// Exposed/required sets captured from an inner composition, surfaced back
/// to the enclosing composer.
#[derive(Default)]
pub(crate) struct SurfacedVars {
    exposed: Mutex<Vec<ExposedInfo>>,
    required: Mutex<Vec<ExposedInfo>>,
}

impl Clone for SurfacedVars {
    fn clone(&self) -> Self {
        SurfacedVars {
            exposed: Mutex::new(self.exposed()),
            required: Mutex::new(self.required()),
        }
    }
}

impl SurfacedVars {
    pub fn set(&self, exposed: Vec<ExposedInfo>, required: Vec<ExposedInfo>) {
        *self.exposed.lock().expect("surfaced lock poisoned") = exposed;
        *self.required.lock().expect("surfaced lock poisoned") = required;
    }

    pub fn exposed(&self) -> Vec<ExposedInfo> {
        self.exposed.lock().expect("surfaced lock poisoned").clone()
    }

    pub fn required(&self) -> Vec<ExposedInfo> {
        self.required.lock().expect("surfaced lock poisoned").clone()
    }
}

/// Compose-time type captured for later exposure.
#[derive(Default)]
pub(crate) struct TypeCell(Mutex<TypeInfo>);

impl Clone for TypeCell {
    fn clone(&self) -> Self {
        TypeCell(Mutex::new(self.get()))
    }
}

impl TypeCell {
    pub fn set(&self, t: TypeInfo) {
        *self.0.lock().expect("type cell lock poisoned") = t;
    }

    pub fn get(&self) -> TypeInfo {
        self.0.lock().expect("type cell lock poisoned").clone()
    }
}

// ---------------------------------------------------------------------------

/// Emits a constant, ignoring its input.
#[derive(Clone, Default)]
pub struct ConstShard {
    value: Value,
}

impl ConstShard {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl Shard for ConstShard {
    fn name(&self) -> &'static str {
        "Const"
    }

    fn help(&self) -> &'static str {
        "Declares a constant value."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Value", "The constant to output.", vec![TypeInfo::Any])]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match index {
            0 => {
                self.value = value.clone();
                Ok(())
            }
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(self.value.clone()),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn compose(&mut self, _data: &InstanceData) -> Result<Option<TypeInfo>> {
        Ok(Some(TypeInfo::derive(&self.value)))
    }

    fn activate(&self, _ctx: &mut Context<'_>, _input: &Value) -> Result<Value> {
        Ok(self.value.clone())
    }
}

/// Identity.
#[derive(Clone)]
pub struct PassShard;

impl Shard for PassShard {
    fn name(&self) -> &'static str {
        "Pass"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        Ok(Some(data.input_type.clone()))
    }

    fn activate(&self, _ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        Ok(input.clone())
    }
}

macro_rules! operand_param {
    () => {
        fn parameters(&self) -> Vec<ParameterInfo> {
            vec![ParameterInfo::new(
                "Operand",
                "The right-hand operand, literal or variable.",
                vec![
                    TypeInfo::int(),
                    TypeInfo::float(),
                    TypeInfo::Int2,
                    TypeInfo::Float2,
                    TypeInfo::ContextVar { of: vec![TypeInfo::int(), TypeInfo::float()] },
                ],
            )]
        }

        fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
            match index {
                0 => {
                    self.operand.set(value.clone());
                    Ok(())
                }
                _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
            }
        }

        fn get_param(&self, index: usize) -> Result<Value> {
            match index {
                0 => Ok(self.operand.raw()),
                _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
            }
        }

        fn required_variables(&self) -> Vec<ExposedInfo> {
            match self.operand.variable_name() {
                Some(name) => vec![ExposedInfo::new(name, TypeInfo::Any)],
                None => Vec::new(),
            }
        }

        fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
            self.operand.warmup(ctx)
        }

        fn cleanup(&self) {
            self.operand.cleanup();
        }
    };
}

/// Numeric addition, lanewise on vectors.
#[derive(Clone, Default)]
pub struct MathAdd {
    operand: ParamVar,
}

impl MathAdd {
    pub fn new(operand: Value) -> Self {
        Self { operand: ParamVar::new(operand) }
    }
}

impl Shard for MathAdd {
    fn name(&self) -> &'static str {
        "Math.Add"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::int(), TypeInfo::float(), TypeInfo::Int2, TypeInfo::Float2]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::int(), TypeInfo::float(), TypeInfo::Int2, TypeInfo::Float2]
    }

    operand_param!();

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        Ok(Some(data.input_type.clone()))
    }

    fn activate(&self, _ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        numeric_binop(input, &self.operand.get(), "Math.Add", |a, b| a.wrapping_add(b), |a, b| a + b)
    }
}

/// Numeric multiplication, lanewise on vectors.
#[derive(Clone, Default)]
pub struct MathMultiply {
    operand: ParamVar,
}

impl MathMultiply {
    pub fn new(operand: Value) -> Self {
        Self { operand: ParamVar::new(operand) }
    }
}

impl Shard for MathMultiply {
    fn name(&self) -> &'static str {
        "Math.Multiply"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::int(), TypeInfo::float(), TypeInfo::Int2, TypeInfo::Float2]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::int(), TypeInfo::float(), TypeInfo::Int2, TypeInfo::Float2]
    }

    operand_param!();

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        Ok(Some(data.input_type.clone()))
    }

    fn activate(&self, _ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        numeric_binop(input, &self.operand.get(), "Math.Multiply", |a, b| a.wrapping_mul(b), |a, b| a * b)
    }
}

fn numeric_binop(
    input: &Value,
    operand: &Value,
    op: &str,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value> {
    match (input, operand) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        (Value::Int2(a), Value::Int2(b)) => {
            let mut lanes = a.0;
            for (l, r) in lanes.iter_mut().zip(b.0.iter()) {
                *l = int_op(*l, *r);
            }
            Ok(Value::Int2(weft_core::IntVec2::new(lanes)))
        }
        (Value::Float2(a), Value::Float2(b)) => {
            let mut lanes = a.0;
            for (l, r) in lanes.iter_mut().zip(b.0.iter()) {
                *l = float_op(*l, *r);
            }
            Ok(Value::Float2(weft_core::FloatVec2::new(lanes)))
        }
        (a, b) => Err(RuntimeError::activation(format!(
            "{op}: operand mismatch, {} vs {}",
            a.kind(),
            b.kind()
        ))),
    }
}

/// Equality test against an operand.
#[derive(Clone, Default)]
pub struct IsShard {
    operand: ParamVar,
}

impl IsShard {
    pub fn new(operand: Value) -> Self {
        Self { operand: ParamVar::new(operand) }
    }
}

impl Shard for IsShard {
    fn name(&self) -> &'static str {
        "Is"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Bool]
    }

    operand_param!();

    fn activate(&self, _ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        Ok(Value::Bool(*input == self.operand.get()))
    }
}

/// Strict greater-than test against an operand.
#[derive(Clone, Default)]
pub struct IsMoreShard {
    operand: ParamVar,
}

impl IsMoreShard {
    pub fn new(operand: Value) -> Self {
        Self { operand: ParamVar::new(operand) }
    }
}

impl Shard for IsMoreShard {
    fn name(&self) -> &'static str {
        "IsMore"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Bool]
    }

    operand_param!();

    fn activate(&self, _ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        Ok(Value::Bool(input.compare(&self.operand.get()) == ValueOrder::Greater))
    }
}

// ---------------------------------------------------------------------------

/// Writes its input into a named variable and passes the input through.
/// With `Global` the variable lives on the mesh instead of the wire.
#[derive(Clone, Default)]
pub struct SetShard {
    name: String,
    global: bool,
    binding: Binding,
    exposed_type: TypeCell,
}

impl SetShard {
    pub fn new(name: impl Into<String>, global: bool) -> Self {
        Self { name: name.into(), global, ..Default::default() }
    }
}

impl Shard for SetShard {
    fn name(&self) -> &'static str {
        "Set"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo::new("Name", "The variable name.", vec![TypeInfo::String]),
            ParameterInfo::new("Global", "Expose to every wire in the mesh.", vec![TypeInfo::Bool]),
        ]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match (index, value) {
            (0, Value::String(s)) => {
                self.name = s.to_string();
                Ok(())
            }
            (0, other) => Err(RuntimeError::invalid_var_type(format!(
                "Set Name expects String, got {}",
                other.kind()
            ))),
            (1, Value::Bool(b)) => {
                self.global = *b;
                Ok(())
            }
            (1, other) => Err(RuntimeError::invalid_var_type(format!(
                "Set Global expects Bool, got {}",
                other.kind()
            ))),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(Value::string(&self.name)),
            1 => Ok(Value::Bool(self.global)),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn exposed_variables(&self) -> Vec<ExposedInfo> {
        vec![ExposedInfo::new(self.name.clone(), self.exposed_type.get())
            .mutable()
            .global(self.global)]
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        self.exposed_type.set(data.input_type.clone());
        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        let var = if self.global {
            ctx.reference_global(&self.name)
        } else {
            ctx.reference_variable(&self.name)
        };
        self.binding.set(var);
        Ok(())
    }

    fn cleanup(&self) {
        self.binding.clear();
    }

    fn activate(&self, _ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        match self.binding.get() {
            Some(var) => {
                var_set(&var, input.clone());
                Ok(input.clone())
            }
            None => Err(RuntimeError::warmup(format!("Set {} was not warmed up", self.name))),
        }
    }
}

/// Writes into a variable some ancestor already exposed.
#[derive(Clone, Default)]
pub struct UpdateShard {
    name: String,
    binding: Binding,
}

impl UpdateShard {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), binding: Binding::default() }
    }
}

impl Shard for UpdateShard {
    fn name(&self) -> &'static str {
        "Update"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Name", "The variable name.", vec![TypeInfo::String])]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match (index, value) {
            (0, Value::String(s)) => {
                self.name = s.to_string();
                Ok(())
            }
            (0, other) => Err(RuntimeError::invalid_var_type(format!(
                "Update Name expects String, got {}",
                other.kind()
            ))),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(Value::string(&self.name)),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn required_variables(&self) -> Vec<ExposedInfo> {
        vec![ExposedInfo::new(self.name.clone(), TypeInfo::Any).mutable()]
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.binding.set(ctx.reference_variable(&self.name));
        Ok(())
    }

    fn cleanup(&self) {
        self.binding.clear();
    }

    fn activate(&self, _ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        match self.binding.get() {
            Some(var) => {
                var_set(&var, input.clone());
                Ok(input.clone())
            }
            None => Err(RuntimeError::warmup(format!("Update {} was not warmed up", self.name))),
        }
    }
}

/// Reads a named variable, ignoring its input.
#[derive(Clone, Default)]
pub struct GetShard {
    name: String,
    binding: Binding,
}

impl GetShard {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), binding: Binding::default() }
    }
}

impl Shard for GetShard {
    fn name(&self) -> &'static str {
        "Get"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Name", "The variable name.", vec![TypeInfo::String])]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match (index, value) {
            (0, Value::String(s)) => {
                self.name = s.to_string();
                Ok(())
            }
            (0, other) => Err(RuntimeError::invalid_var_type(format!(
                "Get Name expects String, got {}",
                other.kind()
            ))),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(Value::string(&self.name)),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn required_variables(&self) -> Vec<ExposedInfo> {
        vec![ExposedInfo::new(self.name.clone(), TypeInfo::Any)]
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        // resolve the exposed type if an ancestor declared it
        let ty = data
            .shared
            .iter()
            .rev()
            .find(|e| e.name == self.name)
            .map(|e| e.ty.clone())
            .unwrap_or(TypeInfo::Any);
        Ok(Some(ty))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.binding.set(ctx.reference_variable(&self.name));
        Ok(())
    }

    fn cleanup(&self) {
        self.binding.clear();
    }

    fn activate(&self, _ctx: &mut Context<'_>, _input: &Value) -> Result<Value> {
        match self.binding.get() {
            Some(var) => Ok(var_get(&var)),
            None => Err(RuntimeError::warmup(format!("Get {} was not warmed up", self.name))),
        }
    }
}

/// Increments a named integer counter on every activation and outputs the
/// new count.
#[derive(Clone, Default)]
pub struct CountShard {
    name: String,
    global: bool,
    binding: Binding,
}

impl CountShard {
    pub fn new(name: impl Into<String>, global: bool) -> Self {
        Self { name: name.into(), global, binding: Binding::default() }
    }
}

impl Shard for CountShard {
    fn name(&self) -> &'static str {
        "Count"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::int()]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo::new("Name", "The counter variable.", vec![TypeInfo::String]),
            ParameterInfo::new("Global", "Keep the counter on the mesh.", vec![TypeInfo::Bool]),
        ]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match (index, value) {
            (0, Value::String(s)) => {
                self.name = s.to_string();
                Ok(())
            }
            (1, Value::Bool(b)) => {
                self.global = *b;
                Ok(())
            }
            (0, other) | (1, other) => Err(RuntimeError::invalid_var_type(format!(
                "Count parameter mismatch: {}",
                other.kind()
            ))),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(Value::string(&self.name)),
            1 => Ok(Value::Bool(self.global)),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn exposed_variables(&self) -> Vec<ExposedInfo> {
        vec![ExposedInfo::new(self.name.clone(), TypeInfo::int())
            .mutable()
            .global(self.global)]
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        let var = if self.global {
            ctx.reference_global(&self.name)
        } else {
            ctx.reference_variable(&self.name)
        };
        self.binding.set(var);
        Ok(())
    }

    fn cleanup(&self) {
        self.binding.clear();
    }

    fn activate(&self, _ctx: &mut Context<'_>, _input: &Value) -> Result<Value> {
        let var = self
            .binding
            .get()
            .ok_or_else(|| RuntimeError::warmup(format!("Count {} was not warmed up", self.name)))?;
        let mut guard = var.lock().expect("variable lock poisoned");
        let next = match &*guard {
            Value::Int(n) => n + 1,
            _ => 1,
        };
        *guard = Value::Int(next);
        Ok(Value::Int(next))
    }
}

// ---------------------------------------------------------------------------

/// Runs an inline shard sequence a fixed number of times; passes its input
/// through.
#[derive(Clone, Default)]
pub struct RepeatShard {
    action: ShardsVar,
    times: i64,
    surfaced: SurfacedVars,
}

impl RepeatShard {
    pub fn new(action: ShardsVar, times: i64) -> Self {
        Self { action, times, surfaced: SurfacedVars::default() }
    }

    /// Builder convenience for inline bodies.
    pub fn with(times: i64, shards: Vec<Box<dyn Shard>>) -> Self {
        let mut action = ShardsVar::default();
        for s in shards {
            action.push(s);
        }
        Self { action, times, surfaced: SurfacedVars::default() }
    }
}

impl Shard for RepeatShard {
    fn name(&self) -> &'static str {
        "Repeat"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo::new("Action", "The shards to repeat.", vec![TypeInfo::ShardRef, TypeInfo::any_seq()]),
            ParameterInfo::new("Times", "How many times.", vec![TypeInfo::int()]),
        ]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match index {
            0 => self.action.set_param(value),
            1 => match value {
                Value::Int(n) => {
                    self.times = *n;
                    Ok(())
                }
                other => Err(RuntimeError::invalid_var_type(format!(
                    "Repeat Times expects Int, got {}",
                    other.kind()
                ))),
            },
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(self.action.get_param()),
            1 => Ok(Value::Int(self.times)),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn exposed_variables(&self) -> Vec<ExposedInfo> {
        self.surfaced.exposed()
    }

    fn required_variables(&self) -> Vec<ExposedInfo> {
        self.surfaced.required()
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        if !self.action.is_empty() {
            // the body runs unconditionally, so its exposures are real
            let res = self.action.compose(data)?;
            self.surfaced.set(res.exposed, res.required);
        }
        Ok(Some(data.input_type.clone()))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.action.warmup(ctx)
    }

    fn cleanup(&self) {
        self.action.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        for _ in 0..self.times {
            self.action.activate(ctx, input)?;
            if !ctx.should_continue() {
                break;
            }
        }
        Ok(input.clone())
    }
}

/// Two-way branch on a predicate shard sequence.
#[derive(Clone, Default)]
pub struct IfShard {
    predicate: ShardsVar,
    then_action: ShardsVar,
    else_action: ShardsVar,
    passthrough: bool,
    surfaced: SurfacedVars,
}

impl IfShard {
    pub fn new(
        predicate: Vec<Box<dyn Shard>>,
        then_action: Vec<Box<dyn Shard>>,
        else_action: Vec<Box<dyn Shard>>,
    ) -> Self {
        let mut shard = IfShard::default();
        for s in predicate {
            shard.predicate.push(s);
        }
        for s in then_action {
            shard.then_action.push(s);
        }
        for s in else_action {
            shard.else_action.push(s);
        }
        shard
    }

    pub fn passthrough(mut self, v: bool) -> Self {
        self.passthrough = v;
        self
    }
}

impl Shard for IfShard {
    fn name(&self) -> &'static str {
        "If"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo::new("Predicate", "Outputs a Bool.", vec![TypeInfo::ShardRef, TypeInfo::any_seq()]),
            ParameterInfo::new("Then", "Runs when true.", vec![TypeInfo::ShardRef, TypeInfo::any_seq()]),
            ParameterInfo::new("Else", "Runs when false.", vec![TypeInfo::ShardRef, TypeInfo::any_seq()]),
            ParameterInfo::new("Passthrough", "Output the input regardless.", vec![TypeInfo::Bool]),
        ]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match index {
            0 => self.predicate.set_param(value),
            1 => self.then_action.set_param(value),
            2 => self.else_action.set_param(value),
            3 => match value {
                Value::Bool(b) => {
                    self.passthrough = *b;
                    Ok(())
                }
                other => Err(RuntimeError::invalid_var_type(format!(
                    "If Passthrough expects Bool, got {}",
                    other.kind()
                ))),
            },
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(self.predicate.get_param()),
            1 => Ok(self.then_action.get_param()),
            2 => Ok(self.else_action.get_param()),
            3 => Ok(Value::Bool(self.passthrough)),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn required_variables(&self) -> Vec<ExposedInfo> {
        self.surfaced.required()
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        let pred = self.predicate.compose(data)?;
        if !matches!(pred.output_type.kind(), ValueKind::Bool | ValueKind::Any) {
            return Err(RuntimeError::compose(format!(
                "If predicate must output Bool, got {:?}",
                pred.output_type.kind()
            )));
        }
        let then_res =
            if self.then_action.is_empty() { None } else { Some(self.then_action.compose(data)?) };
        let else_res =
            if self.else_action.is_empty() { None } else { Some(self.else_action.compose(data)?) };

        // branches may not run, so nothing they expose escapes; their
        // requirements do
        let mut required = pred.required;
        for res in then_res.iter().chain(else_res.iter()) {
            for req in &res.required {
                if !required.iter().any(|r| r.name == req.name) {
                    required.push(req.clone());
                }
            }
        }
        self.surfaced.set(Vec::new(), required);

        if self.passthrough {
            return Ok(Some(data.input_type.clone()));
        }
        match (then_res, else_res) {
            (Some(t), Some(e)) if t.output_type.same_type(&e.output_type) => Ok(Some(t.output_type)),
            (Some(_), Some(_)) => Ok(Some(TypeInfo::Any)),
            (Some(t), None) => Ok(Some(t.output_type)),
            (None, Some(e)) => Ok(Some(e.output_type)),
            (None, None) => Ok(Some(data.input_type.clone())),
        }
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.predicate.warmup(ctx)?;
        self.then_action.warmup(ctx)?;
        self.else_action.warmup(ctx)
    }

    fn cleanup(&self) {
        self.else_action.cleanup();
        self.then_action.cleanup();
        self.predicate.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let verdict = self.predicate.activate(ctx, input)?;
        if !ctx.should_continue() {
            return Ok(verdict);
        }
        let truthy = matches!(verdict, Value::Bool(true));
        let branch = if truthy { &self.then_action } else { &self.else_action };
        let out = if branch.is_empty() { input.clone() } else { branch.activate(ctx, input)? };
        if self.passthrough {
            Ok(input.clone())
        } else {
            Ok(out)
        }
    }
}

/// Recovery: runs a sequence and, on activation failure, resets the flow
/// and runs the fallback with the original input.
#[derive(Clone, Default)]
pub struct MaybeShard {
    action: ShardsVar,
    else_action: ShardsVar,
    silent: bool,
    surfaced: SurfacedVars,
}

impl MaybeShard {
    pub fn new(action: Vec<Box<dyn Shard>>, else_action: Vec<Box<dyn Shard>>, silent: bool) -> Self {
        let mut shard = MaybeShard { silent, ..Default::default() };
        for s in action {
            shard.action.push(s);
        }
        for s in else_action {
            shard.else_action.push(s);
        }
        shard
    }
}

impl Shard for MaybeShard {
    fn name(&self) -> &'static str {
        "Maybe"
    }

    fn help(&self) -> &'static str {
        "Attempts to activate shards; upon failure, activates a fallback."
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo::new("Action", "The shards to attempt.", vec![TypeInfo::ShardRef, TypeInfo::any_seq()]),
            ParameterInfo::new("Else", "The fallback shards.", vec![TypeInfo::ShardRef, TypeInfo::any_seq()]),
            ParameterInfo::new("Silent", "Log failures at trace level only.", vec![TypeInfo::Bool]),
        ]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match index {
            0 => self.action.set_param(value),
            1 => self.else_action.set_param(value),
            2 => match value {
                Value::Bool(b) => {
                    self.silent = *b;
                    Ok(())
                }
                other => Err(RuntimeError::invalid_var_type(format!(
                    "Maybe Silent expects Bool, got {}",
                    other.kind()
                ))),
            },
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(self.action.get_param()),
            1 => Ok(self.else_action.get_param()),
            2 => Ok(Value::Bool(self.silent)),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn required_variables(&self) -> Vec<ExposedInfo> {
        self.surfaced.required()
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        let res = self.action.compose(data)?;
        let mut required = res.required.clone();
        if !self.else_action.is_empty() {
            let alt = self.else_action.compose(data)?;
            for req in alt.required {
                if !required.iter().any(|r| r.name == req.name) {
                    required.push(req);
                }
            }
        }
        // the attempt can fail mid-way, so none of its exposures escape
        self.surfaced.set(Vec::new(), required);
        Ok(Some(res.output_type))
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.action.warmup(ctx)?;
        self.else_action.warmup(ctx)
    }

    fn cleanup(&self) {
        self.else_action.cleanup();
        self.action.cleanup();
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let out = self.action.activate(ctx, input)?;
        if ctx.state() == FlowState::Error {
            let error = ctx.take_error().unwrap_or_default();
            if self.silent {
                tracing::trace!(error = %error, "Maybe recovered");
            } else {
                tracing::debug!(error = %error, "Maybe recovered");
            }
            ctx.continue_flow();
            if self.else_action.is_empty() {
                return Ok(input.clone());
            }
            return self.else_action.activate(ctx, input);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------

/// Suspends the wire for a number of seconds (0 yields for one tick).
#[derive(Clone, Default)]
pub struct PauseShard {
    time: ParamVar,
}

impl PauseShard {
    pub fn new(seconds: f64) -> Self {
        Self { time: ParamVar::new(Value::Float(seconds)) }
    }
}

impl Shard for PauseShard {
    fn name(&self) -> &'static str {
        "Pause"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new(
            "Time",
            "Seconds to sleep; 0 yields for one tick.",
            vec![TypeInfo::float(), TypeInfo::int()],
        )]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match index {
            0 => {
                self.time.set(value.clone());
                Ok(())
            }
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(self.time.raw()),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn warmup(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.time.warmup(ctx)
    }

    fn cleanup(&self) {
        self.time.cleanup();
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        Ok(Some(data.input_type.clone()))
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        let seconds = match self.time.get() {
            Value::Float(f) => f,
            Value::Int(n) => n as f64,
            _ => 0.0,
        };
        ctx.suspend(seconds);
        Ok(input.clone())
    }
}

/// Raises an activation error.
#[derive(Clone, Default)]
pub struct FailShard {
    message: String,
}

impl FailShard {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl Shard for FailShard {
    fn name(&self) -> &'static str {
        "Fail"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo::new("Message", "The failure message.", vec![TypeInfo::String])]
    }

    fn set_param(&mut self, index: usize, value: &Value) -> Result<()> {
        match (index, value) {
            (0, Value::String(s)) => {
                self.message = s.to_string();
                Ok(())
            }
            (0, other) => Err(RuntimeError::invalid_var_type(format!(
                "Fail Message expects String, got {}",
                other.kind()
            ))),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn get_param(&self, index: usize) -> Result<Value> {
        match index {
            0 => Ok(Value::string(&self.message)),
            _ => Err(RuntimeError::InvalidParameterIndex { shard: self.name(), index }),
        }
    }

    fn is_flow_stopper(&self) -> bool {
        true
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        Ok(Some(data.input_type.clone()))
    }

    fn activate(&self, _ctx: &mut Context<'_>, _input: &Value) -> Result<Value> {
        Err(RuntimeError::activation(self.message.clone()))
    }
}

/// Ends the wire (or the enclosing sub-flow) with the current value.
#[derive(Clone)]
pub struct ReturnShard;

impl Shard for ReturnShard {
    fn name(&self) -> &'static str {
        "Return"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn is_flow_stopper(&self) -> bool {
        true
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        Ok(Some(data.input_type.clone()))
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        ctx.return_flow();
        Ok(input.clone())
    }
}

/// Restarts the wire from the top, feeding it the current value as input.
#[derive(Clone)]
pub struct RestartShard;

impl Shard for RestartShard {
    fn name(&self) -> &'static str {
        "Restart"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn is_flow_stopper(&self) -> bool {
        true
    }

    fn compose(&mut self, data: &InstanceData) -> Result<Option<TypeInfo>> {
        Ok(Some(data.input_type.clone()))
    }

    fn activate(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        ctx.restart_flow(input.clone());
        Ok(input.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Wire;

    #[test]
    fn test_inline_do_style_arithmetic() {
        let w = Wire::new("math");
        w.add_shard(Box::new(ConstShard::new(Value::Int(10)))).unwrap();
        w.add_shard(Box::new(MathAdd::new(Value::Int(5)))).unwrap();
        w.add_shard(Box::new(MathMultiply::new(Value::Int(3)))).unwrap();
        assert_eq!(w.run(Value::None).unwrap(), Value::Int(45));
    }

    #[test]
    fn test_vector_arithmetic() {
        let w = Wire::new("vec");
        w.add_shard(Box::new(ConstShard::new(Value::Int2(weft_core::IntVec2::new([1, 2])))))
            .unwrap();
        w.add_shard(Box::new(MathAdd::new(Value::Int2(weft_core::IntVec2::new([10, 20])))))
            .unwrap();
        assert_eq!(w.run(Value::None).unwrap(), Value::Int2(weft_core::IntVec2::new([11, 22])));
    }

    #[test]
    fn test_set_get_roundtrip() {
        let w = Wire::new("vars");
        w.add_shard(Box::new(ConstShard::new(Value::Int(9)))).unwrap();
        w.add_shard(Box::new(SetShard::new("n", false))).unwrap();
        w.add_shard(Box::new(ConstShard::new(Value::Int(0)))).unwrap();
        w.add_shard(Box::new(GetShard::new("n"))).unwrap();
        assert_eq!(w.run(Value::None).unwrap(), Value::Int(9));
    }

    #[test]
    fn test_repeat_counts() {
        let w = Wire::new("repeat");
        w.add_shard(Box::new(ConstShard::new(Value::None))).unwrap();
        w.add_shard(Box::new(RepeatShard::with(
            4,
            vec![Box::new(CountShard::new("c", false))],
        )))
        .unwrap();
        w.add_shard(Box::new(GetShard::new("c"))).unwrap();
        assert_eq!(w.run(Value::None).unwrap(), Value::Int(4));
    }

    #[test]
    fn test_if_branches() {
        let build = |input: i64| {
            let w = Wire::new("branch");
            w.add_shard(Box::new(ConstShard::new(Value::Int(input)))).unwrap();
            w.add_shard(Box::new(IfShard::new(
                vec![Box::new(IsMoreShard::new(Value::Int(0)))],
                vec![Box::new(ConstShard::new(Value::string("positive")))],
                vec![Box::new(ConstShard::new(Value::string("non-positive")))],
            )))
            .unwrap();
            w
        };
        assert_eq!(build(5).run(Value::None).unwrap(), Value::string("positive"));
        assert_eq!(build(-5).run(Value::None).unwrap(), Value::string("non-positive"));
    }

    #[test]
    fn test_if_rejects_non_bool_predicate() {
        let w = Wire::new("badif");
        w.add_shard(Box::new(ConstShard::new(Value::Int(1)))).unwrap();
        w.add_shard(Box::new(IfShard::new(
            vec![Box::new(ConstShard::new(Value::Int(3)))],
            vec![],
            vec![],
        )))
        .unwrap();
        assert!(w.run(Value::None).is_err());
    }

    #[test]
    fn test_maybe_recovers_from_failure() {
        let w = Wire::new("maybe");
        w.add_shard(Box::new(ConstShard::new(Value::Int(1)))).unwrap();
        w.add_shard(Box::new(MaybeShard::new(
            vec![Box::new(FailShard::new("nope"))],
            vec![Box::new(ConstShard::new(Value::Int(42)))],
            true,
        )))
        .unwrap();
        assert_eq!(w.run(Value::None).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_fail_finalizes_wire_as_failed() {
        let w = Wire::new("fails");
        w.add_shard(Box::new(FailShard::new("expected failure"))).unwrap();
        let err = w.run(Value::None).unwrap_err();
        assert_eq!(err.message(), "expected failure");
        assert!(w.has_failed());
        assert_eq!(w.finished_output(), Value::None);
    }

    #[test]
    fn test_return_short_circuits() {
        let w = Wire::new("ret");
        w.add_shard(Box::new(ConstShard::new(Value::Int(7)))).unwrap();
        w.add_shard(Box::new(ReturnShard)).unwrap();
        w.add_shard(Box::new(MathAdd::new(Value::Int(100)))).unwrap();
        assert_eq!(w.run(Value::None).unwrap(), Value::Int(7));
    }
}
