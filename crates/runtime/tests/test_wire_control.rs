//! End-to-end scenarios for the wire control shards: inline sub-wires,
//! stepped children, flow switching, recursion, and waiting on spawned
//! clones.

use std::sync::{Arc, Mutex};
use weft_runtime::shards::core::{
    ConstShard, CountShard, FailShard, GetShard, IfShard, IsMoreShard, MathAdd, MathMultiply,
    PassShard, ReturnShard, SetShard,
};
use weft_runtime::shards::wires::{
    DoShard, RecurShard, ResumeShard, StepShard, StopShard, WaitShard,
};
use weft_runtime::shards::parallel::SpawnShard;
use weft_runtime::{Context, Mesh, Result, Shard, TypeInfo, Value, Wire, WireState};

/// Test-only probe that records every value it sees.
#[derive(Clone)]
struct RecordShard {
    log: Arc<Mutex<Vec<Value>>>,
}

impl Shard for RecordShard {
    fn name(&self) -> &'static str {
        "TestRecord"
    }

    fn input_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn output_types(&self) -> Vec<TypeInfo> {
        vec![TypeInfo::Any]
    }

    fn activate(&self, _ctx: &mut Context<'_>, input: &Value) -> Result<Value> {
        self.log.lock().unwrap().push(input.clone());
        Ok(input.clone())
    }
}

fn drive(mesh: &Mesh) {
    let mut guard = 0;
    while mesh.tick() {
        guard += 1;
        assert!(guard < 10_000, "mesh did not settle");
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

#[test]
fn test_inline_do_feeds_child_output_forward() {
    // Const(10) → Do(child) → Add(1), child doubles: 21
    let child = Wire::new("double");
    child.add_shard(Box::new(MathMultiply::new(Value::Int(2)))).unwrap();

    let parent = Wire::new("parent");
    parent.add_shard(Box::new(ConstShard::new(Value::Int(10)))).unwrap();
    parent.add_shard(Box::new(DoShard::with_wire(child.clone()))).unwrap();
    parent.add_shard(Box::new(MathAdd::new(Value::Int(1)))).unwrap();

    assert_eq!(parent.run(Value::None).unwrap(), Value::Int(21));
    // the child was driven inline, never scheduled on its own
    assert_eq!(child.state(), WireState::Pending);
}

#[test]
fn test_do_forwards_child_failure() {
    let child = Wire::new("broken");
    child.add_shard(Box::new(FailShard::new("inner failure"))).unwrap();

    let parent = Wire::new("parent");
    parent.add_shard(Box::new(ConstShard::new(Value::Int(1)))).unwrap();
    parent.add_shard(Box::new(DoShard::with_wire(child))).unwrap();

    let err = parent.run(Value::None).unwrap_err();
    assert!(err.message().contains("inner failure"));
    assert!(parent.has_failed());
}

#[test]
fn test_do_forwards_return_to_caller() {
    // a (Return) inside the child ends the parent's iteration too
    let child = Wire::new("returner");
    child.add_shard(Box::new(MathAdd::new(Value::Int(1)))).unwrap();
    child.add_shard(Box::new(ReturnShard)).unwrap();

    let parent = Wire::new("parent");
    parent.add_shard(Box::new(ConstShard::new(Value::Int(5)))).unwrap();
    parent.add_shard(Box::new(DoShard::with_wire(child))).unwrap();
    parent.add_shard(Box::new(MathAdd::new(Value::Int(1000)))).unwrap();

    // the trailing Add never runs
    assert_eq!(parent.run(Value::None).unwrap(), Value::Int(6));
}

#[test]
fn test_step_advances_child_one_iteration_per_activation() {
    let child = Wire::new("counter");
    child.set_looped(true);
    child.add_shard(Box::new(CountShard::new("k", false))).unwrap();

    let parent = Wire::new("stepper");
    parent.add_shard(Box::new(ConstShard::new(Value::Int(0)))).unwrap();
    parent.add_shard(Box::new(StepShard::with_wire(child.clone()))).unwrap();
    parent.add_shard(Box::new(StepShard::with_wire(child.clone()))).unwrap();
    parent.add_shard(Box::new(StepShard::with_wire(child.clone()))).unwrap();

    assert_eq!(parent.run(Value::None).unwrap(), Value::Int(3));
    // parent cleanup stopped the stepped child
    assert!(child.is_terminal());
}

#[test]
fn test_resume_switches_flow_and_back() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let side = Wire::new("side");
    side.add_shard(Box::new(ConstShard::new(Value::string("side ran")))).unwrap();
    side.add_shard(Box::new(RecordShard { log: log.clone() })).unwrap();

    let main = Wire::new("main");
    main.add_shard(Box::new(ConstShard::new(Value::Int(1)))).unwrap();
    main.add_shard(Box::new(ResumeShard::with_wire(side.clone(), false))).unwrap();
    main.add_shard(Box::new(ConstShard::new(Value::string("back on main")))).unwrap();
    main.add_shard(Box::new(RecordShard { log: log.clone() })).unwrap();

    let mesh = Mesh::new();
    mesh.schedule(main.clone(), Value::None, false).unwrap();
    drive(&mesh);

    assert_eq!(side.state(), WireState::Ended);
    assert_eq!(main.state(), WireState::Ended);
    assert_eq!(main.finished_output(), Value::string("back on main"));
    // the side wire ran while the main wire was parked mid-shard
    let seen = log.lock().unwrap().clone();
    assert_eq!(seen, vec![Value::string("side ran"), Value::string("back on main")]);
    mesh.terminate();
}

#[test]
fn test_start_restarts_target_from_the_top() {
    let target = Wire::new("restartable");
    target.add_shard(Box::new(CountShard::new("runs", true))).unwrap();

    let main = Wire::new("main");
    main.add_shard(Box::new(ConstShard::new(Value::Int(0)))).unwrap();
    main.add_shard(Box::new(ResumeShard::with_wire(target.clone(), true))).unwrap();
    main.add_shard(Box::new(ResumeShard::with_wire(target.clone(), true))).unwrap();
    main.add_shard(Box::new(PassShard)).unwrap();

    let mesh = Mesh::new();
    mesh.schedule(main.clone(), Value::None, false).unwrap();
    drive(&mesh);

    // Start stops and re-runs the target, so the counter advanced twice
    let runs = mesh.get_global("runs").map(|v| weft_runtime::var_get(&v));
    assert_eq!(runs, Some(Value::Int(2)));
    assert_eq!(main.state(), WireState::Ended);
    mesh.terminate();
}

#[test]
fn test_spawn_then_wait_propagates_child_output() {
    // Spawn(child) = h → Wait(h): "ok"
    let child = Wire::new("worker");
    child.add_shard(Box::new(ConstShard::new(Value::string("ok")))).unwrap();

    let parent = Wire::new("parent");
    parent.add_shard(Box::new(SpawnShard::with_wire(child))).unwrap();
    parent.add_shard(Box::new(SetShard::new("h", false))).unwrap();
    parent.add_shard(Box::new(WaitShard::for_variable("h"))).unwrap();

    let mesh = Mesh::new();
    mesh.schedule(parent.clone(), Value::None, false).unwrap();
    drive(&mesh);

    assert_eq!(parent.finished_output(), Value::string("ok"));
    assert_eq!(parent.state(), WireState::Ended);
    mesh.terminate();
}

#[test]
fn test_wait_propagates_child_error() {
    let child = Wire::new("failing-worker");
    child.add_shard(Box::new(FailShard::new("worker exploded"))).unwrap();

    let parent = Wire::new("parent");
    parent.add_shard(Box::new(SpawnShard::with_wire(child))).unwrap();
    parent.add_shard(Box::new(SetShard::new("h", false))).unwrap();
    parent.add_shard(Box::new(WaitShard::for_variable("h"))).unwrap();

    let mesh = Mesh::new();
    mesh.schedule(parent.clone(), Value::None, false).unwrap();
    drive(&mesh);

    assert!(parent.has_failed());
    assert!(parent.finished_error().unwrap().contains("worker exploded"));
    mesh.terminate();
}

#[test]
fn test_stop_shard_without_target_ends_current_wire() {
    let w = Wire::new("self-stopping");
    w.add_shard(Box::new(ConstShard::new(Value::Int(11)))).unwrap();
    w.add_shard(Box::new(StopShard::default())).unwrap();
    w.add_shard(Box::new(MathAdd::new(Value::Int(100)))).unwrap();

    let mesh = Mesh::new();
    mesh.schedule(w.clone(), Value::None, false).unwrap();
    drive(&mesh);

    assert_eq!(w.state(), WireState::Stopped);
    // the stop output is the shard's input; the trailing Add never ran
    assert_eq!(w.finished_output(), Value::Int(11));
    mesh.terminate();
}

#[test]
fn test_stop_shard_halts_another_wire() {
    let victim = Wire::new("victim");
    victim.set_looped(true);
    victim.add_shard(Box::new(CountShard::new("v", true))).unwrap();

    let killer = Wire::new("killer");
    killer.add_shard(Box::new(ConstShard::new(Value::Int(0)))).unwrap();
    // let the victim get a few iterations in
    killer.add_shard(Box::new(weft_runtime::shards::core::PauseShard::new(0.02))).unwrap();
    killer.add_shard(Box::new(StopShard::with_wire(victim.clone()))).unwrap();

    let mesh = Mesh::new();
    mesh.schedule(victim.clone(), Value::None, false).unwrap();
    mesh.schedule(killer.clone(), Value::None, false).unwrap();
    drive(&mesh);

    assert_eq!(victim.state(), WireState::Stopped);
    assert_eq!(killer.state(), WireState::Ended);
    let count = mesh.get_global("v").map(|v| weft_runtime::var_get(&v)).unwrap();
    assert!(matches!(count, Value::Int(n) if n >= 1));
    mesh.terminate();
}

#[test]
fn test_recur_preserves_locals_through_unwind() {
    // Set(n) → If(n > 0, [Add(-1), Recur], []) → Get(n) → Record
    // reads during unwind: 0, 1, 2, 3, 4, 5
    let log = Arc::new(Mutex::new(Vec::new()));

    let w = Wire::new("countdown");
    w.add_shard(Box::new(SetShard::new("n", false))).unwrap();
    w.add_shard(Box::new(IfShard::new(
        vec![Box::new(IsMoreShard::new(Value::Int(0)))],
        vec![Box::new(MathAdd::new(Value::Int(-1))), Box::new(RecurShard::default())],
        vec![],
    )))
    .unwrap();
    w.add_shard(Box::new(GetShard::new("n"))).unwrap();
    w.add_shard(Box::new(RecordShard { log: log.clone() })).unwrap();

    assert_eq!(w.run(Value::Int(5)).unwrap(), Value::Int(5));

    let seen: Vec<Value> = log.lock().unwrap().clone();
    let expected: Vec<Value> = (0..=5).map(Value::Int).collect();
    assert_eq!(seen, expected);
}
