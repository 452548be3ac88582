//! End-to-end scenarios for the cooperative scheduler: detached wires,
//! branch meshes, and the parallel fan-out runners.

use serial_test::serial;
use weft_runtime::shards::core::{
    ConstShard, CountShard, FailShard, IfShard, IsShard, MathMultiply, PauseShard, RepeatShard,
    ReturnShard, SetShard, UpdateShard,
};
use weft_runtime::shards::parallel::{ExpandShard, TryManyShard, WaitUntil};
use weft_runtime::shards::wires::{BranchShard, DetachShard};
use weft_runtime::{Mesh, Value, Wire, WireState};

fn drive(mesh: &Mesh) {
    let mut guard = 0;
    while mesh.tick() {
        guard += 1;
        assert!(guard < 10_000, "mesh did not settle");
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
}

#[test]
#[serial]
fn test_detached_wire_survives_parent() {
    // parent: Const(5) → Detach(child); child counts three times with
    // short sleeps between increments
    let child = Wire::new("ticker");
    child
        .add_shard(Box::new(RepeatShard::with(
            3,
            vec![Box::new(PauseShard::new(0.01)), Box::new(CountShard::new("c", true))],
        )))
        .unwrap();

    let parent = Wire::new("parent");
    parent.add_shard(Box::new(ConstShard::new(Value::Int(5)))).unwrap();
    parent.add_shard(Box::new(DetachShard::with_wire(child.clone()))).unwrap();

    let mesh = Mesh::new();
    mesh.schedule(parent.clone(), Value::None, false).unwrap();

    // after the first tick the parent ended with its own input while the
    // detached child is still alive
    mesh.tick();
    assert_eq!(parent.state(), WireState::Ended);
    assert_eq!(parent.finished_output(), Value::Int(5));
    assert!(matches!(
        child.state(),
        WireState::Prepared | WireState::Starting | WireState::Iterating
    ));

    for _ in 0..5 {
        std::thread::sleep(std::time::Duration::from_millis(12));
        mesh.tick();
    }

    let c = mesh.get_global("c").map(|v| weft_runtime::var_get(&v));
    assert_eq!(c, Some(Value::Int(3)));
    assert_eq!(child.state(), WireState::Ended);
    mesh.terminate();
}

#[test]
#[serial]
fn test_detach_captures_local_variable() {
    // the child needs the parent's local; Detach clones it in before the
    // child runs
    let child = Wire::new("consumer");
    child.add_shard(Box::new(weft_runtime::shards::core::GetShard::new("seed"))).unwrap();
    child.add_shard(Box::new(MathMultiply::new(Value::Int(10)))).unwrap();
    child.add_shard(Box::new(SetShard::new("result", true))).unwrap();

    let parent = Wire::new("producer");
    parent.add_shard(Box::new(ConstShard::new(Value::Int(7)))).unwrap();
    parent.add_shard(Box::new(SetShard::new("seed", false))).unwrap();
    parent.add_shard(Box::new(DetachShard::with_wire(child.clone()))).unwrap();

    let mesh = Mesh::new();
    mesh.schedule(parent.clone(), Value::None, false).unwrap();
    drive(&mesh);

    assert_eq!(child.state(), WireState::Ended);
    let result = mesh.get_global("result").map(|v| weft_runtime::var_get(&v));
    assert_eq!(result, Some(Value::Int(70)));
    mesh.terminate();
}

#[test]
#[serial]
fn test_branch_isolates_failures() {
    // Branch([failWire, okWire]): the parent fails on the tick the branch
    // wire fails, while the sibling's write is still observable
    let fail_wire = Wire::new("failing");
    fail_wire.add_shard(Box::new(FailShard::new("branch down"))).unwrap();

    let ok_wire = Wire::new("working");
    ok_wire.add_shard(Box::new(ConstShard::new(Value::Int(42)))).unwrap();
    ok_wire.add_shard(Box::new(UpdateShard::new("okslot"))).unwrap();

    let parent = Wire::new("parent");
    parent.add_shard(Box::new(ConstShard::new(Value::Int(0)))).unwrap();
    parent.add_shard(Box::new(SetShard::new("okslot", true))).unwrap();
    parent
        .add_shard(Box::new(BranchShard::with_wires(vec![fail_wire, ok_wire])))
        .unwrap();

    let mesh = Mesh::new();
    mesh.schedule(parent.clone(), Value::None, false).unwrap();
    drive(&mesh);

    assert!(parent.has_failed());
    assert!(parent.finished_error().unwrap().contains("branch down"));
    // the sibling ran in the same branch tick and its write survived
    let okslot = mesh.get_global("okslot").map(|v| weft_runtime::var_get(&v));
    assert_eq!(okslot, Some(Value::Int(42)));
    mesh.terminate();
}

fn pick_three_template() -> Wire {
    // If(input == 3, Return(input), Fail)
    let w = Wire::new("pick-three");
    w.add_shard(Box::new(IfShard::new(
        vec![Box::new(IsShard::new(Value::Int(3)))],
        vec![Box::new(ReturnShard)],
        vec![Box::new(FailShard::new("not three"))],
    )))
    .unwrap();
    w
}

#[test]
#[serial]
fn test_try_many_first_success_cancels_siblings() {
    let parent = Wire::new("searcher");
    parent
        .add_shard(Box::new(ConstShard::new(Value::seq(
            (1..=5).map(Value::Int).collect::<Vec<_>>(),
        ))))
        .unwrap();
    parent
        .add_shard(Box::new(TryManyShard::with_wire(
            pick_three_template(),
            WaitUntil::FirstSuccess,
            1,
            1,
        )))
        .unwrap();

    let mesh = Mesh::new();
    mesh.schedule(parent.clone(), Value::None, false).unwrap();
    drive(&mesh);

    assert_eq!(parent.state(), WireState::Ended);
    assert_eq!(parent.finished_output(), Value::Int(3));
    mesh.terminate();
}

#[test]
#[serial]
fn test_try_many_all_success_keeps_submission_order() {
    let template = Wire::new("doubler");
    template.add_shard(Box::new(MathMultiply::new(Value::Int(2)))).unwrap();

    let parent = Wire::new("fanout");
    parent
        .add_shard(Box::new(ConstShard::new(Value::seq(
            (1..=6).map(Value::Int).collect::<Vec<_>>(),
        ))))
        .unwrap();
    parent
        .add_shard(Box::new(TryManyShard::with_wire(template, WaitUntil::AllSuccess, 1, 1)))
        .unwrap();

    let parent_out = parent.run(Value::None).unwrap();
    let expected = Value::seq((1..=6).map(|n| Value::Int(n * 2)).collect::<Vec<_>>());
    assert_eq!(parent_out, expected);
}

#[test]
#[serial]
fn test_try_many_all_success_fails_when_any_clone_fails() {
    let parent = Wire::new("strict");
    parent
        .add_shard(Box::new(ConstShard::new(Value::seq(vec![
            Value::Int(3),
            Value::Int(4),
        ]))))
        .unwrap();
    parent
        .add_shard(Box::new(TryManyShard::with_wire(
            pick_three_template(),
            WaitUntil::AllSuccess,
            1,
            1,
        )))
        .unwrap();

    let err = parent.run(Value::None).unwrap_err();
    assert!(err.message().contains("failed on 1 of 2"));
}

#[test]
#[serial]
fn test_try_many_some_success_keeps_survivors() {
    let parent = Wire::new("lenient");
    parent
        .add_shard(Box::new(ConstShard::new(Value::seq(
            (1..=5).map(Value::Int).collect::<Vec<_>>(),
        ))))
        .unwrap();
    parent
        .add_shard(Box::new(TryManyShard::with_wire(
            pick_three_template(),
            WaitUntil::SomeSuccess,
            1,
            1,
        )))
        .unwrap();

    assert_eq!(parent.run(Value::None).unwrap(), Value::seq(vec![Value::Int(3)]));
}

#[test]
#[serial]
fn test_try_many_on_worker_threads() {
    let template = Wire::new("mt-doubler");
    template.add_shard(Box::new(MathMultiply::new(Value::Int(2)))).unwrap();

    let parent = Wire::new("mt-fanout");
    parent
        .add_shard(Box::new(ConstShard::new(Value::seq(
            (1..=8).map(Value::Int).collect::<Vec<_>>(),
        ))))
        .unwrap();
    parent
        .add_shard(Box::new(TryManyShard::with_wire(template, WaitUntil::AllSuccess, 3, 2)))
        .unwrap();

    let parent_out = parent.run(Value::None).unwrap();
    let expected = Value::seq((1..=8).map(|n| Value::Int(n * 2)).collect::<Vec<_>>());
    assert_eq!(parent_out, expected);
}

#[test]
#[serial]
fn test_expand_runs_n_copies_of_one_input() {
    let template = Wire::new("echo");
    template.add_shard(Box::new(MathMultiply::new(Value::Int(3)))).unwrap();

    let parent = Wire::new("expander");
    parent.add_shard(Box::new(ConstShard::new(Value::Int(5)))).unwrap();
    parent
        .add_shard(Box::new(ExpandShard::with_wire(template, 4, WaitUntil::AllSuccess)))
        .unwrap();

    assert_eq!(
        parent.run(Value::None).unwrap(),
        Value::seq(vec![Value::Int(15); 4])
    );
}

#[test]
#[serial]
fn test_terminate_mid_flight_leaves_no_live_wires() {
    let slow = Wire::new("slow");
    slow.set_looped(true);
    slow.add_shard(Box::new(PauseShard::new(0.005))).unwrap();
    slow.add_shard(Box::new(CountShard::new("n", true))).unwrap();

    let mesh = Mesh::new();
    mesh.schedule(slow.clone(), Value::None, false).unwrap();
    for _ in 0..3 {
        mesh.tick();
        std::thread::sleep(std::time::Duration::from_millis(6));
    }
    assert!(!slow.is_terminal());

    mesh.terminate();
    assert!(slow.is_terminal());
    assert!(mesh.is_empty());
    assert_eq!(mesh.ref_count(), 0);
    assert!(mesh.get_global("n").is_none());
}
