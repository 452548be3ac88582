//! Built-in shards
//!
//! The engine ships the operator set it needs to be exercised: constants,
//! arithmetic, variable access, structured control flow, and the wire
//! control shards. Full domain libraries (logging, casting, networking)
//! live outside the core.

pub mod core;
pub mod parallel;
pub mod wires;

use crate::registry::register_shard;
use crate::shard::ShardBox;

/// Register every built-in under its public name. Invoked once by the
/// registry on first use; safe to call again.
pub fn register_builtin_shards() {
    // core
    register_shard("Const", || -> ShardBox { Box::new(core::ConstShard::default()) });
    register_shard("Pass", || -> ShardBox { Box::new(core::PassShard) });
    register_shard("Is", || -> ShardBox { Box::new(core::IsShard::default()) });
    register_shard("IsMore", || -> ShardBox { Box::new(core::IsMoreShard::default()) });
    register_shard("Math.Add", || -> ShardBox { Box::new(core::MathAdd::default()) });
    register_shard("Math.Multiply", || -> ShardBox { Box::new(core::MathMultiply::default()) });
    register_shard("Set", || -> ShardBox { Box::new(core::SetShard::default()) });
    register_shard("Update", || -> ShardBox { Box::new(core::UpdateShard::default()) });
    register_shard("Get", || -> ShardBox { Box::new(core::GetShard::default()) });
    register_shard("Count", || -> ShardBox { Box::new(core::CountShard::default()) });
    register_shard("Repeat", || -> ShardBox { Box::new(core::RepeatShard::default()) });
    register_shard("If", || -> ShardBox { Box::new(core::IfShard::default()) });
    register_shard("Maybe", || -> ShardBox { Box::new(core::MaybeShard::default()) });
    register_shard("Pause", || -> ShardBox { Box::new(core::PauseShard::default()) });
    register_shard("Fail", || -> ShardBox { Box::new(core::FailShard::default()) });
    register_shard("Return", || -> ShardBox { Box::new(core::ReturnShard) });
    register_shard("Restart", || -> ShardBox { Box::new(core::RestartShard) });

    // wire control
    register_shard("Do", || -> ShardBox { Box::new(wires::DoShard::new_do()) });
    register_shard("Dispatch", || -> ShardBox { Box::new(wires::DoShard::new_dispatch()) });
    register_shard("Detach", || -> ShardBox { Box::new(wires::DetachShard::default()) });
    register_shard("Step", || -> ShardBox { Box::new(wires::StepShard::default()) });
    register_shard("Resume", || -> ShardBox { Box::new(wires::ResumeShard::new_resume()) });
    register_shard("Start", || -> ShardBox { Box::new(wires::ResumeShard::new_start()) });
    register_shard("Wait", || -> ShardBox { Box::new(wires::WaitShard::default()) });
    register_shard("Stop", || -> ShardBox { Box::new(wires::StopShard::default()) });
    register_shard("Recur", || -> ShardBox { Box::new(wires::RecurShard::default()) });
    register_shard("Branch", || -> ShardBox { Box::new(wires::BranchShard::default()) });

    // parallel
    register_shard("TryMany", || -> ShardBox { Box::new(parallel::TryManyShard::default()) });
    register_shard("Expand", || -> ShardBox { Box::new(parallel::ExpandShard::default()) });
    register_shard("Spawn", || -> ShardBox { Box::new(parallel::SpawnShard::default()) });

    // the success-policy enum the parallel runners carry as a parameter
    crate::registry::register_enum_type(crate::registry::EnumTypeInfo {
        vendor_id: parallel::WEFT_VENDOR_ID,
        type_id: parallel::WAIT_UNTIL_TYPE_ID,
        name: "WaitUntil",
        labels: vec!["FirstSuccess", "AllSuccess", "SomeSuccess"],
    });
}
