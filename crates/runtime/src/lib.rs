//! Weft Runtime: the wire execution engine
//!
//! Programs are wires — linear sequences of typed operators ("shards") —
//! composed into meshes that execute cooperatively as suspendable
//! coroutines. This crate is the engine only: the polymorphic value model,
//! compose-time type propagation and variable-exposure analysis, the
//! coroutine scheduling layer, the control-flow shards that cross wire
//! boundaries, and the wire template pool behind the parallel runners.
//!
//! Key design principles:
//! - Value: the tagged union wires exchange; deep ownership, Arc-shared
//!   immutable payloads.
//! - Wire: a shard list wrapped in a stackful coroutine; flow-control
//!   signals escape to the nearest handler, never across the coroutine
//!   boundary.
//! - Mesh: a single-threaded cooperative scheduler; concurrency between
//!   meshes happens only through explicitly captured variables.

pub mod compose;
pub mod context;
pub mod coro;
pub mod error;
pub mod mesh;
pub mod pool;
pub mod registry;
pub mod serialize;
pub mod shard;
pub mod shards;
pub mod types;
pub mod value;
pub mod variables;
pub mod wire;

// Re-export key types and functions
pub use compose::{compose_slice as compose_shards, compose_wire, ComposeResult};
pub use context::{Context, Flow, FlowState};
pub use coro::{WireCoro, Yielder};
pub use error::{ErrorKind, Result, RuntimeError};
pub use mesh::{Mesh, WeakMesh};
pub use pool::WirePool;
pub use registry::{
    acquire_interface, create_shard, get_root_path, get_shards, register_enum_type,
    register_object_type, register_shard, set_root_path, ABI_VERSION,
};
pub use serialize::{value_from_bytes, value_to_bytes, SerializeError, TypedValue};
pub use shard::{ExposedInfo, InstanceData, ParameterInfo, Shard, ShardBox, ShardsVar};
pub use types::{PathType, SeqType, TableType, TypeInfo};
pub use value::{ObjectPayload, ObjectVar, ShardVar, Value, ValueKind, ValueOrder};
pub use variables::{make_var, var_get, var_set, ParamVar, VarRef, VarSlot};
pub use wire::{run_shards, run_shards_hashed, WeakWire, Wire, WireState};

// Payload primitives re-exported for embedders
pub use weft_core::{Audio, Color, FloatVec2, FloatVec3, FloatVec4, Image, IntVec16, IntVec2, IntVec3, IntVec4, IntVec8};
