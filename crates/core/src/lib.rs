//! Weft Core: payload primitives for the Weft dataflow runtime
//!
//! This crate holds the blittable payload layer shared by the runtime and by
//! hosts that exchange values with it. Nothing here knows about wires,
//! meshes, or shards.
//!
//! # Modules
//!
//! - `vectors`: fixed-width integer/float vector payloads and `Color`
//! - `buffers`: `Image` and `Audio` sample buffers with their flag words
//! - `hash`: the deterministic 128-bit streaming content hasher

pub mod buffers;
pub mod hash;
pub mod vectors;

pub use buffers::{
    Audio, Image, IMAGE_FLAG_16BIT_INT, IMAGE_FLAG_32BIT_FLOAT, IMAGE_FLAG_BGRA,
    IMAGE_FLAG_PREMULTIPLIED_ALPHA,
};
pub use hash::Hash128;
pub use vectors::{Color, FloatVec2, FloatVec3, FloatVec4, IntVec16, IntVec2, IntVec3, IntVec4, IntVec8};
