//! GPU executor on `wgpu`. Buffers hold `f32` only.

pub mod bindings;
mod executor;

pub use executor::{CompiledProgram, WgpuExecutor};
