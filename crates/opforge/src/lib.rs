//! opforge: just-in-time WGSL kernel generation for tensor operators
//!
//! Each operator entry point validates its operands, builds a [`ProgramInfoLoader`]
//! and hands it to its [`ComputeContext`]. The executor behind the context looks the
//! loader's key up in a [`ProgramCache`], generates the program on a miss, and runs
//! it: on the GPU through [`backend::wgpu`] (feature `wgpu`) or on the CPU through
//! [`HostExecutor`].

pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod kernel;
pub mod ops;
pub mod program;
pub mod shape;
pub mod wgsl;

pub use backend::host::{DispatchRecord, HostExecutor, HostTensor};
pub use cache::{load_program, CacheCounters, ProgramCache, ProgramKey};
pub use config::GeneratorOptions;
pub use context::ComputeContext;
pub use error::{KernelError, Result};
pub use kernel::{Kernel, Operator};
pub use program::{
    DispatchGroup, ProgramArtifact, ProgramInfo, ProgramInfoLoader, ProgramMetadata, TensorInfo,
};

#[cfg(feature = "wgpu")]
pub use backend::wgpu::WgpuExecutor;

pub use opforge_api as api;
