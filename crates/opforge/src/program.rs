//! Program descriptors: what a kernel generator hands back to an executor.
//!
//! A [`ProgramInfoLoader`] is the cheap half (metadata, the kernel and its input
//! views), enough to compute a [`ProgramKey`]. [`ProgramInfoLoader::get`] runs the
//! generator and yields the [`ProgramInfo`]; [`ProgramArtifact::build`] then fixes
//! the dispatch against the device limit and renders the WGSL once.

use crate::cache::ProgramKey;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::wgsl::{ShaderHelper, WorkgroupSize};
use opforge_api::{DataType, GpuDataType, TensorView};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a family of programs independent of concrete shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramMetadata {
    pub name: &'static str,
    pub input_types: Vec<GpuDataType>,
    pub cache_hint: Option<String>,
}

impl ProgramMetadata {
    pub fn new(name: &'static str, input_types: Vec<GpuDataType>) -> Self {
        Self {
            name,
            input_types,
            cache_hint: None,
        }
    }

    pub fn with_cache_hint(mut self, hint: impl Into<String>) -> Self {
        self.cache_hint = Some(hint.into());
        self
    }
}

/// Shape and type the executor must allocate for one program output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dims: Vec<usize>,
    pub data_type: DataType,
    pub gpu_data_type: GpuDataType,
}

impl TensorInfo {
    pub fn new(dims: Vec<usize>, data_type: DataType) -> Self {
        Self {
            dims,
            data_type,
            gpu_data_type: GpuDataType::Default,
        }
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Workgroup counts per dimension. Unset `y`/`z` count as 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchGroup {
    pub x: u32,
    pub y: Option<u32>,
    pub z: Option<u32>,
}

impl DispatchGroup {
    pub const fn linear(x: u32) -> Self {
        Self {
            x,
            y: None,
            z: None,
        }
    }

    pub fn dims(&self) -> [u32; 3] {
        [self.x, self.y.unwrap_or(1), self.z.unwrap_or(1)]
    }

    pub fn total(&self) -> u64 {
        self.dims().iter().map(|&d| u64::from(d)).product()
    }

    /// Fold a dispatch that exceeds `limit` workgroups on any side into a square, or
    /// failing that a cube, covering at least as many workgroups. Shaders recover the
    /// flat index through [`ShaderHelper::main_start`] and must guard the surplus.
    pub fn normalize(self, limit: u32) -> Result<Self> {
        if limit == 0 {
            return Err(KernelError::invalid("dispatch limit must be positive"));
        }
        if self.dims().iter().all(|&d| d <= limit) {
            return Ok(self);
        }
        let total = self.total();
        let side = ceil_root(total, 2);
        if side <= u64::from(limit) {
            let side = side as u32;
            return Ok(Self {
                x: side,
                y: Some(side),
                z: None,
            });
        }
        let side = ceil_root(total, 3);
        if side <= u64::from(limit) {
            let side = side as u32;
            return Ok(Self {
                x: side,
                y: Some(side),
                z: Some(side),
            });
        }
        Err(KernelError::invalid(format!(
            "dispatch of {total} workgroups exceeds {limit} per dimension"
        )))
    }
}

impl fmt::Display for DispatchGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.dims();
        write!(f, "({x}, {y}, {z})")
    }
}

/// Smallest `r` with `r^k >= n`.
fn ceil_root(n: u64, k: u32) -> u64 {
    if n <= 1 {
        return n;
    }
    let mut r = (n as f64).powf(1.0 / f64::from(k)).ceil() as u64;
    while r > 1 && (r - 1).saturating_pow(k) >= n {
        r -= 1;
    }
    while r.saturating_pow(k) < n {
        r += 1;
    }
    r
}

pub type ShaderSourceFn = Box<dyn Fn(&ShaderHelper) -> String + Send + Sync>;
pub type DispatchGroupFn = Box<dyn Fn() -> DispatchGroup + Send + Sync>;

/// A fully generated program description. Every shape and attribute constant has
/// been range-checked by the time this exists, so rendering cannot fail.
pub struct ProgramInfo {
    pub metadata: ProgramMetadata,
    pub outputs: Vec<TensorInfo>,
    pub workgroup_size: WorkgroupSize,
    pub shader_source: ShaderSourceFn,
    pub dispatch_group: DispatchGroupFn,
}

impl fmt::Debug for ProgramInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramInfo")
            .field("metadata", &self.metadata)
            .field("outputs", &self.outputs)
            .field("workgroup_size", &self.workgroup_size)
            .field("dispatch_group", &(self.dispatch_group)())
            .finish_non_exhaustive()
    }
}

/// Deferred generation: metadata and inputs now, [`ProgramInfo`] on [`get`](Self::get).
#[derive(Debug, Clone)]
pub struct ProgramInfoLoader {
    metadata: ProgramMetadata,
    kernel: Kernel,
    inputs: Vec<TensorView>,
}

impl ProgramInfoLoader {
    pub fn new(metadata: ProgramMetadata, kernel: Kernel, inputs: &[TensorView]) -> Self {
        Self {
            metadata,
            kernel,
            inputs: inputs.to_vec(),
        }
    }

    pub fn metadata(&self) -> &ProgramMetadata {
        &self.metadata
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn inputs(&self) -> &[TensorView] {
        &self.inputs
    }

    pub fn key(&self) -> ProgramKey {
        ProgramKey::new(&self.metadata, &self.inputs)
    }

    pub fn get(&self) -> Result<ProgramInfo> {
        self.kernel.produce_descriptor(&self.inputs)
    }
}

/// A generated program with its dispatch normalized and WGSL rendered. Cached by
/// executors and shared read-only.
pub struct ProgramArtifact {
    pub key: ProgramKey,
    pub key_hash: u64,
    pub kernel: Kernel,
    pub info: ProgramInfo,
    pub dispatch: DispatchGroup,
    pub shader_source: String,
}

impl ProgramArtifact {
    pub fn build(key: ProgramKey, loader: &ProgramInfoLoader, max_dispatch: u32) -> Result<Self> {
        let info = loader.get()?;
        let dispatch = (info.dispatch_group)().normalize(max_dispatch)?;
        let shader_source = (info.shader_source)(&ShaderHelper::new(dispatch));
        Ok(Self {
            key_hash: key.stable_hash(),
            key,
            kernel: loader.kernel().clone(),
            info,
            dispatch,
            shader_source,
        })
    }

    pub fn name(&self) -> &'static str {
        self.info.metadata.name
    }

    pub fn workgroup_size(&self) -> WorkgroupSize {
        self.info.workgroup_size
    }
}

impl fmt::Debug for ProgramArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramArtifact")
            .field("key", &self.key.to_string())
            .field("key_hash", &format_args!("{:016x}", self.key_hash))
            .field("outputs", &self.info.outputs)
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_dispatches_are_unchanged() {
        let group = DispatchGroup::linear(65_535);
        assert_eq!(group.normalize(65_535).unwrap(), group);
        let empty = DispatchGroup::linear(0);
        assert_eq!(empty.normalize(65_535).unwrap(), empty);
    }

    #[test]
    fn large_dispatches_fold_to_square() {
        let folded = DispatchGroup::linear(100_000).normalize(65_535).unwrap();
        assert_eq!(folded, DispatchGroup { x: 317, y: Some(317), z: None });
        assert!(folded.total() >= 100_000);
    }

    #[test]
    fn oversized_dispatch_folds_to_cube_then_fails() {
        let folded = DispatchGroup::linear(1_000).normalize(10).unwrap();
        assert_eq!(folded, DispatchGroup { x: 10, y: Some(10), z: Some(10) });
        assert!(DispatchGroup::linear(1_000).normalize(9).is_err());
    }

    #[test]
    fn ceil_root_is_exact_on_boundaries() {
        assert_eq!(ceil_root(4, 2), 2);
        assert_eq!(ceil_root(5, 2), 3);
        assert_eq!(ceil_root(27, 3), 3);
        assert_eq!(ceil_root(28, 3), 4);
        assert_eq!(ceil_root(u64::from(u32::MAX), 2), 65_536);
    }
}
