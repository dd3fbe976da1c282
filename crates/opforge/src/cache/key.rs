use crate::program::ProgramMetadata;
use opforge_api::{DataType, GpuDataType, TensorView};
use smallvec::SmallVec;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Shape and type of one operand as seen by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputSignature {
    pub dims: SmallVec<[usize; 4]>,
    pub data_type: DataType,
    pub gpu_data_type: GpuDataType,
}

/// Cache key: operator name, attribute cache hint and the input signature. Never
/// derived from buffer contents or handles, so equal keys render equal WGSL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub name: &'static str,
    pub cache_hint: String,
    pub inputs: SmallVec<[InputSignature; 3]>,
}

impl ProgramKey {
    pub fn new(metadata: &ProgramMetadata, inputs: &[TensorView]) -> Self {
        let inputs = inputs
            .iter()
            .enumerate()
            .map(|(i, view)| InputSignature {
                dims: SmallVec::from_slice(&view.dims),
                data_type: view.data_type,
                gpu_data_type: metadata.input_types.get(i).copied().unwrap_or_default(),
            })
            .collect();
        Self {
            name: metadata.name,
            cache_hint: metadata.cache_hint.clone().unwrap_or_default(),
            inputs,
        }
    }

    /// 64-bit hash used to name dumped shader files.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.cache_hint.hash(&mut hasher);
        for input in &self.inputs {
            input.dims.as_slice().hash(&mut hasher);
            input.data_type.onnx_tag().hash(&mut hasher);
            (input.gpu_data_type as u8).hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.cache_hint)?;
        for input in &self.inputs {
            write!(f, ":{:?}/{}", input.dims.as_slice(), input.data_type)?;
            if input.gpu_data_type != GpuDataType::Default {
                write!(f, "/{:?}", input.gpu_data_type)?;
            }
        }
        Ok(())
    }
}
