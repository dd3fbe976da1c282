use crate::error::Result;
use crate::program::{DispatchGroup, ProgramArtifact, TensorInfo};
use crate::wgsl::WorkgroupSize;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bump this when the dump layout or shader binding scheme changes.
pub const SHADER_DUMP_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShaderDumpMeta {
    pub name: String,
    pub cache_hint: String,
    pub key: String,
    pub workgroup_size: [u32; 3],
    pub dispatch: DispatchGroup,
    pub outputs: Vec<TensorInfo>,
    /// Optional so older dumps still parse; absent means incompatible.
    pub version: Option<u32>,
}

impl ShaderDumpMeta {
    fn from_artifact(artifact: &ProgramArtifact) -> Self {
        let WorkgroupSize { x, y, z } = artifact.workgroup_size();
        Self {
            name: artifact.name().to_string(),
            cache_hint: artifact.key.cache_hint.clone(),
            key: artifact.key.to_string(),
            workgroup_size: [x, y, z],
            dispatch: artifact.dispatch,
            outputs: artifact.info.outputs.clone(),
            version: Some(SHADER_DUMP_VERSION),
        }
    }
}

/// Write `<hash>.wgsl` and `<hash>.json` under `dir`; returns the WGSL path.
pub fn persist_program(dir: &Path, artifact: &ProgramArtifact) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stem = format!("{:016x}", artifact.key_hash);
    let wgsl_path = dir.join(format!("{stem}.wgsl"));
    std::fs::write(&wgsl_path, artifact.shader_source.as_bytes())?;
    let meta = ShaderDumpMeta::from_artifact(artifact);
    let json = serde_json::to_vec_pretty(&meta).map_err(std::io::Error::from)?;
    std::fs::write(dir.join(format!("{stem}.json")), json)?;
    Ok(wgsl_path)
}
