//! Program reuse: keys, the in-memory cache and optional on-disk shader dumps.

mod key;
mod persist;
mod registry;

pub use key::{InputSignature, ProgramKey};
pub use persist::{persist_program, ShaderDumpMeta, SHADER_DUMP_VERSION};
pub use registry::{CacheCounters, ProgramCache};

use crate::config::GeneratorOptions;
use crate::error::Result;
use crate::program::{ProgramArtifact, ProgramInfoLoader};
use std::sync::Arc;

/// Cache-or-generate. On a miss the loader runs, the artifact is dumped when
/// `dump_dir` is set, and `finish` turns it into the executor's cached value (a
/// compiled pipeline, or the artifact itself).
pub fn load_program<T, F>(
    cache: &ProgramCache<T>,
    options: &GeneratorOptions,
    loader: &ProgramInfoLoader,
    finish: F,
) -> Result<T>
where
    T: Clone,
    F: FnOnce(Arc<ProgramArtifact>) -> Result<T>,
{
    let key = loader.key();
    let before = cache.counters().hits;
    let value = cache.get_or_try_insert_with(key, |key| {
        let artifact = Arc::new(ProgramArtifact::build(
            key.clone(),
            loader,
            options.max_dispatch_workgroups,
        )?);
        log::debug!(
            "generated {} program {:016x} dispatch={} outputs={:?}",
            artifact.name(),
            artifact.key_hash,
            artifact.dispatch,
            artifact
                .info
                .outputs
                .iter()
                .map(|o| o.dims.as_slice())
                .collect::<Vec<_>>()
        );
        if let Some(dir) = options.dump_dir.as_deref() {
            match persist_program(dir, &artifact) {
                Ok(path) => log::debug!("shader dump written to {}", path.display()),
                Err(err) => log::warn!(
                    "failed to dump shader {:016x} to {}: {err}",
                    artifact.key_hash,
                    dir.display()
                ),
            }
        }
        finish(artifact)
    })?;
    if cache.counters().hits > before {
        log::trace!("program cache hit for {}", loader.metadata().name);
    }
    Ok(value)
}
