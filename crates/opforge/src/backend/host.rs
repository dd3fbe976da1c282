//! In-process reference executor.
//!
//! Owns tensor storage as `f32` vectors, drives operators through the same
//! [`ComputeContext`] and program cache a GPU executor uses (so every dispatch still
//! renders its WGSL), and evaluates each program on the CPU in the shader's
//! arithmetic order. `f16` tensors are stored widened to `f32`.

use crate::cache::{load_program, ProgramCache};
use crate::config::GeneratorOptions;
use crate::context::ComputeContext;
use crate::error::{KernelError, Result};
use crate::kernel::Operator;
use crate::program::{DispatchGroup, ProgramArtifact, ProgramInfoLoader};
use crate::shape;
use crate::wgsl::WorkgroupSize;
use opforge_api::{DataType, TensorHandle, TensorView};
use std::collections::HashMap;
use std::sync::Arc;

/// Borrowed operand data handed to [`Kernel::evaluate_host`](crate::Kernel::evaluate_host).
#[derive(Debug, Clone, Copy)]
pub struct HostTensor<'a> {
    pub dims: &'a [usize],
    pub data: &'a [f32],
}

/// One scheduled program, in submission order.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub name: &'static str,
    pub key_hash: u64,
    pub dispatch: DispatchGroup,
    pub workgroup_size: WorkgroupSize,
    pub program: Arc<ProgramArtifact>,
}

#[derive(Debug)]
struct StoredTensor {
    data_type: DataType,
    data: Vec<f32>,
}

pub struct HostExecutor {
    options: GeneratorOptions,
    cache: ProgramCache<Arc<ProgramArtifact>>,
    storage: HashMap<TensorHandle, StoredTensor>,
    next_handle: u64,
    dispatches: Vec<DispatchRecord>,
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostExecutor {
    /// Executor configured from the process environment.
    pub fn new() -> Self {
        Self::with_options(GeneratorOptions::global().clone())
    }

    pub fn with_options(options: GeneratorOptions) -> Self {
        log::info!(
            "host executor ready (program cache {}, shader dumps {})",
            if options.cache_enabled { "on" } else { "off" },
            options
                .dump_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "off".to_string())
        );
        Self {
            cache: ProgramCache::new(options.cache_enabled),
            options,
            storage: HashMap::new(),
            next_handle: 1,
            dispatches: Vec::new(),
        }
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    pub fn cache(&self) -> &ProgramCache<Arc<ProgramArtifact>> {
        &self.cache
    }

    pub fn dispatches(&self) -> &[DispatchRecord] {
        &self.dispatches
    }

    fn allocate(&mut self, dims: Vec<usize>, data_type: DataType, data: Vec<f32>) -> TensorView {
        let handle = TensorHandle(self.next_handle);
        self.next_handle += 1;
        self.storage.insert(handle, StoredTensor { data_type, data });
        TensorView::new(dims, data_type, handle)
    }

    pub fn upload(&mut self, dims: &[usize], data_type: DataType, data: &[f32]) -> Result<TensorView> {
        if shape::checked_size(dims) != Some(data.len()) {
            return Err(KernelError::invalid(format!(
                "upload of {} values into shape {dims:?}",
                data.len()
            )));
        }
        Ok(self.allocate(dims.to_vec(), data_type, data.to_vec()))
    }

    pub fn download(&self, view: &TensorView) -> Result<Vec<f32>> {
        self.storage
            .get(&view.handle)
            .map(|t| t.data.clone())
            .ok_or(KernelError::UnknownTensor(view.handle))
    }

    pub fn release(&mut self, handle: TensorHandle) -> bool {
        self.storage.remove(&handle).is_some()
    }

    /// Run `operator` on `inputs`; returns the output views.
    pub fn run(&mut self, operator: &Operator, inputs: &[TensorView]) -> Result<Vec<TensorView>> {
        for input in inputs {
            let stored = self
                .storage
                .get(&input.handle)
                .ok_or(KernelError::UnknownTensor(input.handle))?;
            if stored.data_type != input.data_type
                || shape::checked_size(&input.dims) != Some(stored.data.len())
            {
                return Err(KernelError::invalid(format!(
                    "view {} does not match its storage",
                    input.handle
                )));
            }
        }
        let mut context = HostContext {
            executor: self,
            inputs: inputs.to_vec(),
            outputs: Vec::new(),
        };
        log::trace!("running {} on {} inputs", operator.name(), inputs.len());
        operator.run(&mut context)?;
        Ok(context.outputs)
    }
}

/// [`ComputeContext`] over a [`HostExecutor`] for one operator invocation.
pub struct HostContext<'a> {
    executor: &'a mut HostExecutor,
    inputs: Vec<TensorView>,
    outputs: Vec<TensorView>,
}

impl ComputeContext for HostContext<'_> {
    fn inputs(&self) -> &[TensorView] {
        &self.inputs
    }

    fn compute(&mut self, loader: ProgramInfoLoader) -> Result<Vec<TensorView>> {
        let executor = &mut *self.executor;
        let artifact = load_program(&executor.cache, &executor.options, &loader, Ok)?;

        let results = {
            let mut operands = Vec::with_capacity(loader.inputs().len());
            for view in loader.inputs() {
                let stored = executor
                    .storage
                    .get(&view.handle)
                    .ok_or(KernelError::UnknownTensor(view.handle))?;
                operands.push(HostTensor {
                    dims: &view.dims,
                    data: &stored.data,
                });
            }
            artifact
                .kernel
                .evaluate_host(&operands, &artifact.info.outputs)?
        };

        let mut views = Vec::with_capacity(results.len());
        for (info, data) in artifact.info.outputs.iter().zip(results) {
            views.push(executor.allocate(info.dims.clone(), info.data_type, data));
        }
        executor.dispatches.push(DispatchRecord {
            name: artifact.name(),
            key_hash: artifact.key_hash,
            dispatch: artifact.dispatch,
            workgroup_size: artifact.workgroup_size(),
            program: Arc::clone(&artifact),
        });
        self.outputs.extend(views.iter().cloned());
        Ok(views)
    }
}
