use super::bindings::build_program_bgl;
use crate::backend::host::DispatchRecord;
use crate::cache::{load_program, ProgramCache};
use crate::config::GeneratorOptions;
use crate::context::ComputeContext;
use crate::error::{KernelError, Result};
use crate::kernel::Operator;
use crate::program::{ProgramArtifact, ProgramInfoLoader};
use crate::shape;
use opforge_api::{DataType, TensorHandle, TensorView};
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use wgpu::util::DeviceExt;

/// Smallest buffer we allocate; zero-sized bindings are invalid.
const MIN_BUFFER_BYTES: u64 = 4;

/// A cached program together with its compiled pipeline.
pub struct CompiledProgram {
    pub artifact: Arc<ProgramArtifact>,
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
}

struct GpuTensor {
    buffer: wgpu::Buffer,
    len: usize,
}

pub struct WgpuExecutor {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    options: GeneratorOptions,
    cache: ProgramCache<Arc<CompiledProgram>>,
    buffers: HashMap<TensorHandle, GpuTensor>,
    next_handle: u64,
    dispatches: Vec<DispatchRecord>,
}

fn ensure_f32(data_type: DataType) -> Result<()> {
    if data_type == DataType::Float32 {
        Ok(())
    } else {
        Err(KernelError::UnsupportedDataType(data_type))
    }
}

impl WgpuExecutor {
    pub fn new() -> Result<Self> {
        Self::with_options(GeneratorOptions::global().clone())
    }

    pub fn with_options(options: GeneratorOptions) -> Result<Self> {
        pollster::block_on(Self::new_async(options))
    }

    pub async fn new_async(options: GeneratorOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| KernelError::Backend("wgpu: no compatible adapter found".into()))?;
        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("opforge wgpu device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                },
                None,
            )
            .await
            .map_err(|e| KernelError::Backend(format!("wgpu: request_device failed: {e}")))?;

        let mut options = options;
        options.max_dispatch_workgroups = options
            .max_dispatch_workgroups
            .min(limits.max_compute_workgroups_per_dimension);
        log::info!(
            "wgpu executor ready on '{}' ({:?}), max dispatch per dimension {}",
            adapter_info.name,
            adapter_info.backend,
            options.max_dispatch_workgroups
        );
        Ok(Self {
            device,
            queue,
            adapter_info,
            cache: ProgramCache::new(options.cache_enabled),
            options,
            buffers: HashMap::new(),
            next_handle: 1,
            dispatches: Vec::new(),
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn cache(&self) -> &ProgramCache<Arc<CompiledProgram>> {
        &self.cache
    }

    pub fn dispatches(&self) -> &[DispatchRecord] {
        &self.dispatches
    }

    fn storage_buffer(&self, label: &str, len: usize) -> wgpu::Buffer {
        let bytes = (len as u64 * 4).max(MIN_BUFFER_BYTES);
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn register(&mut self, buffer: wgpu::Buffer, len: usize) -> TensorHandle {
        let handle = TensorHandle(self.next_handle);
        self.next_handle += 1;
        self.buffers.insert(handle, GpuTensor { buffer, len });
        handle
    }

    pub fn upload(&mut self, dims: &[usize], data_type: DataType, data: &[f32]) -> Result<TensorView> {
        ensure_f32(data_type)?;
        if shape::checked_size(dims) != Some(data.len()) {
            return Err(KernelError::invalid(format!(
                "upload of {} values into shape {dims:?}",
                data.len()
            )));
        }
        let buffer = if data.is_empty() {
            self.storage_buffer("opforge-upload", 0)
        } else {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("opforge-upload"),
                    contents: bytemuck::cast_slice(data),
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC
                        | wgpu::BufferUsages::COPY_DST,
                })
        };
        let handle = self.register(buffer, data.len());
        Ok(TensorView::new(dims.to_vec(), data_type, handle))
    }

    pub fn download(&self, view: &TensorView) -> Result<Vec<f32>> {
        let tensor = self
            .buffers
            .get(&view.handle)
            .ok_or(KernelError::UnknownTensor(view.handle))?;
        if tensor.len == 0 {
            return Ok(Vec::new());
        }
        let size_bytes = tensor.len as u64 * 4;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("opforge-readback"),
            size: size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("opforge-readback-encoder"),
            });
        encoder.copy_buffer_to_buffer(&tensor.buffer, 0, &staging, 0, size_bytes);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| KernelError::Backend("readback: map_async callback dropped".into()))?
            .map_err(|e| KernelError::Backend(format!("readback: {e}")))?;
        let data = slice.get_mapped_range();
        let out: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }

    pub fn release(&mut self, handle: TensorHandle) -> bool {
        self.buffers.remove(&handle).is_some()
    }

    pub fn run(&mut self, operator: &Operator, inputs: &[TensorView]) -> Result<Vec<TensorView>> {
        for input in inputs {
            ensure_f32(input.data_type)?;
            if !self.buffers.contains_key(&input.handle) {
                return Err(KernelError::UnknownTensor(input.handle));
            }
        }
        let mut context = WgpuContext {
            executor: self,
            inputs: inputs.to_vec(),
            outputs: Vec::new(),
        };
        operator.run(&mut context)?;
        Ok(context.outputs)
    }

    fn compile(&self, artifact: Arc<ProgramArtifact>) -> Result<Arc<CompiledProgram>> {
        let label = format!("{}-{:016x}", artifact.name(), artifact.key_hash);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(artifact.shader_source.as_str().into()),
            });
        let layout = build_program_bgl(
            &self.device,
            artifact.key.inputs.len(),
            artifact.info.outputs.len(),
        );
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&label),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: "main",
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(KernelError::Backend(format!(
                "pipeline {label} failed validation: {err}"
            )));
        }
        Ok(Arc::new(CompiledProgram {
            artifact,
            pipeline,
            layout,
        }))
    }

    fn dispatch(&mut self, program: &CompiledProgram, inputs: &[TensorView]) -> Result<Vec<TensorView>> {
        let artifact = &program.artifact;
        let mut outputs = Vec::with_capacity(artifact.info.outputs.len());
        for info in &artifact.info.outputs {
            ensure_f32(info.data_type)?;
            let buffer = self.storage_buffer("opforge-output", info.size());
            let handle = self.register(buffer, info.size());
            outputs.push(TensorView::new(info.dims.clone(), info.data_type, handle));
        }

        let mut entries = Vec::with_capacity(inputs.len() + outputs.len());
        for (binding, view) in inputs.iter().chain(outputs.iter()).enumerate() {
            let tensor = self
                .buffers
                .get(&view.handle)
                .ok_or(KernelError::UnknownTensor(view.handle))?;
            entries.push(wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: tensor.buffer.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("opforge-bind-group"),
            layout: &program.layout,
            entries: &entries,
        });

        let [x, y, z] = artifact.dispatch.dims();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("opforge-dispatch-encoder"),
            });
        if artifact.dispatch.total() > 0 {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(artifact.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue.submit(Some(encoder.finish()));
        log::trace!(
            "dispatched {} {:016x} groups={}",
            artifact.name(),
            artifact.key_hash,
            artifact.dispatch
        );
        self.dispatches.push(DispatchRecord {
            name: artifact.name(),
            key_hash: artifact.key_hash,
            dispatch: artifact.dispatch,
            workgroup_size: artifact.workgroup_size(),
            program: Arc::clone(artifact),
        });
        Ok(outputs)
    }
}

struct WgpuContext<'a> {
    executor: &'a mut WgpuExecutor,
    inputs: Vec<TensorView>,
    outputs: Vec<TensorView>,
}

impl ComputeContext for WgpuContext<'_> {
    fn inputs(&self) -> &[TensorView] {
        &self.inputs
    }

    fn compute(&mut self, loader: ProgramInfoLoader) -> Result<Vec<TensorView>> {
        let executor = &mut *self.executor;
        let program = load_program(&executor.cache, &executor.options, &loader, |artifact| {
            executor.compile(artifact)
        })?;
        let views = executor.dispatch(&program, loader.inputs())?;
        self.outputs.extend(views.iter().cloned());
        Ok(views)
    }
}
