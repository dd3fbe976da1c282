use wgpu::{BindGroupLayoutEntry, BindingType, BufferBindingType, ShaderStages};

pub fn storage_read_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub fn storage_read_write_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Layout matching `ShaderHelper::declare_variables`: read-only inputs in operand
/// order, then read-write outputs.
pub fn build_program_bgl(
    device: &wgpu::Device,
    n_inputs: usize,
    n_outputs: usize,
) -> wgpu::BindGroupLayout {
    let mut entries = Vec::with_capacity(n_inputs + n_outputs);
    for i in 0..n_inputs {
        entries.push(storage_read_entry(i as u32));
    }
    for o in 0..n_outputs {
        entries.push(storage_read_write_entry((n_inputs + o) as u32));
    }
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("opforge-program-bgl"),
        entries: &entries,
    })
}
