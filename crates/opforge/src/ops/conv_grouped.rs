//! Grouped 2-D convolution, one invocation per output element.

use super::fuse_utils::{activation_snippet, ActivationSnippet};
use crate::backend::host::HostTensor;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::program::{DispatchGroup, ProgramInfo, ProgramInfoLoader, ProgramMetadata, TensorInfo};
use crate::shape;
use crate::wgsl::{to_i32, to_u32, vec2_i32, IndicesHelper, ShaderHelper, WorkgroupSize};
use opforge_api::{ConvAttributes, GpuDataType, TensorLayout, TensorView};
use std::fmt::Write;

pub const CONV_WORKGROUP_SIZE: u32 = 64;

/// Post-processing of the rank-4 output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputSqueeze {
    #[default]
    None,
    /// Drop the unit spatial axis a 1-D convolution was lifted with.
    Conv1d,
}

impl OutputSqueeze {
    pub fn apply(self, mut dims: Vec<usize>, format: TensorLayout) -> Vec<usize> {
        if self == OutputSqueeze::Conv1d && dims.len() == 4 {
            let axis = if format.is_channel_last() { 1 } else { 2 };
            dims.remove(axis);
        }
        dims
    }

    fn cache_suffix(self) -> &'static str {
        match self {
            OutputSqueeze::None => "",
            OutputSqueeze::Conv1d => ";conv1d",
        }
    }
}

/// Geometry baked into the shader, range-checked once.
#[derive(Debug, Clone, Copy)]
struct ConvGeometry {
    batch: usize,
    in_channels: usize,
    x_height: usize,
    x_width: usize,
    out_channels: usize,
    out_height: usize,
    out_width: usize,
    in_channels_per_group: usize,
    out_channels_per_group: usize,
    kernel: [usize; 2],
    strides: [usize; 2],
    pads: [usize; 2],
    dilations: [usize; 2],
}

impl ConvGeometry {
    fn new(
        x: &[usize],
        w: &[usize],
        output: &[usize],
        attributes: &ConvAttributes,
    ) -> Result<Self> {
        let channel_last = attributes.format().is_channel_last();
        let (in_channels, x_height, x_width) = if channel_last {
            (x[3], x[1], x[2])
        } else {
            (x[1], x[2], x[3])
        };
        let (out_height, out_width) = if channel_last {
            (output[1], output[2])
        } else {
            (output[2], output[3])
        };
        let group = attributes.group();
        if group == 0 || w[0] % group != 0 {
            return Err(KernelError::invalid(format!(
                "group {group} does not divide {} output channels",
                w[0]
            )));
        }
        if w[1].checked_mul(group) != Some(in_channels) {
            return Err(KernelError::invalid(format!(
                "input has {in_channels} channels but weights expect {} x {group}",
                w[1]
            )));
        }
        let pair = |values: &[usize], name: &str| -> Result<[usize; 2]> {
            match values {
                [a, b, ..] => Ok([*a, *b]),
                _ => Err(KernelError::invalid(format!("conv {name} needs two entries"))),
            }
        };
        Ok(Self {
            batch: x[0],
            in_channels,
            x_height,
            x_width,
            out_channels: w[0],
            out_height,
            out_width,
            in_channels_per_group: w[1],
            out_channels_per_group: w[0] / group,
            kernel: [w[2], w[3]],
            strides: pair(attributes.strides(), "strides")?,
            pads: pair(attributes.pads(), "pads")?,
            dilations: pair(attributes.dilations(), "dilations")?,
        })
    }
}

fn output_elements(output_shape: &[usize]) -> Result<usize> {
    shape::checked_size(output_shape)
        .ok_or_else(|| KernelError::out_of_range("output size", format!("{output_shape:?}")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupedConv {
    attributes: ConvAttributes,
    squeeze: OutputSqueeze,
}

impl GroupedConv {
    pub const NAME: &'static str = "GroupedConv";

    pub fn new(attributes: ConvAttributes, squeeze: OutputSqueeze) -> Self {
        Self {
            attributes,
            squeeze,
        }
    }

    pub fn attributes(&self) -> &ConvAttributes {
        &self.attributes
    }

    pub fn squeeze(&self) -> OutputSqueeze {
        self.squeeze
    }

    /// Two operands, or three with a bias.
    pub fn metadata(&self, input_count: usize) -> ProgramMetadata {
        let input_types = if input_count > 2 {
            vec![GpuDataType::Default; 3]
        } else {
            vec![GpuDataType::Default; 2]
        };
        ProgramMetadata::new(Self::NAME, input_types).with_cache_hint(format!(
            "{}{}",
            self.attributes.cache_key(),
            self.squeeze.cache_suffix()
        ))
    }

    fn output_dims(&self, x: &[usize], w: &[usize]) -> Result<Vec<usize>> {
        shape::conv_output_shape(
            x,
            w,
            self.attributes.dilations(),
            self.attributes.pads(),
            self.attributes.strides(),
            self.attributes.format(),
        )
        .ok_or_else(|| {
            KernelError::invalid(format!(
                "kernel {w:?} does not fit input {x:?} with pads {:?}",
                self.attributes.pads()
            ))
        })
    }

    /// Generate the program for validated rank-4 inputs.
    pub fn program_info(&self, inputs: &[TensorView]) -> Result<ProgramInfo> {
        let (x, w) = match inputs {
            [x, w] | [x, w, _] => (x, w),
            _ => return Err(KernelError::invalid("GroupedConv expects 2 or 3 inputs")),
        };
        if x.rank() != 4 || w.rank() != 4 {
            return Err(KernelError::invalid(format!(
                "GroupedConv expects rank-4 x and w, got {:?} and {:?}",
                x.dims, w.dims
            )));
        }
        let has_bias = inputs.len() == 3;
        let data_type = x.data_type;
        let output_shape = self.output_dims(&x.dims, &w.dims)?;
        let geometry = ConvGeometry::new(&x.dims, &w.dims, &output_shape, &self.attributes)?;
        let output_elements = output_elements(&output_shape)?;
        let output_size = to_u32("output size", output_elements)?;

        let x_var = IndicesHelper::input("x", data_type, &x.dims)?;
        let w_var = IndicesHelper::input("w", data_type, &w.dims)?;
        let b_var = if has_bias {
            Some(IndicesHelper::input("b", data_type, &inputs[2].dims)?)
        } else {
            None
        };
        let output = IndicesHelper::output("output", data_type, &output_shape)?;
        let activation = activation_snippet(self.attributes.activation(), output.value_type())?;
        let constants = ShaderConstants::new(&geometry)?;
        let channel_last = self.attributes.format().is_channel_last();

        let workgroup_size = WorkgroupSize::linear(CONV_WORKGROUP_SIZE);
        let shader_source = Box::new(move |helper: &ShaderHelper| {
            let mut vars: Vec<&IndicesHelper> = vec![&x_var, &w_var];
            vars.extend(b_var.as_ref());
            vars.push(&output);
            let mut src = helper.declare_variables(&vars);
            src.push('\n');
            src.push_str(&activation.function);
            src.push('\n');
            src.push_str(&helper.main_start(workgroup_size));
            src.push_str(&helper.guard_against_out_of_bounds_workgroup_sizes(output_size));
            write_conv_body(
                &mut src,
                &x_var,
                &w_var,
                b_var.as_ref(),
                &output,
                &constants,
                channel_last,
                &activation,
            );
            src.push_str("}\n");
            src
        });

        let workgroups = to_u32(
            "dispatch",
            output_elements.div_ceil(CONV_WORKGROUP_SIZE as usize),
        )?;
        let out_dims = self.squeeze.apply(output_shape, self.attributes.format());
        Ok(ProgramInfo {
            metadata: self.metadata(inputs.len()),
            outputs: vec![TensorInfo::new(out_dims, data_type)],
            workgroup_size,
            shader_source,
            dispatch_group: Box::new(move || DispatchGroup::linear(workgroups)),
        })
    }

    /// Host evaluation, element by element in the shader's loop order. Out-of-bounds
    /// kernel taps are skipped.
    pub fn evaluate_host(
        &self,
        inputs: &[HostTensor<'_>],
        outputs: &[TensorInfo],
    ) -> Result<Vec<Vec<f32>>> {
        let (x, w) = match inputs {
            [x, w] | [x, w, _] => (x, w),
            _ => return Err(KernelError::invalid("GroupedConv expects 2 or 3 inputs")),
        };
        if x.dims.len() != 4 || w.dims.len() != 4 {
            return Err(KernelError::invalid("GroupedConv expects rank-4 x and w"));
        }
        let bias = inputs.get(2);
        let output_shape = self.output_dims(x.dims, w.dims)?;
        let g = ConvGeometry::new(x.dims, w.dims, &output_shape, &self.attributes)?;
        let channel_last = self.attributes.format().is_channel_last();
        let activation = self.attributes.activation();

        let total = output_elements(&output_shape)?;
        if outputs.first().map(TensorInfo::size) != Some(total) {
            return Err(KernelError::invalid("GroupedConv output does not match its descriptor"));
        }
        if bias.is_some_and(|b| b.data.len() < g.out_channels) {
            return Err(KernelError::invalid("bias is shorter than the output channel count"));
        }
        let x_at = |n: usize, c: usize, h: usize, wi: usize| {
            let idx = if channel_last {
                ((n * g.x_height + h) * g.x_width + wi) * g.in_channels + c
            } else {
                ((n * g.in_channels + c) * g.x_height + h) * g.x_width + wi
            };
            x.data[idx]
        };
        let w_at = |m: usize, c: usize, kh: usize, kw: usize| {
            w.data[((m * g.in_channels_per_group + c) * g.kernel[0] + kh) * g.kernel[1] + kw]
        };

        let mut out = vec![0.0f32; total];
        for (flat, slot) in out.iter_mut().enumerate() {
            let idx = shape::offset_to_indices(flat, &output_shape);
            let (batch, oc, oh, ow) = if channel_last {
                (idx[0], idx[3], idx[1], idx[2])
            } else {
                (idx[0], idx[1], idx[2], idx[3])
            };
            let group_id = oc / g.out_channels_per_group;
            let corner_h = (oh * g.strides[0]) as i64 - g.pads[0] as i64;
            let corner_w = (ow * g.strides[1]) as i64 - g.pads[1] as i64;
            let mut value = 0.0f32;
            for wc in 0..g.in_channels_per_group {
                let input_channel = group_id * g.in_channels_per_group + wc;
                for kh in 0..g.kernel[0] {
                    let xh = corner_h + (kh * g.dilations[0]) as i64;
                    if xh < 0 || xh >= g.x_height as i64 {
                        continue;
                    }
                    for kw in 0..g.kernel[1] {
                        let xw = corner_w + (kw * g.dilations[1]) as i64;
                        if xw < 0 || xw >= g.x_width as i64 {
                            continue;
                        }
                        value += x_at(batch, input_channel, xh as usize, xw as usize)
                            * w_at(oc, wc, kh, kw);
                    }
                }
            }
            if let Some(b) = bias {
                value += b.data[oc];
            }
            *slot = activation.apply(value);
        }
        debug_assert_eq!(g.batch * g.out_channels * g.out_height * g.out_width, total);
        Ok(vec![out])
    }
}

/// Numeric constants for the shader body, already typed for WGSL.
#[derive(Debug, Clone)]
struct ShaderConstants {
    strides: String,
    pads: String,
    dilations: String,
    x_height: i32,
    x_width: i32,
    in_channels_per_group: u32,
    out_channels_per_group: u32,
    kernel_height: u32,
    kernel_width: u32,
}

impl ShaderConstants {
    fn new(g: &ConvGeometry) -> Result<Self> {
        let ivec = |name: &'static str, v: [usize; 2]| -> Result<String> {
            Ok(vec2_i32([to_i32(name, v[0])?, to_i32(name, v[1])?]))
        };
        // Corners are computed in i32, so output coordinates times strides must fit.
        to_i32("x height", g.out_height.saturating_mul(g.strides[0]))?;
        to_i32("x width", g.out_width.saturating_mul(g.strides[1]))?;
        Ok(Self {
            strides: ivec("strides", g.strides)?,
            pads: ivec("pads", g.pads)?,
            dilations: ivec("dilations", g.dilations)?,
            x_height: to_i32("x height", g.x_height)?,
            x_width: to_i32("x width", g.x_width)?,
            in_channels_per_group: to_u32("input channels per group", g.in_channels_per_group)?,
            out_channels_per_group: to_u32("output channels per group", g.out_channels_per_group)?,
            kernel_height: to_u32("kernel height", g.kernel[0])?,
            kernel_width: to_u32("kernel width", g.kernel[1])?,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn write_conv_body(
    src: &mut String,
    x: &IndicesHelper,
    w: &IndicesHelper,
    b: Option<&IndicesHelper>,
    output: &IndicesHelper,
    c: &ShaderConstants,
    channel_last: bool,
    activation: &ActivationSnippet,
) {
    let t = output.value_type();
    let (oc, oh, ow) = if channel_last { (3, 1, 2) } else { (1, 2, 3) };
    let x_get = if channel_last {
        x.get(&["batch", "u32(x_height)", "u32(x_width)", "input_channel"])
    } else {
        x.get(&["batch", "input_channel", "u32(x_height)", "u32(x_width)"])
    };
    let w_get = w.get(&["output_channel", "w_in_channel", "w_height", "w_width"]);

    let _ = writeln!(src, "  let strides = {};", c.strides);
    let _ = writeln!(src, "  let pads = {};", c.pads);
    let _ = writeln!(src, "  let dilations = {};", c.dilations);
    let _ = writeln!(
        src,
        "  let output_indices = {};",
        output.offset_to_indices("global_idx")
    );
    let _ = writeln!(src, "  let batch: u32 = output_indices[0];");
    let _ = writeln!(src, "  let output_channel: u32 = output_indices[{oc}];");
    let _ = writeln!(
        src,
        "  let x_corner = vec2<i32>(i32(output_indices[{oh}]), i32(output_indices[{ow}])) * strides - pads;"
    );
    let _ = writeln!(
        src,
        "  let group_id: u32 = output_channel / {}u;",
        c.out_channels_per_group
    );
    let _ = writeln!(src);
    let _ = writeln!(src, "  var value: {} = {};", t.as_str(), t.zero());
    let _ = writeln!(
        src,
        "  for (var w_in_channel: u32 = 0u; w_in_channel < {}u; w_in_channel++) {{",
        c.in_channels_per_group
    );
    let _ = writeln!(
        src,
        "    let input_channel = group_id * {}u + w_in_channel;",
        c.in_channels_per_group
    );
    let _ = writeln!(
        src,
        "    for (var w_height: u32 = 0u; w_height < {}u; w_height++) {{",
        c.kernel_height
    );
    let _ = writeln!(
        src,
        "      let x_height = x_corner.x + i32(w_height) * dilations.x;"
    );
    let _ = writeln!(
        src,
        "      if (x_height < 0i || x_height >= {}i) {{ continue; }}",
        c.x_height
    );
    let _ = writeln!(
        src,
        "      for (var w_width: u32 = 0u; w_width < {}u; w_width++) {{",
        c.kernel_width
    );
    let _ = writeln!(
        src,
        "        let x_width = x_corner.y + i32(w_width) * dilations.y;"
    );
    let _ = writeln!(
        src,
        "        if (x_width < 0i || x_width >= {}i) {{ continue; }}",
        c.x_width
    );
    let _ = writeln!(src, "        let x_val = {x_get};");
    let _ = writeln!(src, "        let w_val = {w_get};");
    let _ = writeln!(src, "        value += x_val * w_val;");
    let _ = writeln!(src, "      }}");
    let _ = writeln!(src, "    }}");
    let _ = writeln!(src, "  }}");
    if let Some(b) = b {
        let _ = writeln!(src, "  value += {};", b.get(&["output_channel"]));
    }
    src.push_str(&activation.apply);
    let _ = writeln!(src, "  {}", output.set_by_offset("global_idx", "value"));
}

pub fn create_grouped_conv_program_info_loader(
    inputs: &[TensorView],
    attributes: &ConvAttributes,
    squeeze: OutputSqueeze,
) -> ProgramInfoLoader {
    let kernel = GroupedConv::new(attributes.clone(), squeeze);
    let metadata = kernel.metadata(inputs.len());
    ProgramInfoLoader::new(metadata, Kernel::GroupedConv(kernel), inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opforge_api::{Activation, DataType, TensorHandle};

    fn view(dims: &[usize], handle: u64) -> TensorView {
        TensorView::new(dims.to_vec(), DataType::Float32, TensorHandle(handle))
    }

    fn render(loader: &ProgramInfoLoader) -> (ProgramInfo, String) {
        let info = loader.get().unwrap();
        let helper = ShaderHelper::new((info.dispatch_group)());
        let src = (info.shader_source)(&helper);
        (info, src)
    }

    #[test]
    fn overflowing_output_shape_is_out_of_range() {
        let huge = 1usize << (usize::BITS / 2 + 1);
        let loader = create_grouped_conv_program_info_loader(
            &[view(&[huge, 1, huge, 1], 1), view(&[1, 1, 1, 1], 2)],
            &ConvAttributes::basic(1),
            OutputSqueeze::None,
        );
        assert!(matches!(
            loader.get(),
            Err(KernelError::ConstantOutOfRange { name: "output size", .. })
        ));
    }

    #[test]
    fn descriptor_reports_output_and_dispatch() {
        let loader = create_grouped_conv_program_info_loader(
            &[view(&[1, 1, 4, 4], 1), view(&[1, 1, 2, 2], 2)],
            &ConvAttributes::basic(1),
            OutputSqueeze::None,
        );
        let (info, src) = render(&loader);
        assert_eq!(info.metadata.name, "GroupedConv");
        assert_eq!(info.metadata.input_types.len(), 2);
        assert_eq!(info.outputs[0].dims, vec![1, 1, 3, 3]);
        assert_eq!((info.dispatch_group)(), DispatchGroup::linear(1));
        assert!(src.contains("if (global_idx >= 9u) { return; }"));
        assert!(src.contains("let x_val = get_x(batch, input_channel, u32(x_height), u32(x_width));"));
        assert!(src.contains("output[global_idx] = value;"));
        assert!(!src.contains("apply_activation"));
    }

    #[test]
    fn bias_binding_and_activation_are_emitted() {
        let attrs = ConvAttributes::basic(1).with_activation(Activation::Relu);
        let loader = create_grouped_conv_program_info_loader(
            &[view(&[1, 2, 3, 3], 1), view(&[4, 2, 1, 1], 2), view(&[4], 3)],
            &attrs,
            OutputSqueeze::None,
        );
        let (info, src) = render(&loader);
        assert_eq!(info.metadata.input_types.len(), 3);
        assert!(src.contains("@binding(2) var<storage, read> b: array<f32>;"));
        assert!(src.contains("@binding(3) var<storage, read_write> output: array<f32>;"));
        assert!(src.contains("value += get_b(output_channel);"));
        assert!(src.contains("value = apply_activation(value);"));
        let bias_at = src.find("value += get_b").unwrap();
        let act_at = src.find("value = apply_activation").unwrap();
        assert!(bias_at < act_at);
    }

    #[test]
    fn channel_last_reads_channel_from_last_axis() {
        let attrs = ConvAttributes::basic(1).with_format(TensorLayout::ChannelLast);
        let loader = create_grouped_conv_program_info_loader(
            &[view(&[1, 4, 4, 2], 1), view(&[3, 2, 2, 2], 2)],
            &attrs,
            OutputSqueeze::None,
        );
        let (info, src) = render(&loader);
        assert_eq!(info.outputs[0].dims, vec![1, 3, 3, 3]);
        assert!(src.contains("let output_channel: u32 = output_indices[3];"));
        assert!(src.contains("get_x(batch, u32(x_height), u32(x_width), input_channel)"));
    }

    #[test]
    fn conv1d_squeeze_changes_key_and_shape() {
        let inputs = [view(&[1, 1, 1, 5], 1), view(&[1, 1, 1, 3], 2)];
        let plain = create_grouped_conv_program_info_loader(
            &inputs,
            &ConvAttributes::basic(1),
            OutputSqueeze::None,
        );
        let squeezed = create_grouped_conv_program_info_loader(
            &inputs,
            &ConvAttributes::basic(1),
            OutputSqueeze::Conv1d,
        );
        assert_ne!(plain.key(), squeezed.key());
        assert_eq!(squeezed.get().unwrap().outputs[0].dims, vec![1, 1, 3]);
    }

    #[test]
    fn kernel_larger_than_input_is_rejected() {
        let loader = create_grouped_conv_program_info_loader(
            &[view(&[1, 1, 2, 2], 1), view(&[1, 1, 3, 3], 2)],
            &ConvAttributes::basic(1),
            OutputSqueeze::None,
        );
        assert!(loader.get().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn host_skips_out_of_bounds_taps() {
        let attrs = ConvAttributes::basic(1).with_pads(vec![1, 1, 1, 1]);
        let kernel = GroupedConv::new(attrs, OutputSqueeze::None);
        let ones = vec![1.0f32; 9];
        let inputs = [
            HostTensor { dims: &[1, 1, 3, 3], data: &ones },
            HostTensor { dims: &[1, 1, 3, 3], data: &ones },
        ];
        let outputs = [TensorInfo::new(vec![1, 1, 3, 3], DataType::Float32)];
        let out = kernel.evaluate_host(&inputs, &outputs).unwrap().remove(0);
        assert_eq!(out, vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }
}
