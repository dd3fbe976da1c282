//! Last-axis softmax: one workgroup per row, max then sum reduced through
//! workgroup memory.

use crate::backend::host::HostTensor;
use crate::context::ComputeContext;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::program::{DispatchGroup, ProgramInfo, ProgramInfoLoader, ProgramMetadata, TensorInfo};
use crate::shape;
use crate::wgsl::{to_u32, IndicesHelper, ShaderHelper, WorkgroupSize};
use opforge_api::{DataType, GpuDataType, SoftmaxAttributes, TensorView};
use std::fmt::Write;

pub const SOFTMAX_WORKGROUP_SIZE: u32 = 64;

const LANES: usize = SOFTMAX_WORKGROUP_SIZE as usize;

pub fn validate_inputs(inputs: &[TensorView]) -> Result<()> {
    let [input] = inputs else {
        return Err(KernelError::invalid(format!(
            "Softmax requires 1 input, got {}",
            inputs.len()
        )));
    };
    match input.data_type {
        DataType::Float32 | DataType::Float16 => Ok(()),
        other => Err(KernelError::invalid(format!(
            "Softmax requires float16 or float32 input, got {other}"
        ))),
    }
}

/// Resolve `axis` for `rank` and require it to be the last one.
fn last_axis(attributes: &SoftmaxAttributes, rank: usize) -> Result<usize> {
    let axis = shape::normalize_axis(attributes.axis(), rank).ok_or_else(|| {
        KernelError::invalid(format!(
            "Softmax axis {} out of range for rank {rank}",
            attributes.axis()
        ))
    })?;
    if axis + 1 != rank {
        return Err(KernelError::invalid("softmax only supports last axis for now"));
    }
    Ok(axis)
}

/// `(rows, cols)` of the 2-D view of `dims` around its last axis, plus the element
/// count.
fn rows_and_cols(dims: &[usize], axis: usize) -> Result<(usize, usize, usize)> {
    let total = shape::checked_size(dims)
        .ok_or_else(|| KernelError::out_of_range("tensor size", format!("{dims:?}")))?;
    let cols = dims[axis];
    let rows = if cols == 0 { 0 } else { total / cols };
    Ok((rows, cols, total))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftmaxKernel {
    attributes: SoftmaxAttributes,
}

impl SoftmaxKernel {
    pub const NAME: &'static str = "Softmax";

    pub fn new(attributes: SoftmaxAttributes) -> Self {
        Self { attributes }
    }

    pub fn metadata(&self) -> ProgramMetadata {
        ProgramMetadata::new(Self::NAME, vec![GpuDataType::Default])
            .with_cache_hint(self.attributes.cache_key())
    }

    pub fn program_info(&self, inputs: &[TensorView]) -> Result<ProgramInfo> {
        validate_inputs(inputs)?;
        let input = &inputs[0];
        let axis = last_axis(&self.attributes, input.rank())?;
        let (rows, cols, total) = rows_and_cols(&input.dims, axis)?;

        let x = IndicesHelper::input("x", input.data_type, &[total])?;
        let output = IndicesHelper::output("result", input.data_type, &[total])?;
        let rows_u = to_u32("rows", rows)?;
        let cols_u = to_u32("cols", cols)?;

        let workgroup_size = WorkgroupSize::linear(SOFTMAX_WORKGROUP_SIZE);
        let shader_source = Box::new(move |helper: &ShaderHelper| {
            let mut src = helper.declare_variables(&[&x, &output]);
            write_shared_state(&mut src, &x, &output);
            src.push_str(&helper.main_start(workgroup_size));
            write_softmax_body(&mut src, &x, rows_u, cols_u);
            src.push_str("}\n");
            src
        });

        Ok(ProgramInfo {
            metadata: self.metadata(),
            outputs: vec![TensorInfo::new(input.dims.clone(), input.data_type)],
            workgroup_size,
            shader_source,
            dispatch_group: Box::new(move || DispatchGroup::linear(rows_u)),
        })
    }

    /// Host evaluation emulating the 64 lanes of each row's workgroup, including the
    /// order in which partial maxima and sums are combined.
    pub fn evaluate_host(
        &self,
        inputs: &[HostTensor<'_>],
        outputs: &[TensorInfo],
    ) -> Result<Vec<Vec<f32>>> {
        let [input] = inputs else {
            return Err(KernelError::invalid("Softmax requires 1 input"));
        };
        let axis = last_axis(&self.attributes, input.dims.len())?;
        let (rows, cols, _) = rows_and_cols(input.dims, axis)?;
        if outputs.first().map(TensorInfo::size) != Some(input.data.len()) {
            return Err(KernelError::invalid("Softmax output does not match its descriptor"));
        }

        let mut out = vec![0.0f32; input.data.len()];
        for row in 0..rows {
            let values = &input.data[row * cols..(row + 1) * cols];
            let row_max = reduce_row_max(values);
            let row_sum = reduce_row_sum(values, row_max);
            for (col, &v) in values.iter().enumerate() {
                out[row * cols + col] = (v - row_max).exp() / row_sum;
            }
        }
        Ok(vec![out])
    }
}

fn reduce_row_max(values: &[f32]) -> f32 {
    let cols = values.len();
    let mut shared = [0.0f32; LANES];
    for (lane, slot) in shared.iter_mut().enumerate().take(cols) {
        let mut thread_max = f32::MIN;
        for col in (lane..cols).step_by(LANES) {
            thread_max = thread_max.max(values[col]);
        }
        *slot = thread_max;
    }
    let mut reduce_size = cols.min(LANES);
    let mut curr_size = reduce_size >> 1;
    while curr_size > 0 {
        reduce_size = curr_size + (reduce_size & 1);
        for lane in 0..curr_size {
            shared[lane] = shared[lane].max(shared[lane + reduce_size]);
        }
        curr_size = reduce_size >> 1;
    }
    shared[0]
}

fn reduce_row_sum(values: &[f32], row_max: f32) -> f32 {
    let cols = values.len();
    let mut shared = [0.0f32; LANES];
    for (lane, slot) in shared.iter_mut().enumerate() {
        let mut thread_sum = 0.0f32;
        for col in (lane..cols).step_by(LANES) {
            thread_sum += (values[col] - row_max).exp();
        }
        *slot = thread_sum;
    }
    let mut curr_size = LANES >> 1;
    while curr_size > 0 {
        for lane in 0..curr_size {
            shared[lane] += shared[lane + curr_size];
        }
        curr_size >>= 1;
    }
    shared[0]
}

fn write_shared_state(src: &mut String, x: &IndicesHelper, output: &IndicesHelper) {
    let t = x.value_type().as_str();
    let _ = writeln!(src);
    let _ = writeln!(src, "var<workgroup> row_max_shared: {t};");
    let _ = writeln!(src, "var<workgroup> row_sum_shared: {t};");
    let _ = writeln!(
        src,
        "var<workgroup> thread_shared: array<{t}, {SOFTMAX_WORKGROUP_SIZE}>;"
    );
    let _ = writeln!(src);
    let _ = writeln!(
        src,
        "fn get_value(row: u32, col: u32, row_stride: u32) -> {t} {{"
    );
    let _ = writeln!(src, "  return {};", x.get_by_offset("row * row_stride + col"));
    let _ = writeln!(src, "}}");
    let _ = writeln!(src);
    let _ = writeln!(
        src,
        "fn set_value(row: u32, col: u32, row_stride: u32, value: {t}) {{"
    );
    let _ = writeln!(
        src,
        "  {}",
        output.set_by_offset("row * row_stride + col", "value")
    );
    let _ = writeln!(src, "}}");
    let _ = writeln!(src);
}

fn write_softmax_body(src: &mut String, x: &IndicesHelper, rows: u32, cols: u32) {
    let ty = x.value_type();
    let wg = SOFTMAX_WORKGROUP_SIZE;
    let body = format!(
        r#"  let row = workgroup_index;
  if (row >= {rows}u) {{ return; }}
  let cols = {cols}u;
  let row_stride = {cols}u;

  var thread_max = {lowest};
  for (var col = local_idx; col < cols; col += {wg}u) {{
    thread_max = max(thread_max, get_value(row, col, row_stride));
  }}
  if (local_idx < cols) {{
    thread_shared[local_idx] = thread_max;
  }}
  workgroupBarrier();

  var reduce_size = min(cols, {wg}u);
  for (var curr_size = reduce_size >> 1u; curr_size > 0u; curr_size = reduce_size >> 1u) {{
    reduce_size = curr_size + (reduce_size & 1u);
    if (local_idx < curr_size) {{
      thread_shared[local_idx] = max(thread_shared[local_idx], thread_shared[local_idx + reduce_size]);
    }}
    workgroupBarrier();
  }}
  if (local_idx == 0u) {{
    row_max_shared = thread_shared[0];
  }}
  workgroupBarrier();

  var thread_sum = {zero};
  for (var col = local_idx; col < cols; col += {wg}u) {{
    thread_sum += exp(get_value(row, col, row_stride) - row_max_shared);
  }}
  thread_shared[local_idx] = thread_sum;
  workgroupBarrier();

  for (var curr_size = {half}u; curr_size > 0u; curr_size = curr_size >> 1u) {{
    if (local_idx < curr_size) {{
      thread_shared[local_idx] = thread_shared[local_idx] + thread_shared[local_idx + curr_size];
    }}
    workgroupBarrier();
  }}
  if (local_idx == 0u) {{
    row_sum_shared = thread_shared[0];
  }}
  workgroupBarrier();

  for (var col = local_idx; col < cols; col += {wg}u) {{
    let value = exp(get_value(row, col, row_stride) - row_max_shared) / row_sum_shared;
    set_value(row, col, row_stride, value);
  }}
"#,
        lowest = ty.lowest(),
        zero = ty.zero(),
        half = wg >> 1,
    );
    src.push_str(&body);
}

pub fn create_softmax_program_info_loader(
    inputs: &[TensorView],
    attributes: &SoftmaxAttributes,
) -> ProgramInfoLoader {
    let kernel = SoftmaxKernel::new(attributes.clone());
    let metadata = kernel.metadata();
    ProgramInfoLoader::new(metadata, Kernel::Softmax(kernel), inputs)
}

/// Softmax entry point. Rejects bad operands before anything is dispatched.
pub fn softmax<C: ComputeContext + ?Sized>(
    context: &mut C,
    attributes: &SoftmaxAttributes,
) -> Result<()> {
    validate_inputs(context.inputs())?;
    last_axis(attributes, context.inputs()[0].rank())?;
    let loader = create_softmax_program_info_loader(context.inputs(), attributes);
    context.compute(loader)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opforge_api::TensorHandle;

    fn view(dims: &[usize], data_type: DataType) -> TensorView {
        TensorView::new(dims.to_vec(), data_type, TensorHandle(1))
    }

    #[test]
    fn rejects_wrong_input_count_and_type() {
        assert!(validate_inputs(&[]).unwrap_err().is_invalid_argument());
        let two = [view(&[2], DataType::Float32), view(&[2], DataType::Float32)];
        assert!(validate_inputs(&two).is_err());
        assert!(validate_inputs(&[view(&[2], DataType::Int32)]).is_err());
        assert!(validate_inputs(&[view(&[2], DataType::Float16)]).is_ok());
    }

    #[test]
    fn only_last_axis_is_supported() {
        assert_eq!(last_axis(&SoftmaxAttributes::new(-1), 3).unwrap(), 2);
        assert_eq!(last_axis(&SoftmaxAttributes::new(2), 3).unwrap(), 2);
        assert!(last_axis(&SoftmaxAttributes::new(1), 3).is_err());
        assert!(last_axis(&SoftmaxAttributes::new(3), 3).is_err());
    }

    #[test]
    fn overflowing_element_count_is_out_of_range() {
        let loader = create_softmax_program_info_loader(
            &[view(&[usize::MAX / 2, 3, 4], DataType::Float32)],
            &SoftmaxAttributes::default(),
        );
        assert!(matches!(
            loader.get(),
            Err(KernelError::ConstantOutOfRange { name: "tensor size", .. })
        ));
    }

    #[test]
    fn one_workgroup_per_row() {
        let loader = create_softmax_program_info_loader(
            &[view(&[4, 5, 130], DataType::Float32)],
            &SoftmaxAttributes::default(),
        );
        let info = loader.get().unwrap();
        assert_eq!((info.dispatch_group)(), DispatchGroup::linear(20));
        assert_eq!(info.outputs[0].dims, vec![4, 5, 130]);
        assert_eq!(info.workgroup_size, WorkgroupSize::linear(64));
        let src = (info.shader_source)(&ShaderHelper::new((info.dispatch_group)()));
        assert!(src.contains("var<workgroup> thread_shared: array<f32, 64>;"));
        assert!(src.contains("if (row >= 20u) { return; }"));
        assert!(src.contains("let cols = 130u;"));
        assert!(src.contains("reduce_size = curr_size + (reduce_size & 1u);"));
        assert!(src.contains("var thread_max = -3.402823e+38f;"));
    }

    #[test]
    fn every_shared_write_is_followed_by_a_barrier() {
        let loader = create_softmax_program_info_loader(
            &[view(&[3, 7], DataType::Float16)],
            &SoftmaxAttributes::default(),
        );
        let info = loader.get().unwrap();
        let src = (info.shader_source)(&ShaderHelper::new((info.dispatch_group)()));
        assert!(src.starts_with("enable f16;"));
        let lines: Vec<&str> = src.lines().map(str::trim).collect();
        for (i, line) in lines.iter().enumerate() {
            let writes_shared = line.starts_with("thread_shared[")
                || line.starts_with("row_max_shared =")
                || line.starts_with("row_sum_shared =");
            if writes_shared {
                let barrier = lines[i..]
                    .iter()
                    .position(|l| *l == "workgroupBarrier();")
                    .expect("barrier after shared write");
                let next_shared_read = lines[i + 1..]
                    .iter()
                    .position(|l| l.contains("_shared"))
                    .map(|p| p + 1)
                    .unwrap_or(usize::MAX);
                assert!(barrier <= next_shared_read, "line {i}: {line}");
            }
        }
    }

    #[test]
    fn host_lane_reduction_handles_odd_widths() {
        for cols in [1usize, 3, 63, 64, 65, 127, 200] {
            let values: Vec<f32> = (0..cols).map(|i| ((i * 37) % 11) as f32 - 5.0).collect();
            let want = values.iter().copied().fold(f32::MIN, f32::max);
            assert_eq!(reduce_row_max(&values), want, "cols={cols}");
        }
    }

    #[test]
    fn zero_width_rows_dispatch_nothing() {
        let loader = create_softmax_program_info_loader(
            &[view(&[4, 0], DataType::Float32)],
            &SoftmaxAttributes::default(),
        );
        let info = loader.get().unwrap();
        assert_eq!((info.dispatch_group)(), DispatchGroup::linear(0));
    }
}
