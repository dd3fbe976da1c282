//! Convolution entry point: operand validation, attribute resolution and the 1-D
//! lift onto the grouped 2-D kernel.

use super::conv_grouped::{create_grouped_conv_program_info_loader, OutputSqueeze};
use crate::context::ComputeContext;
use crate::error::{KernelError, Result};
use opforge_api::{AutoPad, ConvAttributes, TensorView};

/// Check operand count, ranks, channel/group agreement, bias shape and attribute
/// lengths against the spatial rank.
pub fn validate_inputs(inputs: &[TensorView], attributes: &ConvAttributes) -> Result<()> {
    if inputs.len() != 2 && inputs.len() != 3 {
        return Err(KernelError::invalid(format!(
            "Conv requires 2 or 3 inputs, got {}",
            inputs.len()
        )));
    }
    let (x, w) = (&inputs[0], &inputs[1]);
    if x.rank() != 3 && x.rank() != 4 {
        return Err(KernelError::invalid(format!(
            "Conv supports 1-D and 2-D inputs only, got rank {}",
            x.rank()
        )));
    }
    if x.rank() != w.rank() {
        return Err(KernelError::invalid(format!(
            "Conv input rank {} does not match weight rank {}",
            x.rank(),
            w.rank()
        )));
    }
    if !x.data_type.is_float() || w.data_type != x.data_type {
        return Err(KernelError::invalid(format!(
            "Conv requires matching float inputs, got {} and {}",
            x.data_type, w.data_type
        )));
    }
    let group = attributes.group();
    let data_channels = x.dims[attributes.format().channel_axis(x.rank())];
    let filter_channels = w.dims[1].checked_mul(group);
    if filter_channels != Some(data_channels) {
        return Err(KernelError::invalid(format!(
            "Conv input has {data_channels} channels but weights expect {} x group {group}",
            w.dims[1]
        )));
    }
    if w.dims[0] % group != 0 {
        return Err(KernelError::invalid(format!(
            "Conv group {group} does not divide {} output channels",
            w.dims[0]
        )));
    }
    if let Some(bias) = inputs.get(2) {
        if bias.rank() != 1 || bias.dims[0] != w.dims[0] {
            return Err(KernelError::invalid(format!(
                "Conv bias must be [{}], got {:?}",
                w.dims[0], bias.dims
            )));
        }
        if bias.data_type != x.data_type {
            return Err(KernelError::invalid("Conv bias type does not match input"));
        }
    }

    let spatial_rank = x.rank() - 2;
    let check_len = |name: &str, len: usize, want: usize| {
        if len == 0 || len == want {
            Ok(())
        } else {
            Err(KernelError::invalid(format!(
                "Conv {name} must have {want} entries, got {len}"
            )))
        }
    };
    check_len("dilations", attributes.dilations().len(), spatial_rank)?;
    check_len("strides", attributes.strides().len(), spatial_rank)?;
    check_len("pads", attributes.pads().len(), spatial_rank * 2)?;
    check_len("kernel_shape", attributes.kernel_shape().len(), spatial_rank)?;
    if attributes.dilations().contains(&0) || attributes.strides().contains(&0) {
        return Err(KernelError::invalid("Conv strides and dilations must be positive"));
    }
    if !attributes.kernel_shape().is_empty() && attributes.kernel_shape() != &w.dims[2..] {
        return Err(KernelError::invalid(format!(
            "Conv kernel_shape {:?} does not match weights {:?}",
            attributes.kernel_shape(),
            w.dims
        )));
    }
    Ok(())
}

fn or_fill(values: &[usize], len: usize, fill: usize) -> Vec<usize> {
    if values.is_empty() {
        vec![fill; len]
    } else {
        values.to_vec()
    }
}

/// Fill defaults, take the kernel shape from the weights and spell out `auto_pad` as
/// explicit pads.
pub fn adjust_attributes(
    x: &TensorView,
    w: &TensorView,
    attributes: &ConvAttributes,
) -> Result<ConvAttributes> {
    let spatial_axes = attributes.format().spatial_axes(x.rank());
    let spatial_rank = spatial_axes.len();
    let kernel_shape = w.dims[2..].to_vec();
    let strides = or_fill(attributes.strides(), spatial_rank, 1);
    let dilations = or_fill(attributes.dilations(), spatial_rank, 1);
    let mut pads = or_fill(attributes.pads(), spatial_rank * 2, 0);

    for (i, axis) in spatial_axes.enumerate() {
        let (head, tail) = auto_pads(
            attributes.auto_pad(),
            x.dims[axis],
            kernel_shape[i],
            strides[i],
            dilations[i],
        )?
        .unwrap_or((pads[i], pads[i + spatial_rank]));
        pads[i] = head;
        pads[i + spatial_rank] = tail;
    }
    Ok(attributes.resolved(kernel_shape, pads, strides, dilations))
}

/// Explicit `(head, tail)` pads for an `auto_pad` mode; `None` keeps the given pads.
fn auto_pads(
    auto_pad: AutoPad,
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
) -> Result<Option<(usize, usize)>> {
    match auto_pad {
        AutoPad::NotSet => Ok(None),
        AutoPad::Valid => Ok(Some((0, 0))),
        AutoPad::SameUpper | AutoPad::SameLower => {
            if dilation != 1 {
                return Err(KernelError::invalid(
                    "dilation is not supported for SAME_UPPER or SAME_LOWER",
                ));
            }
            let target = input.div_ceil(stride);
            let needed = (target.saturating_sub(1) * stride + kernel).saturating_sub(input);
            let head = if auto_pad == AutoPad::SameLower {
                (needed + 1) / 2
            } else {
                needed / 2
            };
            Ok(Some((head, needed - head)))
        }
    }
}

/// Lift a rank-3 convolution onto the 2-D kernel by inserting a unit height.
fn conv1d<C: ComputeContext + ?Sized>(
    context: &mut C,
    attributes: &ConvAttributes,
) -> Result<()> {
    let inputs = context.inputs();
    let channel_last = attributes.format().is_channel_last();
    let (x, w) = (&inputs[0], &inputs[1]);
    let x_dims = if channel_last {
        vec![x.dims[0], 1, x.dims[1], x.dims[2]]
    } else {
        vec![x.dims[0], x.dims[1], 1, x.dims[2]]
    };
    let mut lifted = vec![
        x.reshaped(x_dims),
        w.reshaped(vec![w.dims[0], w.dims[1], 1, w.dims[2]]),
    ];
    lifted.extend(inputs.get(2).cloned());

    let adjusted = adjust_attributes(x, w, attributes)?;
    let prefix_one = |values: &[usize]| {
        let mut out = vec![1];
        out.extend_from_slice(values);
        out
    };
    let pads = adjusted.pads();
    let lifted_attributes = adjusted.resolved(
        prefix_one(adjusted.kernel_shape()),
        vec![0, pads[0], 0, pads[1]],
        prefix_one(adjusted.strides()),
        prefix_one(adjusted.dilations()),
    );
    let loader =
        create_grouped_conv_program_info_loader(&lifted, &lifted_attributes, OutputSqueeze::Conv1d);
    context.compute(loader)?;
    Ok(())
}

/// Convolution entry point over `context.inputs()`: `x`, `w` and an optional bias.
pub fn conv<C: ComputeContext + ?Sized>(
    context: &mut C,
    attributes: &ConvAttributes,
) -> Result<()> {
    validate_inputs(context.inputs(), attributes)?;
    if context.inputs()[0].rank() == 3 {
        return conv1d(context, attributes);
    }
    let adjusted = adjust_attributes(&context.inputs()[0], &context.inputs()[1], attributes)?;
    let loader =
        create_grouped_conv_program_info_loader(context.inputs(), &adjusted, OutputSqueeze::None);
    context.compute(loader)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opforge_api::{DataType, TensorHandle, TensorLayout};

    fn view(dims: &[usize]) -> TensorView {
        TensorView::new(dims.to_vec(), DataType::Float32, TensorHandle(0))
    }

    #[test]
    fn validation_catches_shape_mismatches() {
        let attrs = ConvAttributes::basic(1);
        assert!(validate_inputs(&[view(&[1, 1, 4, 4])], &attrs).is_err());
        assert!(validate_inputs(&[view(&[1, 1, 4, 4]), view(&[1, 1, 2])], &attrs).is_err());
        assert!(validate_inputs(&[view(&[1, 3, 4, 4]), view(&[2, 2, 2, 2])], &attrs).is_err());
        assert!(validate_inputs(&[view(&[1, 4, 4, 4]), view(&[3, 2, 2, 2])], &ConvAttributes::basic(2)).is_err());
        let with_bias = [view(&[1, 2, 4, 4]), view(&[4, 2, 2, 2]), view(&[3])];
        assert!(validate_inputs(&with_bias, &attrs).is_err());
        let ok = [view(&[1, 4, 4, 4]), view(&[4, 2, 2, 2]), view(&[4])];
        assert!(validate_inputs(&ok, &ConvAttributes::basic(2)).is_ok());
    }

    #[test]
    fn validation_rejects_integer_inputs() {
        let x = TensorView::new(vec![1, 1, 4, 4], DataType::Int32, TensorHandle(0));
        let w = TensorView::new(vec![1, 1, 2, 2], DataType::Int32, TensorHandle(1));
        let err = validate_inputs(&[x, w], &ConvAttributes::basic(1)).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn same_upper_and_lower_split_odd_padding() {
        assert_eq!(auto_pads(AutoPad::SameUpper, 5, 2, 1, 1).unwrap(), Some((0, 1)));
        assert_eq!(auto_pads(AutoPad::SameLower, 5, 2, 1, 1).unwrap(), Some((1, 0)));
        assert_eq!(auto_pads(AutoPad::SameUpper, 5, 3, 2, 1).unwrap(), Some((1, 1)));
        assert_eq!(auto_pads(AutoPad::Valid, 5, 3, 1, 1).unwrap(), Some((0, 0)));
        assert_eq!(auto_pads(AutoPad::NotSet, 5, 3, 1, 1).unwrap(), None);
        assert!(auto_pads(AutoPad::SameUpper, 5, 3, 1, 2).is_err());
    }

    #[test]
    fn adjusted_attributes_are_fully_resolved() {
        let attrs = ConvAttributes::basic(1)
            .with_auto_pad(AutoPad::SameUpper)
            .with_format(TensorLayout::ChannelLast);
        let adjusted = adjust_attributes(&view(&[1, 5, 5, 3]), &view(&[2, 3, 3, 3]), &attrs).unwrap();
        assert_eq!(adjusted.auto_pad(), AutoPad::NotSet);
        assert_eq!(adjusted.kernel_shape(), &[3, 3]);
        assert_eq!(adjusted.pads(), &[1, 1, 1, 1]);
        assert_eq!(adjusted.format(), TensorLayout::ChannelLast);
    }
}
