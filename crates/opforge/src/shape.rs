//! Row-major shape and index arithmetic shared by the generators, the WGSL index
//! helpers and the host executor.

use opforge_api::TensorLayout;

/// Element count of `dims`, `None` on overflow. The empty shape holds one element.
pub fn checked_size(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Row-major strides: the last dimension is contiguous.
pub fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; dims.len()];
    let mut stride = 1usize;
    for (slot, &dim) in strides.iter_mut().zip(dims.iter()).rev() {
        *slot = stride;
        stride = stride.saturating_mul(dim);
    }
    strides
}

/// Coordinates of the element at `offset`. `offset` must be below the element count of `dims`.
pub fn offset_to_indices(offset: usize, dims: &[usize]) -> Vec<usize> {
    let mut indices = vec![0usize; dims.len()];
    let mut current = offset;
    for (slot, &dim) in indices.iter_mut().zip(dims.iter()).rev() {
        if dim == 0 {
            continue;
        }
        *slot = current % dim;
        current /= dim;
    }
    indices
}

/// Flat offset of `indices`; inverse of [`offset_to_indices`].
pub fn indices_to_offset(indices: &[usize], dims: &[usize]) -> usize {
    debug_assert_eq!(indices.len(), dims.len());
    indices
        .iter()
        .zip(dims.iter())
        .fold(0usize, |acc, (&idx, &dim)| acc * dim + idx)
}

/// Resolve a possibly negative axis against `rank`. `None` when out of `[-rank, rank)`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank_i = i64::try_from(rank).ok()?;
    let resolved = if axis < 0 { axis + rank_i } else { axis };
    if (0..rank_i).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

/// Spatial extent of a kernel of size `kernel` once dilated.
pub fn dilated_extent(kernel: usize, dilation: usize) -> usize {
    if kernel == 0 {
        0
    } else {
        (kernel - 1).saturating_mul(dilation).saturating_add(1)
    }
}

/// `floor((input + pad_begin + pad_end - dilation*(kernel-1) - 1) / stride) + 1`.
/// `None` when the dilated kernel does not fit the padded input or `stride` is 0.
pub fn conv_output_dim(
    input: usize,
    kernel: usize,
    pad_begin: usize,
    pad_end: usize,
    stride: usize,
    dilation: usize,
) -> Option<usize> {
    if stride == 0 {
        return None;
    }
    let padded = input.checked_add(pad_begin)?.checked_add(pad_end)?;
    let span = dilated_extent(kernel, dilation);
    let room = padded.checked_sub(span)?;
    Some(room / stride + 1)
}

/// Output shape of an N-d convolution. `w_dims` is `[out_channels, in_channels/group,
/// k_0, .., k_n]`, `pads` is `[begin_0, .., begin_n, end_0, .., end_n]`.
pub fn conv_output_shape(
    x_dims: &[usize],
    w_dims: &[usize],
    dilations: &[usize],
    pads: &[usize],
    strides: &[usize],
    layout: TensorLayout,
) -> Option<Vec<usize>> {
    let rank = x_dims.len();
    let spatial = layout.spatial_axes(rank);
    let spatial_rank = spatial.len();
    if w_dims.len() != rank
        || dilations.len() < spatial_rank
        || strides.len() < spatial_rank
        || pads.len() < 2 * spatial_rank
    {
        return None;
    }
    let mut out = Vec::with_capacity(rank);
    out.push(*x_dims.first()?);
    let mut spatial_out = Vec::with_capacity(spatial_rank);
    for (i, axis) in spatial.enumerate() {
        spatial_out.push(conv_output_dim(
            x_dims[axis],
            w_dims[2 + i],
            pads[i],
            pads[i + spatial_rank],
            strides[i],
            dilations[i],
        )?);
    }
    let out_channels = w_dims[0];
    if layout.is_channel_last() {
        out.extend(spatial_out);
        out.push(out_channels);
    } else {
        out.push(out_channels);
        out.extend(spatial_out);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_row_major() {
        assert_eq!(compute_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(compute_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn offset_and_indices_are_inverse() {
        let dims = [2, 3, 4, 5];
        for offset in 0..dims.iter().product::<usize>() {
            let idx = offset_to_indices(offset, &dims);
            assert_eq!(indices_to_offset(&idx, &dims), offset);
        }
        assert_eq!(offset_to_indices(23, &[2, 3, 4]), vec![1, 2, 3]);
    }

    #[test]
    fn normalize_axis_bounds() {
        assert_eq!(normalize_axis(-1, 3), Some(2));
        assert_eq!(normalize_axis(2, 3), Some(2));
        assert_eq!(normalize_axis(3, 3), None);
        assert_eq!(normalize_axis(-4, 3), None);
        assert_eq!(normalize_axis(-1, 0), None);
    }

    #[test]
    fn conv_output_dim_matches_closed_form() {
        for input in 1..9usize {
            for kernel in 1..4usize {
                for pad in 0..3usize {
                    for stride in 1..4usize {
                        for dilation in 1..3usize {
                            let padded = (input + 2 * pad) as i64;
                            let numer = padded - (dilation * (kernel - 1)) as i64 - 1;
                            let got = conv_output_dim(input, kernel, pad, pad, stride, dilation);
                            if numer < 0 {
                                assert_eq!(got, None);
                            } else {
                                let want = (numer / stride as i64 + 1) as usize;
                                assert_eq!(got, Some(want));
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn conv_output_shape_per_layout() {
        let nchw = conv_output_shape(
            &[1, 1, 4, 4],
            &[1, 1, 2, 2],
            &[1, 1],
            &[0, 0, 0, 0],
            &[1, 1],
            TensorLayout::ChannelFirst,
        );
        assert_eq!(nchw, Some(vec![1, 1, 3, 3]));

        let nhwc = conv_output_shape(
            &[2, 5, 7, 3],
            &[8, 3, 3, 3],
            &[1, 1],
            &[1, 1, 1, 1],
            &[2, 2],
            TensorLayout::ChannelLast,
        );
        assert_eq!(nhwc, Some(vec![2, 3, 4, 8]));
    }
}
