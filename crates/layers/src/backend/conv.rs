//! Strided 2-D correlation and its two adjoints.
//!
//! Filters are laid out `(num_filters, k, nr, nc)`. Transposed convolution
//! reuses the same kernels with the roles of forward and backward-data
//! swapped. Forward and backward-data run through candle's `conv2d` and
//! `conv_transpose2d`; the filter gradient stays a host loop.

use candle_core::Device;

use crate::{LayerError, Result, Tensor, TensorShape};

/// Stride and zero padding applied on both sides of each spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub stride_y: usize,
    pub stride_x: usize,
    pub pad_y: usize,
    pub pad_x: usize,
}

#[inline]
fn source_coord(out: usize, stride: usize, tap: usize, pad: usize, limit: usize) -> Option<usize> {
    let pos = (out * stride + tap).checked_sub(pad)?;
    (pos < limit).then_some(pos)
}

fn check_filters(filters: &[f32], shape: TensorShape) -> Result<()> {
    if filters.len() != shape.size() {
        return Err(LayerError::shape(
            "conv",
            format!("filter buffer of {} values does not match {}", filters.len(), shape),
        ));
    }
    Ok(())
}

fn filter_kernel(filters: &[f32], shape: TensorShape, device: &Device) -> Result<candle_core::Tensor> {
    let dims = shape.dims();
    Ok(candle_core::Tensor::from_slice(filters, &dims[..], device)?)
}

/// Keeps every `sy`-th row and `sx`-th column of a rank-4 tensor.
fn subsample(t: &candle_core::Tensor, sy: usize, sx: usize, device: &Device) -> Result<candle_core::Tensor> {
    let (_, _, h, w) = t.dims4()?;
    let rows: Vec<u32> = (0..h).step_by(sy).map(|r| r as u32).collect();
    let cols: Vec<u32> = (0..w).step_by(sx).map(|c| c as u32).collect();
    let rows = candle_core::Tensor::new(rows.as_slice(), device)?;
    let cols = candle_core::Tensor::new(cols.as_slice(), device)?;
    Ok(t.index_select(&rows, 2)?.index_select(&cols, 3)?)
}

/// Inserts `sy − 1` zero rows and `sx − 1` zero columns between neighbours.
fn dilate(t: &candle_core::Tensor, sy: usize, sx: usize) -> Result<candle_core::Tensor> {
    let (n, k, h, w) = t.dims4()?;
    if sy == 1 && sx == 1 {
        return Ok(t.clone());
    }
    let spread = t
        .reshape((n, k, h, 1, w, 1))?
        .pad_with_zeros(3, 0, sy - 1)?
        .pad_with_zeros(5, 0, sx - 1)?
        .reshape((n, k, h * sy, w * sx))?;
    Ok(spread
        .narrow(2, 0, (h - 1) * sy + 1)?
        .narrow(3, 0, (w - 1) * sx + 1)?
        .contiguous()?)
}

/// `len` entries of axis `dim` starting at `start`, zero-extended past the end.
fn window(t: candle_core::Tensor, dim: usize, start: usize, len: usize) -> Result<candle_core::Tensor> {
    let have = t.dim(dim)?;
    let t = if start + len > have {
        t.pad_with_zeros(dim, 0, start + len - have)?
    } else {
        t
    };
    Ok(t.narrow(dim, start, len)?)
}

fn expect_dims(result: &Tensor, expected: TensorShape) -> Result<()> {
    if result.shape() != expected {
        return Err(LayerError::shape(
            "conv",
            format!("kernel produced {} where {} was expected", result.shape(), expected),
        ));
    }
    Ok(())
}

/// `output[n,o,y,x] (+)= Σ filters[o,i,ky,kx] · input[n,i,y·sy+ky−py, x·sx+kx−px]`.
///
/// `output` must already be sized. With `accumulate == false` it is
/// overwritten.
pub fn conv_forward(
    output: &mut Tensor,
    accumulate: bool,
    input: &Tensor,
    filters: &[f32],
    filter_shape: TensorShape,
    geom: ConvGeometry,
) -> Result<()> {
    check_filters(filters, filter_shape)?;
    let in_shape = input.shape();
    let out_shape = output.shape();
    if in_shape.k != filter_shape.k
        || out_shape.k != filter_shape.num_samples
        || out_shape.num_samples != in_shape.num_samples
    {
        return Err(LayerError::shape(
            "conv",
            format!(
                "input {} and filters {} cannot produce output {}",
                in_shape, filter_shape, out_shape
            ),
        ));
    }
    if out_shape.size() == 0 {
        return Ok(());
    }

    let device = Device::Cpu;
    let kernel = filter_kernel(filters, filter_shape, &device)?;
    let x = input
        .to_candle(&device)?
        .pad_with_zeros(2, geom.pad_y, geom.pad_y)?
        .pad_with_zeros(3, geom.pad_x, geom.pad_x)?;
    let y = if geom.stride_y == geom.stride_x {
        x.conv2d(&kernel, 0, geom.stride_y, 1, 1)?
    } else {
        subsample(&x.conv2d(&kernel, 0, 1, 1, 1)?, geom.stride_y, geom.stride_x, &device)?
    };
    let result = Tensor::from_candle(&y)?;
    expect_dims(&result, out_shape)?;

    if accumulate {
        output.add_assign(&result)
    } else {
        output.host_mut().copy_from_slice(result.host());
        Ok(())
    }
}

/// Adds the data gradient of [`conv_forward`] into `grad_in`.
pub fn conv_backward_data(
    grad_in: &mut Tensor,
    grad_out: &Tensor,
    filters: &[f32],
    filter_shape: TensorShape,
    geom: ConvGeometry,
) -> Result<()> {
    check_filters(filters, filter_shape)?;
    let in_shape = grad_in.shape();
    let out_shape = grad_out.shape();
    if in_shape.k != filter_shape.k
        || out_shape.k != filter_shape.num_samples
        || out_shape.num_samples != in_shape.num_samples
    {
        return Err(LayerError::shape(
            "conv",
            format!(
                "gradient {} and filters {} do not map onto input {}",
                out_shape, filter_shape, in_shape
            ),
        ));
    }
    if out_shape.size() == 0 || in_shape.size() == 0 {
        return Ok(());
    }

    // Transposing over the padded extent, then cropping the padding away.
    // Rows the forward stride never reached come back as zeros.
    let device = Device::Cpu;
    let kernel = filter_kernel(filters, filter_shape, &device)?;
    let g = grad_out.to_candle(&device)?;
    let full = if geom.stride_y == geom.stride_x {
        g.conv_transpose2d(&kernel, 0, 0, geom.stride_y, 1)?
    } else {
        dilate(&g, geom.stride_y, geom.stride_x)?.conv_transpose2d(&kernel, 0, 0, 1, 1)?
    };
    let cropped = window(window(full, 2, geom.pad_y, in_shape.nr)?, 3, geom.pad_x, in_shape.nc)?
        .contiguous()?;
    let result = Tensor::from_candle(&cropped)?;
    expect_dims(&result, in_shape)?;
    grad_in.add_assign(&result)
}

/// Overwrites `filters_grad` with the filter gradient of [`conv_forward`].
pub fn conv_backward_filters(
    filters_grad: &mut [f32],
    filter_shape: TensorShape,
    grad_out: &Tensor,
    input: &Tensor,
    geom: ConvGeometry,
) -> Result<()> {
    check_filters(filters_grad, filter_shape)?;
    let in_shape = input.shape();
    let out_shape = grad_out.shape();
    if in_shape.k != filter_shape.k || out_shape.k != filter_shape.num_samples {
        return Err(LayerError::shape(
            "conv",
            format!(
                "gradient {} and input {} do not match filters {}",
                out_shape, in_shape, filter_shape
            ),
        ));
    }

    filters_grad.iter_mut().for_each(|v| *v = 0.0);
    let (fr, fc) = (filter_shape.nr, filter_shape.nc);
    let g = grad_out.host();
    let src = input.host();
    for n in 0..out_shape.num_samples {
        for o in 0..out_shape.k {
            for y in 0..out_shape.nr {
                for x in 0..out_shape.nc {
                    let gv = g[((n * out_shape.k + o) * out_shape.nr + y) * out_shape.nc + x];
                    if gv == 0.0 {
                        continue;
                    }
                    for i in 0..in_shape.k {
                        let f_base = (o * filter_shape.k + i) * fr * fc;
                        let in_base = (n * in_shape.k + i) * in_shape.nr * in_shape.nc;
                        for ky in 0..fr {
                            let Some(iy) = source_coord(y, geom.stride_y, ky, geom.pad_y, in_shape.nr)
                            else {
                                continue;
                            };
                            for kx in 0..fc {
                                let Some(ix) =
                                    source_coord(x, geom.stride_x, kx, geom.pad_x, in_shape.nc)
                                else {
                                    continue;
                                };
                                filters_grad[f_base + ky * fc + kx] +=
                                    gv * src[in_base + iy * in_shape.nc + ix];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn ramp(shape: TensorShape, scale: f32) -> Result<Tensor> {
        Tensor::from_vec(
            shape,
            (0..shape.size())
                .map(|i| ((i % 7) as f32 - 3.0) * scale)
                .collect(),
        )
    }

    #[test]
    fn forward_matches_candle_conv2d() -> Result<()> {
        let input = ramp(TensorShape::new(2, 3, 6, 5), 0.25)?;
        let filter_shape = TensorShape::new(4, 3, 3, 3);
        let filters = ramp(filter_shape, 0.1)?;
        let geom = ConvGeometry {
            stride_y: 2,
            stride_x: 2,
            pad_y: 1,
            pad_x: 1,
        };
        let mut output = Tensor::zeros(TensorShape::new(2, 4, 3, 3));
        conv_forward(&mut output, false, &input, filters.host(), filter_shape, geom)?;

        let device = Device::Cpu;
        let reference = input
            .to_candle(&device)?
            .conv2d(&filters.to_candle(&device)?, 1, 2, 1, 1)?;
        let reference = Tensor::from_candle(&reference)?;
        assert!(output.max_abs_diff(&reference) < 1e-4);
        Ok(())
    }

    #[test]
    fn unequal_strides_match_the_direct_sum() -> Result<()> {
        let input = ramp(TensorShape::new(1, 2, 5, 6), 0.4)?;
        let filter_shape = TensorShape::new(2, 2, 2, 3);
        let filters = ramp(filter_shape, 0.3)?;
        let geom = ConvGeometry {
            stride_y: 2,
            stride_x: 1,
            pad_y: 0,
            pad_x: 1,
        };
        let out_shape = TensorShape::new(1, 2, 2, 6);
        let mut output = Tensor::zeros(out_shape);
        conv_forward(&mut output, false, &input, filters.host(), filter_shape, geom)?;

        for o in 0..2 {
            for y in 0..out_shape.nr {
                for x in 0..out_shape.nc {
                    let mut acc = 0.0f32;
                    for i in 0..2 {
                        for ky in 0..2 {
                            for kx in 0..3 {
                                let (Some(iy), Some(ix)) = (
                                    source_coord(y, 2, ky, 0, 5),
                                    source_coord(x, 1, kx, 1, 6),
                                ) else {
                                    continue;
                                };
                                acc += filters.at(o, i, ky, kx) * input.at(0, i, iy, ix);
                            }
                        }
                    }
                    assert!((output.at(0, o, y, x) - acc).abs() < 1e-4, "({o},{y},{x})");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn backward_data_accumulates_into_the_slot() -> Result<()> {
        let in_shape = TensorShape::new(1, 1, 5, 5);
        let filter_shape = TensorShape::new(1, 1, 3, 3);
        let geom = ConvGeometry {
            stride_y: 2,
            stride_x: 2,
            pad_y: 0,
            pad_x: 0,
        };
        let w = Tensor::filled(filter_shape, 1.0);
        let g = Tensor::filled(TensorShape::new(1, 1, 2, 2), 1.0);
        let mut gx = Tensor::filled(in_shape, 10.0);
        conv_backward_data(&mut gx, &g, w.host(), filter_shape, geom)?;
        // Corners see one window, the centre sees all four.
        assert_eq!(gx.at(0, 0, 0, 0), 11.0);
        assert_eq!(gx.at(0, 0, 2, 2), 14.0);
        assert_eq!(gx.at(0, 0, 4, 4), 11.0);
        Ok(())
    }

    #[test]
    fn backward_data_is_the_adjoint_of_forward() -> Result<()> {
        // <conv(x), g> == <x, conv_backward_data(g)> for any x, g.
        let in_shape = TensorShape::new(1, 2, 5, 4);
        let filter_shape = TensorShape::new(3, 2, 3, 2);
        let geom = ConvGeometry {
            stride_y: 1,
            stride_x: 2,
            pad_y: 1,
            pad_x: 0,
        };
        let x = ramp(in_shape, 0.3)?;
        let w = ramp(filter_shape, 0.2)?;
        let mut y = Tensor::zeros(TensorShape::new(1, 3, 5, 2));
        conv_forward(&mut y, false, &x, w.host(), filter_shape, geom)?;
        let g = ramp(y.shape(), 0.5)?;
        let mut gx = Tensor::zeros(in_shape);
        conv_backward_data(&mut gx, &g, w.host(), filter_shape, geom)?;
        let lhs = y.dot(&g);
        let rhs = x.dot(&gx);
        assert!((lhs - rhs).abs() < 1e-3, "{lhs} vs {rhs}");
        Ok(())
    }
}
