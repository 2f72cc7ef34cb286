//! Max and average pooling over strided, padded windows.
//!
//! Padding never contributes: max pooling ignores it, average pooling
//! divides by the number of in-bounds taps. A window with no in-bounds tap
//! yields 0.

use candle_core::Device;

use crate::{LayerError, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Avg,
}

/// Resolved window geometry for one input shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub window_nr: usize,
    pub window_nc: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub pad_y: usize,
    pub pad_x: usize,
}

impl PoolGeometry {
    /// In-bounds `[start, end)` rows and columns of the window at `(y, x)`.
    fn window(&self, y: usize, x: usize, nr: usize, nc: usize) -> (usize, usize, usize, usize) {
        let top = (y * self.stride_y) as isize - self.pad_y as isize;
        let left = (x * self.stride_x) as isize - self.pad_x as isize;
        let r0 = top.max(0) as usize;
        let c0 = left.max(0) as usize;
        let r1 = ((top + self.window_nr as isize).max(0) as usize).min(nr);
        let c1 = ((left + self.window_nc as isize).max(0) as usize).min(nc);
        (r0, r1, c0, c1)
    }
}

fn check(input: &Tensor, output: &Tensor) -> Result<()> {
    if input.num_samples() != output.num_samples() || input.k() != output.k() {
        return Err(LayerError::shape(
            "pool",
            format!("input {} cannot pool into {}", input.shape(), output.shape()),
        ));
    }
    Ok(())
}

/// Writes the pooled values into an already-sized `output`.
///
/// Unpadded windows run through candle's pooling; padded ones fall back to
/// the host loop, which skips out-of-bounds taps.
pub fn pool_forward(kind: PoolKind, output: &mut Tensor, input: &Tensor, geom: PoolGeometry) -> Result<()> {
    check(input, output)?;
    if output.is_empty() {
        return Ok(());
    }
    if geom.pad_y == 0 && geom.pad_x == 0 {
        return pool_forward_candle(kind, output, input, geom);
    }

    let (nr, nc) = (input.nr(), input.nc());
    let (onr, onc) = (output.nr(), output.nc());
    let planes = input.num_samples() * input.k();
    let src = input.host();
    let dst = output.host_mut();
    for p in 0..planes {
        let in_plane = &src[p * nr * nc..(p + 1) * nr * nc];
        for y in 0..onr {
            for x in 0..onc {
                let (r0, r1, c0, c1) = geom.window(y, x, nr, nc);
                let count = r1.saturating_sub(r0) * c1.saturating_sub(c0);
                let value = if count == 0 {
                    0.0
                } else {
                    let taps = (r0..r1).flat_map(|r| in_plane[r * nc + c0..r * nc + c1].iter());
                    match kind {
                        PoolKind::Max => taps.fold(f32::NEG_INFINITY, |best, v| best.max(*v)),
                        PoolKind::Avg => taps.sum::<f32>() / count as f32,
                    }
                };
                dst[(p * onr + y) * onc + x] = value;
            }
        }
    }
    Ok(())
}

fn pool_forward_candle(
    kind: PoolKind,
    output: &mut Tensor,
    input: &Tensor,
    geom: PoolGeometry,
) -> Result<()> {
    let x = input.to_candle(&Device::Cpu)?;
    let window = (geom.window_nr, geom.window_nc);
    let stride = (geom.stride_y, geom.stride_x);
    let pooled = match kind {
        PoolKind::Max => x.max_pool2d_with_stride(window, stride)?,
        PoolKind::Avg => x.avg_pool2d_with_stride(window, stride)?,
    };
    let pooled = Tensor::from_candle(&pooled)?;
    if !pooled.same_dims(output) {
        return Err(LayerError::shape(
            "pool",
            format!("candle pooled {} where {} was expected", pooled.shape(), output.shape()),
        ));
    }
    output.host_mut().copy_from_slice(pooled.host());
    Ok(())
}

/// Adds the pooling gradient into `grad_in`.
///
/// Max pooling routes each output gradient to the first tap holding the
/// window maximum.
pub fn pool_backward(
    kind: PoolKind,
    grad_in: &mut Tensor,
    grad_out: &Tensor,
    input: &Tensor,
    geom: PoolGeometry,
) -> Result<()> {
    check(input, grad_out)?;
    if !grad_in.same_dims(input) {
        return Err(LayerError::shape(
            "pool",
            format!("gradient slot {} does not match input {}", grad_in.shape(), input.shape()),
        ));
    }
    let (nr, nc) = (input.nr(), input.nc());
    let (onr, onc) = (grad_out.nr(), grad_out.nc());
    let planes = input.num_samples() * input.k();
    let src = input.host();
    let g = grad_out.host();
    let dst = grad_in.host_mut();
    for p in 0..planes {
        let base = p * nr * nc;
        for y in 0..onr {
            for x in 0..onc {
                let gv = g[(p * onr + y) * onc + x];
                let (r0, r1, c0, c1) = geom.window(y, x, nr, nc);
                match kind {
                    PoolKind::Max => {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = None;
                        for r in r0..r1 {
                            for c in c0..c1 {
                                let v = src[base + r * nc + c];
                                if best_idx.is_none() || v > best {
                                    best = v;
                                    best_idx = Some(base + r * nc + c);
                                }
                            }
                        }
                        if let Some(idx) = best_idx {
                            dst[idx] += gv;
                        }
                    }
                    PoolKind::Avg => {
                        let count = (r1.saturating_sub(r0)) * (c1.saturating_sub(c0));
                        if count == 0 {
                            continue;
                        }
                        let share = gv / count as f32;
                        for r in r0..r1 {
                            for c in c0..c1 {
                                dst[base + r * nc + c] += share;
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
    use crate::TensorShape;
    use candle_core::Device;

    fn geometry(window: usize, stride: usize) -> PoolGeometry {
        PoolGeometry {
            window_nr: window,
            window_nc: window,
            stride_y: stride,
            stride_x: stride,
            pad_y: 0,
            pad_x: 0,
        }
    }

    fn input() -> Result<Tensor> {
        let shape = TensorShape::new(2, 2, 6, 6);
        Tensor::from_vec(
            shape,
            (0..shape.size()).map(|i| ((i * 37) % 23) as f32 - 11.0).collect(),
        )
    }

    #[test]
    fn unpadded_pooling_matches_candle() -> Result<()> {
        let x = input()?;
        let device = Device::Cpu;
        let cx = x.to_candle(&device)?;
        for (kind, reference) in [
            (PoolKind::Max, cx.max_pool2d_with_stride(2, 2)?),
            (PoolKind::Avg, cx.avg_pool2d_with_stride(2, 2)?),
        ] {
            let mut out = Tensor::zeros(TensorShape::new(2, 2, 3, 3));
            pool_forward(kind, &mut out, &x, geometry(2, 2))?;
            assert!(out.max_abs_diff(&Tensor::from_candle(&reference)?) < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn padded_average_excludes_padding() -> Result<()> {
        let x = Tensor::filled(TensorShape::new(1, 1, 2, 2), 4.0);
        let geom = PoolGeometry {
            pad_y: 1,
            pad_x: 1,
            ..geometry(3, 1)
        };
        let mut out = Tensor::zeros(TensorShape::new(1, 1, 2, 2));
        pool_forward(PoolKind::Avg, &mut out, &x, geom)?;
        assert!(out.host().iter().all(|v| (*v - 4.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn max_over_negative_infinity_stays_negative_infinity() -> Result<()> {
        let x = Tensor::filled(TensorShape::new(1, 1, 4, 4), f32::NEG_INFINITY);
        let mut out = Tensor::zeros(TensorShape::new(1, 1, 2, 2));
        pool_forward(PoolKind::Max, &mut out, &x, geometry(2, 2))?;
        assert!(out.host().iter().all(|v| *v == f32::NEG_INFINITY));

        let padded = PoolGeometry {
            pad_y: 1,
            pad_x: 1,
            ..geometry(3, 1)
        };
        let mut out = Tensor::zeros(TensorShape::new(1, 1, 4, 4));
        pool_forward(PoolKind::Max, &mut out, &x, padded)?;
        assert!(out.host().iter().all(|v| *v == f32::NEG_INFINITY));
        Ok(())
    }

    #[test]
    fn unequal_strides_pool_through_candle() -> Result<()> {
        let x = input()?;
        let geom = PoolGeometry {
            stride_y: 1,
            ..geometry(2, 2)
        };
        let mut out = Tensor::zeros(TensorShape::new(2, 2, 5, 3));
        pool_forward(PoolKind::Max, &mut out, &x, geom)?;
        let expected = [x.at(1, 1, 4, 4), x.at(1, 1, 4, 5), x.at(1, 1, 5, 4), x.at(1, 1, 5, 5)]
            .into_iter()
            .fold(f32::NEG_INFINITY, f32::max);
        assert_eq!(out.at(1, 1, 4, 2), expected);
        Ok(())
    }

    #[test]
    fn max_gradient_lands_on_argmax() -> Result<()> {
        let x = Tensor::from_vec(TensorShape::new(1, 1, 2, 2), vec![1.0, 5.0, 3.0, 2.0])?;
        let g = Tensor::filled(TensorShape::new(1, 1, 1, 1), 2.0);
        let mut gx = Tensor::zeros(x.shape());
        pool_backward(PoolKind::Max, &mut gx, &g, &x, geometry(2, 2))?;
        assert_eq!(gx.host(), &[0.0, 2.0, 0.0, 0.0]);
        Ok(())
    }
}
