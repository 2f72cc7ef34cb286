//! Bilinear resampling with corner-aligned sampling grids.

use crate::{LayerError, Result, Tensor};

struct Tap {
    lo: usize,
    hi: usize,
    frac: f32,
}

fn taps(src: usize, dst: usize) -> Vec<Tap> {
    let scale = src.saturating_sub(1) as f32 / dst.saturating_sub(1).max(1) as f32;
    (0..dst)
        .map(|i| {
            let pos = i as f32 * scale;
            let lo = (pos.floor() as usize).min(src.saturating_sub(1));
            let hi = (lo + 1).min(src.saturating_sub(1));
            Tap {
                lo,
                hi,
                frac: pos - lo as f32,
            }
        })
        .collect()
}

fn check(src: &Tensor, dest: &Tensor) -> Result<()> {
    if src.num_samples() != dest.num_samples() || src.k() != dest.k() {
        return Err(LayerError::shape(
            "resize",
            format!("cannot resample {} into {}", src.shape(), dest.shape()),
        ));
    }
    if src.nr() == 0 || src.nc() == 0 {
        return Err(LayerError::shape("resize", "source plane is empty"));
    }
    Ok(())
}

/// Resamples every plane of `src` to `dest`'s spatial size, overwriting `dest`.
pub fn resize_bilinear(dest: &mut Tensor, src: &Tensor) -> Result<()> {
    check(src, dest)?;
    let (snr, snc) = (src.nr(), src.nc());
    let (dnr, dnc) = (dest.nr(), dest.nc());
    let rows = taps(snr, dnr);
    let cols = taps(snc, dnc);
    let planes = src.num_samples() * src.k();
    let s = src.host();
    let d = dest.host_mut();
    for p in 0..planes {
        let sp = &s[p * snr * snc..(p + 1) * snr * snc];
        for (r, ty) in rows.iter().enumerate() {
            for (c, tx) in cols.iter().enumerate() {
                let tl = sp[ty.lo * snc + tx.lo];
                let tr = sp[ty.lo * snc + tx.hi];
                let bl = sp[ty.hi * snc + tx.lo];
                let br = sp[ty.hi * snc + tx.hi];
                let top = (1.0 - tx.frac) * tl + tx.frac * tr;
                let bottom = (1.0 - tx.frac) * bl + tx.frac * br;
                d[(p * dnr + r) * dnc + c] = (1.0 - ty.frac) * top + ty.frac * bottom;
            }
        }
    }
    Ok(())
}

/// Adds the adjoint of [`resize_bilinear`] applied to `grad` into `grad_src`.
pub fn resize_bilinear_gradient(grad_src: &mut Tensor, grad: &Tensor) -> Result<()> {
    check(grad_src, grad)?;
    let (snr, snc) = (grad_src.nr(), grad_src.nc());
    let (dnr, dnc) = (grad.nr(), grad.nc());
    let rows = taps(snr, dnr);
    let cols = taps(snc, dnc);
    let planes = grad.num_samples() * grad.k();
    let g = grad.host();
    let d = grad_src.host_mut();
    for p in 0..planes {
        let base = p * snr * snc;
        for (r, ty) in rows.iter().enumerate() {
            for (c, tx) in cols.iter().enumerate() {
                let gv = g[(p * dnr + r) * dnc + c];
                d[base + ty.lo * snc + tx.lo] += (1.0 - ty.frac) * (1.0 - tx.frac) * gv;
                d[base + ty.lo * snc + tx.hi] += (1.0 - ty.frac) * tx.frac * gv;
                d[base + ty.hi * snc + tx.lo] += ty.frac * (1.0 - tx.frac) * gv;
                d[base + ty.hi * snc + tx.hi] += ty.frac * tx.frac * gv;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorShape;

    #[test]
    fn corners_are_preserved_and_midpoints_interpolate() -> Result<()> {
        let src = Tensor::from_vec(TensorShape::new(1, 1, 2, 2), vec![0.0, 2.0, 4.0, 6.0])?;
        let mut dest = Tensor::zeros(TensorShape::new(1, 1, 3, 3));
        resize_bilinear(&mut dest, &src)?;
        assert_eq!(
            dest.host(),
            &[0.0, 1.0, 2.0, 2.0, 3.0, 4.0, 4.0, 5.0, 6.0]
        );
        Ok(())
    }

    #[test]
    fn gradient_is_the_adjoint() -> Result<()> {
        let shape = TensorShape::new(1, 2, 3, 4);
        let x = Tensor::from_vec(shape, (0..shape.size()).map(|i| (i as f32).sin()).collect())?;
        let mut y = Tensor::zeros(TensorShape::new(1, 2, 5, 7));
        resize_bilinear(&mut y, &x)?;
        let g = Tensor::from_vec(y.shape(), (0..y.size()).map(|i| (i as f32 * 0.7).cos()).collect())?;
        let mut gx = Tensor::zeros(shape);
        resize_bilinear_gradient(&mut gx, &g)?;
        assert!((y.dot(&g) - x.dot(&gx)).abs() < 1e-3);
        Ok(())
    }
}
