//! Dense matrix products delegated to candle.

use candle_core::Device;

use crate::{LayerError, Result};

/// Row-major matrix borrowed from a flat buffer.
#[derive(Debug, Clone, Copy)]
pub struct MatRef<'a> {
    pub data: &'a [f32],
    pub rows: usize,
    pub cols: usize,
}

impl<'a> MatRef<'a> {
    pub fn new(data: &'a [f32], rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(LayerError::shape(
                "gemm",
                format!("{} values cannot form a {}x{} matrix", data.len(), rows, cols),
            ));
        }
        Ok(Self { data, rows, cols })
    }

    fn dims(&self, transposed: bool) -> (usize, usize) {
        if transposed {
            (self.cols, self.rows)
        } else {
            (self.rows, self.cols)
        }
    }

    fn to_candle(self, transposed: bool, device: &Device) -> Result<candle_core::Tensor> {
        let t = candle_core::Tensor::from_slice(self.data, (self.rows, self.cols), device)?;
        Ok(if transposed { t.t()?.contiguous()? } else { t })
    }
}

/// `dest = beta·dest + alpha·op(lhs)·op(rhs)` where `op` optionally transposes.
pub fn gemm(
    beta: f32,
    dest: &mut [f32],
    alpha: f32,
    lhs: MatRef<'_>,
    trans_lhs: bool,
    rhs: MatRef<'_>,
    trans_rhs: bool,
) -> Result<()> {
    let (m, inner) = lhs.dims(trans_lhs);
    let (inner_rhs, n) = rhs.dims(trans_rhs);
    if inner != inner_rhs || dest.len() != m * n {
        return Err(LayerError::shape(
            "gemm",
            format!(
                "cannot multiply {}x{} by {}x{} into {} values",
                m,
                inner,
                inner_rhs,
                n,
                dest.len()
            ),
        ));
    }

    if m * n == 0 {
        return Ok(());
    }
    if inner == 0 {
        dest.iter_mut().for_each(|d| *d *= beta);
        return Ok(());
    }

    let device = Device::Cpu;
    let a = lhs.to_candle(trans_lhs, &device)?;
    let b = rhs.to_candle(trans_rhs, &device)?;
    let product = a.matmul(&b)?.flatten_all()?.to_vec1::<f32>()?;

    if beta == 0.0 {
        for (d, p) in dest.iter_mut().zip(product) {
            *d = alpha * p;
        }
    } else {
        for (d, p) in dest.iter_mut().zip(product) {
            *d = beta * *d + alpha * p;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transposed_product_accumulates() -> Result<()> {
        // lhs is 2x3, lhs^T is 3x2; rhs is 2x2.
        let lhs = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let rhs = [1.0f32, 0.0, 0.0, 1.0];
        let mut dest = vec![1.0f32; 6];
        gemm(
            1.0,
            &mut dest,
            2.0,
            MatRef::new(&lhs, 2, 3)?,
            true,
            MatRef::new(&rhs, 2, 2)?,
            false,
        )?;
        assert_eq!(dest, vec![3.0, 9.0, 5.0, 11.0, 7.0, 13.0]);
        Ok(())
    }

    #[test]
    fn mismatched_inner_dims_fail() -> Result<()> {
        let a = [0.0f32; 6];
        let mut dest = vec![0.0f32; 4];
        let err = gemm(
            0.0,
            &mut dest,
            1.0,
            MatRef::new(&a, 2, 3)?,
            false,
            MatRef::new(&a, 2, 3)?,
            false,
        );
        assert!(err.is_err());
        Ok(())
    }
}
