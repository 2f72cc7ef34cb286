//! Numeric kernels behind the layer contract.
//!
//! Layers call these by name. Matrix products, convolution forward and data
//! gradient, and unpadded pooling are delegated to candle. The filter
//! gradient, pooling gradients and padded pooling run as host loops over
//! [`crate::Tensor`].

pub mod conv;
pub mod gemm;
pub mod pool;
pub mod resize;

pub use conv::{conv_backward_data, conv_backward_filters, conv_forward, ConvGeometry};
pub use gemm::{gemm, MatRef};
pub use pool::{PoolGeometry, PoolKind};
pub use resize::{resize_bilinear, resize_bilinear_gradient};

/// Spatial output extent of a strided window: `(in + 2·pad − window)/stride + 1`.
///
/// `None` when the padded input is smaller than the window.
pub fn strided_output_dim(input: usize, window: usize, stride: usize, pad: usize) -> Option<usize> {
    let padded = input + 2 * pad;
    if padded < window || stride == 0 {
        None
    } else {
        Some((padded - window) / stride + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_output_matches_closed_form() {
        assert_eq!(strided_output_dim(5, 3, 1, 1), Some(5));
        assert_eq!(strided_output_dim(7, 3, 2, 0), Some(3));
        assert_eq!(strided_output_dim(8, 5, 2, 2), Some(4));
        assert_eq!(strided_output_dim(2, 5, 1, 1), None);
    }
}
