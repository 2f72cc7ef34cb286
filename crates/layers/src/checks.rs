//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise configuration and shape assertions for
//! constructors, `setup`, and forward paths. They return [`crate::Result`] so
//! call sites can propagate errors without panicking.

use crate::{LayerError, Result, Tensor, TensorShape};

/// Rejects a zero-valued size parameter at construction time.
pub fn expect_positive(layer: &'static str, field: &str, value: usize) -> Result<()> {
    if value == 0 {
        Err(LayerError::config(layer, format!("{field} must be > 0")))
    } else {
        Ok(())
    }
}

/// Ensures two tensors have identical dimensions.
pub fn expect_same_shape(layer: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.same_dims(b) {
        Ok(())
    } else {
        Err(LayerError::shape(
            layer,
            format!("expected matching shapes, got {} and {}", a.shape(), b.shape()),
        ))
    }
}

/// Ensures the tensor has exactly `expected` dimensions.
pub fn expect_shape(layer: &'static str, tensor: &Tensor, expected: TensorShape) -> Result<()> {
    if tensor.shape() == expected {
        Ok(())
    } else {
        Err(LayerError::shape(
            layer,
            format!("expected shape {}, got {}", expected, tensor.shape()),
        ))
    }
}

/// Validates the channel count.
pub fn expect_k(layer: &'static str, tensor: &Tensor, k: usize) -> Result<()> {
    if tensor.k() == k {
        Ok(())
    } else {
        Err(LayerError::shape(
            layer,
            format!("expected {} channels, got input {}", k, tensor.shape()),
        ))
    }
}

/// Validates the number of values per sample.
pub fn expect_sample_size(layer: &'static str, tensor: &Tensor, size: usize) -> Result<()> {
    if tensor.shape().sample_size() == size {
        Ok(())
    } else {
        Err(LayerError::shape(
            layer,
            format!(
                "expected {} values per sample, got input {}",
                size,
                tensor.shape()
            ),
        ))
    }
}

/// Rejects an input with no elements.
pub fn expect_non_empty(layer: &'static str, tensor: &Tensor) -> Result<()> {
    if tensor.is_empty() {
        Err(LayerError::shape(layer, "input tensor is empty"))
    } else {
        Ok(())
    }
}

/// Gradient tensors must match the output they differentiate.
pub fn expect_gradient(layer: &'static str, gradient: &Tensor, output: &Tensor) -> Result<()> {
    if gradient.same_dims(output) {
        Ok(())
    } else {
        Err(LayerError::shape(
            layer,
            format!(
                "gradient {} does not match output {}",
                gradient.shape(),
                output.shape()
            ),
        ))
    }
}

/// `params_grad` must be sized like the parameter buffer.
pub fn expect_params_grad(layer: &'static str, params_grad: &Tensor, params: &Tensor) -> Result<()> {
    if params_grad.size() == params.size() {
        Ok(())
    } else {
        Err(LayerError::shape(
            layer,
            format!(
                "parameter gradient holds {} values, parameters hold {}",
                params_grad.size(),
                params.size()
            ),
        ))
    }
}
