//! Triangular masking of activation planes.
//!
//! A mask keeps `(r, c)` with `c <= r + diag` and replaces every other
//! position by a fill value. It is stored as a pair of tensors shaped like the
//! input: a binary keep mask and an additive fill, so that
//! `out = in · keep + fill`.

pub mod tril;

use serde::{Deserialize, Serialize};

use layers::{LayerError, Result, Tensor, TensorShape};

pub use tril::{read_tril, Tril};

/// Value written into masked positions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskFill {
    #[default]
    Zero,
    NegInfinity,
    Constant(f32),
}

impl MaskFill {
    /// The rational fill `num / den`.
    pub fn ratio(num: i64, den: i64) -> Result<Self> {
        if den == 0 {
            return Err(LayerError::config("tril", "fill denominator must be non-zero"));
        }
        Ok(Self::from_value(num as f32 / den as f32))
    }

    /// Inverse of [`MaskFill::value`].
    pub fn from_value(value: f32) -> Self {
        if value == 0.0 {
            Self::Zero
        } else if value == f32::NEG_INFINITY {
            Self::NegInfinity
        } else {
            Self::Constant(value)
        }
    }

    pub fn value(self) -> f32 {
        match self {
            Self::Zero => 0.0,
            Self::NegInfinity => f32::NEG_INFINITY,
            Self::Constant(v) => v,
        }
    }

    pub fn is_zero(self) -> bool {
        self.value() == 0.0
    }
}

/// Builds the keep mask and the additive fill for `shape`.
///
/// The fill tensor is left empty when `fill` is zero.
pub fn triangular_masks(shape: TensorShape, diag: i64, fill: MaskFill) -> (Tensor, Tensor) {
    let mut keep = Tensor::filled(shape, 1.0);
    let mut additive = Tensor::new();
    let value = fill.value();
    if !fill.is_zero() {
        additive.set_size(shape);
    }

    let plane = shape.plane_size();
    if plane == 0 {
        return (keep, additive);
    }
    for (p, keep_plane) in keep.host_mut().chunks_mut(plane).enumerate() {
        for r in 0..shape.nr {
            let first_masked = (r as i64)
                .saturating_add(diag)
                .saturating_add(1)
                .clamp(0, shape.nc as i64) as usize;
            for c in first_masked..shape.nc {
                let i = r * shape.nc + c;
                keep_plane[i] = 0.0;
                if value != 0.0 {
                    additive.host_mut()[p * plane + i] = value;
                }
            }
        }
    }
    (keep, additive)
}

#[cfg(test)]
mod tests;
