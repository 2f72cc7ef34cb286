//! Normalisation layers.
//!
//! Batch norm keeps running statistics and has distinct training and
//! inference forwards. Layer and RMS norm compute statistics over each
//! sample's `k·nr·nc` values with a per-channel gain. Affine is the frozen
//! batch-norm fold; l2normalize rescales each sample to unit norm.

pub mod affine;
pub mod batch;
pub mod l2;
pub mod sample;

use serde::{Deserialize, Serialize};

pub use affine::{read_affine, Affine};
pub use batch::{read_batch_norm, BatchNorm, BatchNormOptions};
pub use l2::{read_l2normalize, L2Normalize};
pub use sample::{read_layer_norm, read_rms_norm, LayerNorm, NormKind, RmsNorm};

use crate::{Multipliers, TensorShape};

/// Grouping of activations that share one set of statistics or gains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormMode {
    /// One group per channel, pooled over samples and spatial positions.
    #[default]
    Conv,
    /// One group per activation, pooled over samples.
    Fc,
}

impl NormMode {
    pub(crate) fn code(self) -> i64 {
        match self {
            NormMode::Conv => 0,
            NormMode::Fc => 1,
        }
    }

    pub(crate) fn from_code(code: i64) -> crate::Result<Self> {
        match code {
            0 => Ok(NormMode::Conv),
            1 => Ok(NormMode::Fc),
            other => Err(crate::LayerError::Malformed(format!("unknown norm mode {other}"))),
        }
    }

    /// Shape of the per-group gain for an input of `input` shape.
    pub(crate) fn group_shape(self, input: TensorShape) -> TensorShape {
        match self {
            NormMode::Conv => TensorShape::new(1, input.k, 1, 1),
            NormMode::Fc => TensorShape::new(1, input.k, input.nr, input.nc),
        }
    }

    /// Group index of flat element `idx` in a tensor of `shape`.
    #[inline]
    pub(crate) fn group(self, shape: TensorShape, idx: usize) -> usize {
        match self {
            NormMode::Conv => (idx / shape.plane_size()) % shape.k,
            NormMode::Fc => idx % shape.sample_size(),
        }
    }
}

/// Multipliers shared by the normalisation layers: gains train without
/// weight decay, biases with it.
pub(crate) const NORM_MULTIPLIERS: Multipliers = Multipliers::new(1.0, 0.0, 1.0, 1.0);
