//! Seeded random fills for parameter initialization and dropout masks.

use rand::distributions::{Distribution, Uniform};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Normal, StandardNormal};

use crate::{LayerError, Result};

/// Seed used by layers that were not given one explicitly.
pub const DEFAULT_SEED: u64 = 0;

/// Thin wrapper over a seeded [`StdRng`].
#[derive(Debug, Clone)]
pub struct TensorRng {
    rng: StdRng,
}

impl TensorRng {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform values in `[0, 1)`.
    pub fn fill_uniform(&mut self, data: &mut [f32]) {
        for v in data.iter_mut() {
            *v = self.rng.gen::<f32>();
        }
    }

    /// Draws from `N(0, 1)`.
    pub fn fill_standard_normal(&mut self, data: &mut [f32]) {
        for v in data.iter_mut() {
            *v = StandardNormal.sample(&mut self.rng);
        }
    }

    /// Draws from `N(mean, std²)`; `std` must be finite and non-negative.
    pub fn fill_gaussian(&mut self, data: &mut [f32], mean: f32, std: f32) -> Result<()> {
        let normal = Normal::new(mean, std)
            .map_err(|e| LayerError::config("rng", format!("normal({mean}, {std}): {e}")))?;
        for v in data.iter_mut() {
            *v = normal.sample(&mut self.rng);
        }
        Ok(())
    }

    /// Glorot/Xavier uniform fill in `±sqrt(6 / fan_in_out)`.
    pub fn xavier_uniform(&mut self, data: &mut [f32], fan_in_out: usize) {
        let bound = (6.0f64 / fan_in_out.max(1) as f64).sqrt() as f32;
        let dist = Uniform::new_inclusive(-bound, bound);
        for v in data.iter_mut() {
            *v = dist.sample(&mut self.rng);
        }
    }
}

impl Default for TensorRng {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_values() -> Result<()> {
        let mut a = vec![0f32; 7];
        let mut b = vec![0f32; 7];
        TensorRng::new(42).fill_gaussian(&mut a, 0.0, 1.0)?;
        TensorRng::new(42).fill_gaussian(&mut b, 0.0, 1.0)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn gaussian_moments_follow_the_parameters() -> Result<()> {
        let mut data = vec![0f32; 20_000];
        TensorRng::new(7).fill_gaussian(&mut data, 2.0, 0.5)?;
        let n = data.len() as f64;
        let mean = data.iter().map(|v| f64::from(*v)).sum::<f64>() / n;
        let var = data.iter().map(|v| (f64::from(*v) - mean).powi(2)).sum::<f64>() / n;
        assert!((mean - 2.0).abs() < 0.02, "mean {mean}");
        assert!((var.sqrt() - 0.5).abs() < 0.02, "std {}", var.sqrt());
        Ok(())
    }

    #[test]
    fn invalid_deviation_is_a_config_error() {
        let mut data = vec![0f32; 3];
        let err = TensorRng::new(1).fill_gaussian(&mut data, 0.0, f32::NAN).unwrap_err();
        assert!(matches!(err, LayerError::Config { layer: "rng", .. }));
    }

    #[test]
    fn standard_normal_is_seeded() {
        let mut a = vec![0f32; 5];
        let mut b = vec![0f32; 5];
        TensorRng::new(9).fill_standard_normal(&mut a);
        TensorRng::new(9).fill_standard_normal(&mut b);
        assert_eq!(a, b);
        assert!(a.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn xavier_respects_bound() {
        let mut data = vec![0f32; 256];
        TensorRng::new(3).xavier_uniform(&mut data, 24);
        let bound = (6.0f32 / 24.0).sqrt();
        assert!(data.iter().all(|v| v.abs() <= bound));
        assert!(data.iter().any(|v| *v != 0.0));
    }
}
