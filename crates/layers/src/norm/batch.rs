//! Batch normalisation with running statistics.
//!
//! `forward_train` normalises with the batch statistics and folds them into
//! the running mean and variance; `forward` applies the frozen running
//! statistics. Backward differentiates whichever forward ran last.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use super::{NormMode, NORM_MULTIPLIERS};
use crate::serialize as ser;
use crate::{
    checks, AliasTensor, Layer, LayerError, LayerState, Multipliers, Result, Subnet, Tensor,
    TensorShape,
};

pub const DEFAULT_WINDOW: usize = 100;
pub const DEFAULT_EPS: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchNormOptions {
    pub mode: NormMode,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_eps")]
    pub eps: f64,
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

fn default_eps() -> f64 {
    DEFAULT_EPS
}

impl BatchNormOptions {
    pub fn new(mode: NormMode) -> Self {
        Self {
            mode,
            window: DEFAULT_WINDOW,
            eps: DEFAULT_EPS,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastForward {
    None,
    Train,
    Inference,
}

#[derive(Debug, Clone)]
pub struct BatchNorm {
    options: BatchNormOptions,
    multipliers: Multipliers,
    params: Tensor,
    gamma: AliasTensor,
    beta: AliasTensor,
    means: Tensor,
    invstds: Tensor,
    running_means: Tensor,
    running_variances: Tensor,
    num_updates: usize,
    last: LastForward,
    state: LayerState,
}

fn layer_name(mode: NormMode) -> &'static str {
    match mode {
        NormMode::Conv => "bn_con",
        NormMode::Fc => "bn_fc",
    }
}

fn version_tag(mode: NormMode) -> &'static str {
    match mode {
        NormMode::Conv => "bn_con2",
        NormMode::Fc => "bn_fc2",
    }
}

impl BatchNorm {
    pub fn new(options: BatchNormOptions) -> Result<Self> {
        let name = layer_name(options.mode);
        checks::expect_positive(name, "window", options.window)?;
        if !(options.eps > 0.0) {
            return Err(LayerError::config(name, "eps must be > 0"));
        }
        Ok(Self {
            options,
            multipliers: NORM_MULTIPLIERS,
            params: Tensor::new(),
            gamma: AliasTensor::default(),
            beta: AliasTensor::default(),
            means: Tensor::new(),
            invstds: Tensor::new(),
            running_means: Tensor::new(),
            running_variances: Tensor::new(),
            num_updates: 0,
            last: LastForward::None,
            state: LayerState::Uninitialized,
        })
    }

    pub fn conv() -> Result<Self> {
        Self::new(BatchNormOptions::new(NormMode::Conv))
    }

    pub fn fc() -> Result<Self> {
        Self::new(BatchNormOptions::new(NormMode::Fc))
    }

    pub fn mode(&self) -> NormMode {
        self.options.mode
    }

    pub fn eps(&self) -> f64 {
        self.options.eps
    }

    pub fn window(&self) -> usize {
        self.options.window
    }

    pub fn set_window(&mut self, window: usize) -> Result<()> {
        checks::expect_positive(self.name(), "window", window)?;
        self.options.window = window;
        self.num_updates = self.num_updates.min(window);
        Ok(())
    }

    pub fn multipliers(&self) -> &Multipliers {
        &self.multipliers
    }

    pub fn set_multipliers(&mut self, multipliers: Multipliers) {
        self.multipliers = multipliers;
    }

    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    /// Weight the next training forward gives the batch statistics.
    ///
    /// `1/(n+1)` for the update count `n`, reaching `1/window` once the
    /// counter saturates.
    pub fn next_decay(&self) -> f64 {
        let n = self.num_updates.min(self.options.window - 1);
        1.0 - n as f64 / (n as f64 + 1.0)
    }

    pub fn running_means(&self) -> &Tensor {
        &self.running_means
    }

    pub fn running_variances(&self) -> &Tensor {
        &self.running_variances
    }

    pub fn gamma(&self) -> Result<Tensor> {
        Ok(self.gamma.view(&self.params)?.to_tensor())
    }

    pub fn beta(&self) -> Result<Tensor> {
        Ok(self.beta.view(&self.params)?.to_tensor())
    }

    fn check_input(&self, input: &Tensor) -> Result<()> {
        let expected = self.gamma.shape();
        let observed = self.options.mode.group_shape(input.shape());
        if expected != observed {
            return Err(LayerError::shape(
                self.name(),
                format!("input {} does not match gains of shape {}", input.shape(), expected),
            ));
        }
        Ok(())
    }

    /// Per-group element count.
    fn group_count(&self, shape: TensorShape) -> usize {
        match self.options.mode {
            NormMode::Conv => shape.num_samples * shape.plane_size(),
            NormMode::Fc => shape.num_samples,
        }
    }

    fn read_record(mode: NormMode, input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, layer_name(mode), &[version_tag(mode)])?;
        Self::read_fields(mode, input)
    }

    /// Reads everything after the version tag.
    pub(crate) fn read_fields(mode: NormMode, input: &mut dyn Read) -> Result<Self> {
        let params = ser::read_tensor(input)?;
        let gamma = ser::read_alias(input)?;
        let beta = ser::read_alias(input)?;
        let means = ser::read_tensor(input)?;
        let invstds = ser::read_tensor(input)?;
        let running_means = ser::read_tensor(input)?;
        let running_variances = ser::read_tensor(input)?;
        let num_updates = ser::read_usize(input)?;
        let window = ser::read_usize(input)?;
        let multipliers = ser::read_multipliers(input)?;
        let eps = ser::read_f64(input)?;
        let mut loaded = Self::new(BatchNormOptions { mode, window, eps })?;
        loaded.multipliers = multipliers;
        loaded.state = if params.is_empty() {
            LayerState::Uninitialized
        } else {
            LayerState::Ready
        };
        loaded.params = params;
        loaded.gamma = gamma;
        loaded.beta = beta;
        loaded.means = means;
        loaded.invstds = invstds;
        loaded.running_means = running_means;
        loaded.running_variances = running_variances;
        loaded.num_updates = num_updates;
        Ok(loaded)
    }

    fn normalize_train(&mut self, input: &Tensor, output: &mut Tensor) -> Result<()> {
        let mode = self.options.mode;
        let shape = input.shape();
        let groups = self.gamma.size();
        let m = self.group_count(shape) as f64;
        let mut sum = vec![0.0f64; groups];
        let mut sq = vec![0.0f64; groups];
        for (i, x) in input.host().iter().enumerate() {
            let g = mode.group(shape, i);
            sum[g] += f64::from(*x);
            sq[g] += f64::from(*x) * f64::from(*x);
        }

        let gshape = self.gamma.shape();
        self.means.set_size(gshape);
        self.invstds.set_size(gshape);
        let decay = self.next_decay();
        let unbias = if m > 1.0 { m / (m - 1.0) } else { 1.0 };
        for g in 0..groups {
            let mean = sum[g] / m;
            let var = (sq[g] / m - mean * mean).max(0.0);
            self.means.host_mut()[g] = mean as f32;
            self.invstds.host_mut()[g] = (1.0 / (var + self.options.eps).sqrt()) as f32;
            let rm = &mut self.running_means.host_mut()[g];
            *rm = ((1.0 - decay) * f64::from(*rm) + decay * mean) as f32;
            let rv = &mut self.running_variances.host_mut()[g];
            *rv = ((1.0 - decay) * f64::from(*rv) + decay * var * unbias) as f32;
        }
        self.num_updates = (self.num_updates + 1).min(self.options.window);

        let gamma = self.gamma.view(&self.params)?;
        let beta = self.beta.view(&self.params)?;
        let (means, invstds) = (self.means.host(), self.invstds.host());
        for (i, (o, x)) in output.host_mut().iter_mut().zip(input.host()).enumerate() {
            let g = mode.group(shape, i);
            *o = gamma.host()[g] * (x - means[g]) * invstds[g] + beta.host()[g];
        }
        Ok(())
    }
}

impl Layer for BatchNorm {
    fn name(&self) -> &'static str {
        layer_name(self.options.mode)
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        let input = sub.output();
        checks::expect_non_empty(self.name(), input)?;
        let gshape = self.options.mode.group_shape(input.shape());
        if !self.params.is_empty() {
            if self.gamma.shape() != gshape || self.params.size() != 2 * gshape.size() {
                return Err(LayerError::shape(
                    self.name(),
                    format!(
                        "input {} needs {} parameters but {} are already allocated",
                        input.shape(),
                        2 * gshape.size(),
                        self.params.size()
                    ),
                ));
            }
            self.state = LayerState::Ready;
            return Ok(());
        }

        self.gamma = AliasTensor::new(gshape, 0);
        self.beta = AliasTensor::new(gshape, gshape.size());
        self.params.set_size(TensorShape::new(1, 1, 1, 2 * gshape.size()));
        self.gamma.view_mut(&mut self.params)?.fill(1.0);
        self.running_means = Tensor::zeros(gshape);
        self.running_variances = Tensor::filled(gshape, 1.0);
        self.num_updates = 0;
        log::debug!("{}: allocated gains of shape {}", self.name(), gshape);
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(self.name())?;
        let input = sub.output();
        self.check_input(input)?;
        let mode = self.options.mode;
        let shape = input.shape();
        output.set_size(shape);
        let gamma = self.gamma.view(&self.params)?;
        let beta = self.beta.view(&self.params)?;
        let (rm, rv) = (self.running_means.host(), self.running_variances.host());
        let eps = self.options.eps as f32;
        for (i, (o, x)) in output.host_mut().iter_mut().zip(input.host()).enumerate() {
            let g = mode.group(shape, i);
            *o = gamma.host()[g] * (x - rm[g]) / (rv[g] + eps).sqrt() + beta.host()[g];
        }
        self.last = LastForward::Inference;
        Ok(())
    }

    fn forward_train(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(self.name())?;
        let input = sub.output();
        self.check_input(input)?;
        output.set_size(input.shape());
        self.normalize_train(input, output)?;
        self.last = LastForward::Train;
        Ok(())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        params_grad: &mut Tensor,
    ) -> Result<()> {
        let name = self.name();
        self.state.ensure_ready(name)?;
        checks::expect_gradient(name, gradient_input, computed_output)?;
        let mode = self.options.mode;
        let groups = self.gamma.size();
        let gamma = self.gamma.view(&self.params)?;
        let (input, data_grad) = sub.output_and_gradient()?;
        checks::expect_same_shape(name, input, gradient_input)?;
        let shape = input.shape();
        let eps = self.options.eps as f32;

        // Per-group centre and inverse deviation of whichever forward ran last.
        let (centre, inv): (Vec<f32>, Vec<f32>) = match self.last {
            LastForward::Train => (self.means.host().to_vec(), self.invstds.host().to_vec()),
            LastForward::Inference => (
                self.running_means.host().to_vec(),
                self.running_variances
                    .host()
                    .iter()
                    .map(|v| 1.0 / (v + eps).sqrt())
                    .collect(),
            ),
            LastForward::None => {
                return Err(LayerError::shape(name, "backward called before forward"));
            }
        };

        let mut dbeta = vec![0.0f32; groups];
        let mut dgamma = vec![0.0f32; groups];
        for (i, (dy, x)) in gradient_input.host().iter().zip(input.host()).enumerate() {
            let g = mode.group(shape, i);
            dbeta[g] += dy;
            dgamma[g] += dy * (x - centre[g]) * inv[g];
        }

        match self.last {
            LastForward::Train => {
                let m = self.group_count(shape) as f32;
                for (i, (dx, (dy, x))) in data_grad
                    .host_mut()
                    .iter_mut()
                    .zip(gradient_input.host().iter().zip(input.host()))
                    .enumerate()
                {
                    let g = mode.group(shape, i);
                    let xhat = (x - centre[g]) * inv[g];
                    *dx += gamma.host()[g] * inv[g] / m * (m * dy - dbeta[g] - xhat * dgamma[g]);
                }
            }
            _ => {
                for (i, (dx, dy)) in data_grad
                    .host_mut()
                    .iter_mut()
                    .zip(gradient_input.host())
                    .enumerate()
                {
                    let g = mode.group(shape, i);
                    *dx += gamma.host()[g] * inv[g] * dy;
                }
            }
        }

        if self.multipliers.learning_rate != 0.0 {
            checks::expect_params_grad(name, params_grad, &self.params)?;
            self.gamma
                .view_slice_mut(params_grad.host_mut())?
                .copy_from(&dgamma)?;
            self.beta
                .view_slice_mut(params_grad.host_mut())?
                .copy_from(&dbeta)?;
        }
        Ok(())
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, version_tag(self.options.mode))?;
        ser::write_tensor(out, &self.params)?;
        ser::write_alias(out, &self.gamma)?;
        ser::write_alias(out, &self.beta)?;
        ser::write_tensor(out, &self.means)?;
        ser::write_tensor(out, &self.invstds)?;
        ser::write_tensor(out, &self.running_means)?;
        ser::write_tensor(out, &self.running_variances)?;
        ser::write_usize(out, self.num_updates)?;
        ser::write_usize(out, self.options.window)?;
        ser::write_multipliers(out, &self.multipliers)?;
        ser::write_f64(out, self.options.eps)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        *self = Self::read_record(self.options.mode, input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<{name} eps='{}' running_stats_window_size='{}'{}>\n{}</{name}>\n",
            self.options.eps,
            self.options.window,
            self.multipliers.xml_attrs(),
            ser::tensor_text(&self.params),
            name = self.name()
        )
    }
}

impl fmt::Display for BatchNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<8} eps={} running_stats_window_size={}{}",
            self.name(),
            self.options.eps,
            self.options.window,
            self.multipliers.summary(true)
        )
    }
}

/// Reads a `bn_con2` or `bn_fc2` record, taking the mode from the tag.
pub fn read_batch_norm(input: &mut dyn Read) -> Result<BatchNorm> {
    let tag = ser::read_str(input)?;
    let mode = match tag.as_str() {
        "bn_con2" => NormMode::Conv,
        "bn_fc2" => NormMode::Fc,
        _ => {
            return Err(LayerError::UnknownVersion {
                layer: "bn",
                found: tag,
            })
        }
    };
    BatchNorm::read_fields(mode, input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients, random_tensor, GradCheck};
    use crate::Bindings;
    use std::io::Cursor;

    fn ready(mode: NormMode, shape: TensorShape, seed: u64) -> Result<(BatchNorm, Bindings)> {
        let mut bn = BatchNorm::new(BatchNormOptions::new(mode))?;
        let bindings = Bindings::new(random_tensor(shape, seed));
        bn.setup(&bindings)?;
        Ok((bn, bindings))
    }

    #[test]
    fn training_output_is_standardised_per_channel() -> Result<()> {
        let (mut bn, bindings) = ready(NormMode::Conv, TensorShape::new(4, 3, 5, 5), 1)?;
        let mut out = Tensor::new();
        bn.forward_train(&bindings, &mut out)?;
        let plane = 25;
        for k in 0..3 {
            let vals: Vec<f32> = (0..4)
                .flat_map(|n| out.host()[(n * 3 + k) * plane..(n * 3 + k + 1) * plane].to_vec())
                .collect();
            let mean = vals.iter().sum::<f32>() / vals.len() as f32;
            let var = vals.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / vals.len() as f32;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-2);
        }
        Ok(())
    }

    #[test]
    fn decay_saturates_at_one_over_window() -> Result<()> {
        let window = 4;
        let mut bn = BatchNorm::new(BatchNormOptions::new(NormMode::Fc).with_window(window))?;
        let bindings = Bindings::new(random_tensor(TensorShape::new(3, 2, 1, 1), 2));
        bn.setup(&bindings)?;
        assert_eq!(bn.next_decay(), 1.0);
        let mut out = Tensor::new();
        for _ in 0..=window {
            bn.forward_train(&bindings, &mut out)?;
        }
        assert_eq!(bn.num_updates(), window);
        assert!((bn.next_decay() - 1.0 / window as f64).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn first_update_replaces_running_statistics() -> Result<()> {
        let (mut bn, bindings) = ready(NormMode::Fc, TensorShape::new(4, 2, 1, 1), 3)?;
        let mut out = Tensor::new();
        bn.forward_train(&bindings, &mut out)?;
        let x = bindings.input().host();
        let mean0 = (x[0] + x[2] + x[4] + x[6]) / 4.0;
        assert!((bn.running_means().host()[0] - mean0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn inference_uses_frozen_statistics() -> Result<()> {
        let (mut bn, bindings) = ready(NormMode::Conv, TensorShape::new(2, 2, 3, 3), 4)?;
        let mut out = Tensor::new();
        bn.forward(&bindings, &mut out)?;
        // fresh running stats are mean 0, variance 1
        let scale = 1.0 / (1.0f32 + 1e-4).sqrt();
        for (o, x) in out.host().iter().zip(bindings.input().host()) {
            assert!((o - x * scale).abs() < 1e-6);
        }
        assert_eq!(bn.num_updates(), 0);
        Ok(())
    }

    #[test]
    fn gradients_match_finite_differences_in_both_modes() -> Result<()> {
        for mode in [NormMode::Conv, NormMode::Fc] {
            for train in [false, true] {
                let mut bn = BatchNorm::new(BatchNormOptions::new(mode).with_window(1_000_000))?;
                let bindings = Bindings::new(random_tensor(TensorShape::new(3, 2, 2, 3), 5));
                let cfg = GradCheck {
                    train,
                    ..GradCheck::default()
                };
                let report = check_gradients(&mut bn, bindings, cfg)?;
                assert!(report.passes(2e-2), "{mode:?} train={train}: {report:?}");
            }
        }
        Ok(())
    }

    #[test]
    fn record_round_trips_with_running_statistics() -> Result<()> {
        let (mut bn, bindings) = ready(NormMode::Conv, TensorShape::new(3, 2, 2, 2), 6)?;
        let mut out = Tensor::new();
        bn.forward_train(&bindings, &mut out)?;
        let mut buf = Vec::new();
        bn.serialize(&mut buf)?;

        let mut fresh = BatchNorm::conv()?;
        fresh.deserialize(&mut Cursor::new(&buf))?;
        assert_eq!(fresh.running_means(), bn.running_means());
        assert_eq!(fresh.num_updates(), 1);

        let mut fc = BatchNorm::fc()?;
        assert!(fc.deserialize(&mut Cursor::new(&buf)).is_err());
        assert!(fc.params().is_empty());
        assert_eq!(read_batch_norm(&mut Cursor::new(&buf))?.mode(), NormMode::Conv);
        Ok(())
    }

    #[test]
    fn zero_window_is_rejected() {
        assert!(BatchNorm::new(BatchNormOptions::new(NormMode::Conv).with_window(0)).is_err());
    }
}
