//! Finite-difference verification of a layer's `backward`.
//!
//! The check treats `L = Σ output ⊙ w` for a fixed random `w` as the loss,
//! feeds `w` to `backward`, and compares the resulting input and parameter
//! gradients to central differences of `L`. Gradient slots are pre-filled
//! with a constant so that overwriting instead of accumulating is caught.

use crate::{rng::TensorRng, Bindings, Layer, Result, Subnet, Tensor};

const PREFILL: f32 = 0.5;

/// Knobs for [`check_gradients`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradCheck {
    pub epsilon: f32,
    pub tolerance: f32,
    /// Use `forward_train` instead of `forward`.
    pub train: bool,
    pub check_input: bool,
    pub check_params: bool,
    pub seed: u64,
}

impl Default for GradCheck {
    fn default() -> Self {
        Self {
            epsilon: 1e-3,
            tolerance: 1e-2,
            train: false,
            check_input: true,
            check_params: true,
            seed: 7,
        }
    }
}

/// Largest relative discrepancies found by [`check_gradients`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GradReport {
    pub max_input_error: f32,
    pub max_param_error: f32,
}

impl GradReport {
    pub fn passes(&self, tolerance: f32) -> bool {
        self.max_input_error <= tolerance && self.max_param_error <= tolerance
    }
}

fn relative_error(analytic: f32, numeric: f32) -> f32 {
    (analytic - numeric).abs() / analytic.abs().max(numeric.abs()).max(1.0)
}

fn run(layer: &mut dyn Layer, bindings: &Bindings, train: bool, out: &mut Tensor) -> Result<()> {
    if train {
        layer.forward_train(bindings, out)
    } else {
        layer.forward(bindings, out)
    }
}

fn loss(
    layer: &mut dyn Layer,
    bindings: &Bindings,
    train: bool,
    weights: &Tensor,
    scratch: &mut Tensor,
) -> Result<f64> {
    run(layer, bindings, train, scratch)?;
    Ok(scratch.dot(weights))
}

/// Sets `layer` up against `bindings` and compares analytic to numeric gradients.
pub fn check_gradients(layer: &mut dyn Layer, mut bindings: Bindings, cfg: GradCheck) -> Result<GradReport> {
    layer.setup(&bindings)?;
    let mut output = Tensor::new();
    run(layer, &bindings, cfg.train, &mut output)?;

    let mut weights = Tensor::zeros(output.shape());
    TensorRng::new(cfg.seed).fill_uniform(weights.host_mut());
    weights.host_mut().iter_mut().for_each(|v| *v = 2.0 * *v - 1.0);

    bindings.reset_gradients();
    bindings.gradient_input()?.fill(PREFILL);
    let tags = bindings.tags();
    for &tag in &tags {
        bindings.tagged_gradient_input(tag)?.fill(PREFILL);
    }
    let mut params_grad = Tensor::zeros(layer.params().shape());
    layer.backward(&output, &weights, &mut bindings, &mut params_grad)?;

    let eps = cfg.epsilon;
    let mut scratch = Tensor::new();
    let mut report = GradReport::default();

    if cfg.check_input {
        let analytic = bindings.gradient().clone();
        for i in 0..bindings.input().size() {
            let original = bindings.input().host()[i];
            bindings.input_mut().host_mut()[i] = original + eps;
            let up = loss(layer, &bindings, cfg.train, &weights, &mut scratch)?;
            bindings.input_mut().host_mut()[i] = original - eps;
            let down = loss(layer, &bindings, cfg.train, &weights, &mut scratch)?;
            bindings.input_mut().host_mut()[i] = original;
            let numeric = ((up - down) / (2.0 * f64::from(eps))) as f32;
            let err = relative_error(analytic.host()[i] - PREFILL, numeric);
            report.max_input_error = report.max_input_error.max(err);
        }
        for &tag in &tags {
            let analytic = bindings.tagged_gradient(tag)?.clone();
            for i in 0..analytic.size() {
                let original = bindings.tagged_output(tag)?.host()[i];
                bindings.tagged_mut(tag)?.host_mut()[i] = original + eps;
                let up = loss(layer, &bindings, cfg.train, &weights, &mut scratch)?;
                bindings.tagged_mut(tag)?.host_mut()[i] = original - eps;
                let down = loss(layer, &bindings, cfg.train, &weights, &mut scratch)?;
                bindings.tagged_mut(tag)?.host_mut()[i] = original;
                let numeric = ((up - down) / (2.0 * f64::from(eps))) as f32;
                let err = relative_error(analytic.host()[i] - PREFILL, numeric);
                report.max_input_error = report.max_input_error.max(err);
            }
        }
    }

    if cfg.check_params {
        for i in 0..layer.params().size() {
            let original = layer.params().host()[i];
            layer.params_mut().host_mut()[i] = original + eps;
            let up = loss(layer, &bindings, cfg.train, &weights, &mut scratch)?;
            layer.params_mut().host_mut()[i] = original - eps;
            let down = loss(layer, &bindings, cfg.train, &weights, &mut scratch)?;
            layer.params_mut().host_mut()[i] = original;
            let numeric = ((up - down) / (2.0 * f64::from(eps))) as f32;
            let err = relative_error(params_grad.host()[i], numeric);
            report.max_param_error = report.max_param_error.max(err);
        }
    }

    log::debug!(
        "{} gradient check: input error {:.2e}, param error {:.2e}",
        layer.name(),
        report.max_input_error,
        report.max_param_error
    );
    Ok(report)
}

/// Deterministic pseudo-random input for tests and benches.
pub fn random_tensor(shape: crate::TensorShape, seed: u64) -> Tensor {
    let mut t = Tensor::zeros(shape);
    TensorRng::new(seed).fill_standard_normal(t.host_mut());
    t
}
