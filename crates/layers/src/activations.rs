//! Element-wise nonlinearities.
//!
//! Every activation maps each input value independently and keeps the input
//! shape. [`Relu`] carries a disabled (identity) mode, [`Prelu`] learns a
//! single slope for negative inputs, and the remaining stateless maps share
//! one layer type, [`Activation`], parameterized by [`Nonlinearity`].
//!
//! Backward passes recover the derivative from the computed output where the
//! output alone determines it (ReLU, sigmoid, tanh, clipped ReLU) and from the
//! input otherwise.

use std::fmt;
use std::io::{Read, Write};

use candle_core::Device;

use crate::serialize as ser;
use crate::{checks, Layer, LayerError, LayerState, Result, Subnet, Tensor, TensorShape};

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Parameter-free (or fixed-constant) element-wise maps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Nonlinearity {
    /// `x` for positive inputs, `alpha·x` otherwise.
    LeakyRelu { alpha: f32 },
    Sigmoid,
    /// `x·tanh(softplus(x))`.
    Mish,
    Htan,
    /// ReLU saturating at `ceiling`.
    ClippedRelu { ceiling: f32 },
    /// `x` for positive inputs, `alpha·(eˣ − 1)` otherwise.
    Elu { alpha: f32 },
    /// Exact (erf based) GELU.
    Gelu,
    /// Smooth ReLU: quadratic on `(−beta, beta)`, linear above.
    Smelu { beta: f32 },
    /// `x·sigmoid(x)`.
    Silu,
}

impl Nonlinearity {
    pub const DEFAULT_LEAKY_ALPHA: f32 = 0.01;
    pub const DEFAULT_CEILING: f32 = 6.0;
    pub const DEFAULT_ELU_ALPHA: f32 = 1.0;
    pub const DEFAULT_SMELU_BETA: f32 = 1.0;

    pub fn name(self) -> &'static str {
        match self {
            Nonlinearity::LeakyRelu { .. } => "leaky_relu",
            Nonlinearity::Sigmoid => "sig",
            Nonlinearity::Mish => "mish",
            Nonlinearity::Htan => "htan",
            Nonlinearity::ClippedRelu { .. } => "clipped_relu",
            Nonlinearity::Elu { .. } => "elu",
            Nonlinearity::Gelu => "gelu",
            Nonlinearity::Smelu { .. } => "smelu",
            Nonlinearity::Silu => "silu",
        }
    }

    pub fn version(self) -> &'static str {
        match self {
            Nonlinearity::LeakyRelu { .. } => "leaky_relu_",
            Nonlinearity::Sigmoid => "sig_",
            Nonlinearity::Mish => "mish_",
            Nonlinearity::Htan => "htan_",
            Nonlinearity::ClippedRelu { .. } => "clipped_relu_",
            Nonlinearity::Elu { .. } => "elu_",
            Nonlinearity::Gelu => "gelu_",
            Nonlinearity::Smelu { .. } => "smelu_",
            Nonlinearity::Silu => "silu_",
        }
    }

    /// Record tags of every variant.
    pub const VERSIONS: [&'static str; 9] = [
        "leaky_relu_",
        "sig_",
        "mish_",
        "htan_",
        "clipped_relu_",
        "elu_",
        "gelu_",
        "smelu_",
        "silu_",
    ];

    /// Variant for `version` with its constant still at the default.
    fn from_version(version: &str) -> Option<Self> {
        Some(match version {
            "leaky_relu_" => Nonlinearity::LeakyRelu {
                alpha: Self::DEFAULT_LEAKY_ALPHA,
            },
            "sig_" => Nonlinearity::Sigmoid,
            "mish_" => Nonlinearity::Mish,
            "htan_" => Nonlinearity::Htan,
            "clipped_relu_" => Nonlinearity::ClippedRelu {
                ceiling: Self::DEFAULT_CEILING,
            },
            "elu_" => Nonlinearity::Elu {
                alpha: Self::DEFAULT_ELU_ALPHA,
            },
            "gelu_" => Nonlinearity::Gelu,
            "smelu_" => Nonlinearity::Smelu {
                beta: Self::DEFAULT_SMELU_BETA,
            },
            "silu_" => Nonlinearity::Silu,
            _ => return None,
        })
    }

    /// The single constant a variant carries, if any.
    fn constant(self) -> Option<(&'static str, f32)> {
        match self {
            Nonlinearity::LeakyRelu { alpha } | Nonlinearity::Elu { alpha } => Some(("alpha", alpha)),
            Nonlinearity::ClippedRelu { ceiling } => Some(("ceiling", ceiling)),
            Nonlinearity::Smelu { beta } => Some(("beta", beta)),
            _ => None,
        }
    }

    fn with_constant(self, value: f32) -> Self {
        match self {
            Nonlinearity::LeakyRelu { .. } => Nonlinearity::LeakyRelu { alpha: value },
            Nonlinearity::Elu { .. } => Nonlinearity::Elu { alpha: value },
            Nonlinearity::ClippedRelu { .. } => Nonlinearity::ClippedRelu { ceiling: value },
            Nonlinearity::Smelu { .. } => Nonlinearity::Smelu { beta: value },
            other => other,
        }
    }

    fn validate(self) -> Result<()> {
        match self {
            Nonlinearity::LeakyRelu { alpha } | Nonlinearity::Elu { alpha } if !alpha.is_finite() => {
                Err(LayerError::config(self.name(), "alpha must be finite"))
            }
            Nonlinearity::ClippedRelu { ceiling } if !(ceiling > 0.0) => {
                Err(LayerError::config(self.name(), "ceiling must be > 0"))
            }
            Nonlinearity::Smelu { beta } if !(beta > 0.0) => {
                Err(LayerError::config(self.name(), "beta must be > 0"))
            }
            _ => Ok(()),
        }
    }

    /// Whether the derivative is a function of the computed output alone.
    pub fn derivative_from_output(self) -> bool {
        matches!(
            self,
            Nonlinearity::Sigmoid | Nonlinearity::Htan | Nonlinearity::ClippedRelu { .. }
        )
    }

    fn value(self, x: f32) -> f32 {
        match self {
            Nonlinearity::LeakyRelu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Nonlinearity::Sigmoid => sigmoid(x),
            Nonlinearity::Mish => x * softplus(x).tanh(),
            Nonlinearity::Htan => x.tanh(),
            Nonlinearity::ClippedRelu { ceiling } => x.clamp(0.0, ceiling),
            Nonlinearity::Elu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x.exp_m1()
                }
            }
            Nonlinearity::Smelu { beta } => {
                if x >= beta {
                    x
                } else if x <= -beta {
                    0.0
                } else {
                    (x + beta) * (x + beta) / (4.0 * beta)
                }
            }
            Nonlinearity::Silu => x * sigmoid(x),
            // Computed tensor-wide through candle's erf kernel.
            Nonlinearity::Gelu => x,
        }
    }

    /// `dy/dx` given the input `x` and the output `y`.
    fn derivative(self, x: f32, y: f32) -> f32 {
        match self {
            Nonlinearity::LeakyRelu { alpha } => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Nonlinearity::Sigmoid => y * (1.0 - y),
            Nonlinearity::Mish => {
                let t = softplus(x).tanh();
                t + x * (1.0 - t * t) * sigmoid(x)
            }
            Nonlinearity::Htan => 1.0 - y * y,
            Nonlinearity::ClippedRelu { ceiling } => {
                if y > 0.0 && y < ceiling {
                    1.0
                } else {
                    0.0
                }
            }
            Nonlinearity::Elu { alpha } => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha * x.exp()
                }
            }
            Nonlinearity::Smelu { beta } => {
                if x >= beta {
                    1.0
                } else if x <= -beta {
                    0.0
                } else {
                    (x + beta) / (2.0 * beta)
                }
            }
            Nonlinearity::Silu => {
                let s = sigmoid(x);
                s * (1.0 + x * (1.0 - s))
            }
            // Only the `x·φ(x)` term; the caller adds `Φ(x)`.
            Nonlinearity::Gelu => x * (-0.5 * x * x).exp() / (2.0 * std::f32::consts::PI).sqrt(),
        }
    }
}

/// Standard normal CDF of every element, via candle's `erf`.
fn normal_cdf(input: &Tensor) -> Result<Tensor> {
    let x = input.to_candle(&Device::Cpu)?;
    let cdf = (x.affine(std::f64::consts::FRAC_1_SQRT_2, 0.0)?.erf()? + 1.0)?.affine(0.5, 0.0)?;
    Tensor::from_candle(&cdf)
}

/// Layer applying one [`Nonlinearity`] element by element.
#[derive(Debug, Clone)]
pub struct Activation {
    kind: Nonlinearity,
    params: Tensor,
    state: LayerState,
}

impl Activation {
    pub fn new(kind: Nonlinearity) -> Result<Self> {
        kind.validate()?;
        Ok(Self {
            kind,
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        })
    }

    fn infallible(kind: Nonlinearity) -> Self {
        Self {
            kind,
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }

    pub fn leaky_relu() -> Self {
        Self::infallible(Nonlinearity::LeakyRelu {
            alpha: Nonlinearity::DEFAULT_LEAKY_ALPHA,
        })
    }

    pub fn sig() -> Self {
        Self::infallible(Nonlinearity::Sigmoid)
    }

    pub fn mish() -> Self {
        Self::infallible(Nonlinearity::Mish)
    }

    pub fn htan() -> Self {
        Self::infallible(Nonlinearity::Htan)
    }

    pub fn clipped_relu() -> Self {
        Self::infallible(Nonlinearity::ClippedRelu {
            ceiling: Nonlinearity::DEFAULT_CEILING,
        })
    }

    pub fn elu() -> Self {
        Self::infallible(Nonlinearity::Elu {
            alpha: Nonlinearity::DEFAULT_ELU_ALPHA,
        })
    }

    pub fn gelu() -> Self {
        Self::infallible(Nonlinearity::Gelu)
    }

    pub fn smelu() -> Self {
        Self::infallible(Nonlinearity::Smelu {
            beta: Nonlinearity::DEFAULT_SMELU_BETA,
        })
    }

    pub fn silu() -> Self {
        Self::infallible(Nonlinearity::Silu)
    }

    pub fn kind(&self) -> Nonlinearity {
        self.kind
    }

    fn read_body(version: &str, input: &mut dyn Read) -> Result<Self> {
        let kind = Nonlinearity::from_version(version).ok_or_else(|| LayerError::UnknownVersion {
            layer: "activation",
            found: version.to_string(),
        })?;
        let kind = match kind.constant() {
            Some(_) => kind.with_constant(ser::read_f32(input)?),
            None => kind,
        };
        let mut loaded = Self::new(kind)?;
        loaded.state = LayerState::Ready;
        Ok(loaded)
    }
}

impl Layer for Activation {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(self.kind.name(), sub.output())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(self.kind.name())?;
        let input = sub.output();
        if self.kind == Nonlinearity::Gelu {
            let gelu = input.to_candle(&Device::Cpu)?.gelu_erf()?;
            *output = Tensor::from_candle(&gelu)?;
            return Ok(());
        }
        output.set_size(input.shape());
        let kind = self.kind;
        for (y, x) in output.host_mut().iter_mut().zip(input.host()) {
            *y = kind.value(*x);
        }
        Ok(())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        let name = self.kind.name();
        self.state.ensure_ready(name)?;
        checks::expect_gradient(name, gradient_input, computed_output)?;
        let kind = self.kind;
        let (input, grad) = sub.output_and_gradient()?;
        checks::expect_same_shape(name, input, computed_output)?;
        if kind == Nonlinearity::Gelu {
            let cdf = normal_cdf(input)?;
            for (((dx, g), x), phi) in grad
                .host_mut()
                .iter_mut()
                .zip(gradient_input.host())
                .zip(input.host())
                .zip(cdf.host())
            {
                *dx += g * (phi + kind.derivative(*x, 0.0));
            }
            return Ok(());
        }
        for (((dx, g), x), y) in grad
            .host_mut()
            .iter_mut()
            .zip(gradient_input.host())
            .zip(input.host())
            .zip(computed_output.host())
        {
            *dx += g * kind.derivative(*x, *y);
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
        ser::write_str(out, self.kind.version())?;
        if let Some((_, value)) = self.kind.constant() {
            ser::write_f32(out, value)?;
        }
        Ok(())
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let version = ser::read_version(input, self.kind.name(), &[self.kind.version()])?;
        *self = Self::read_body(&version, input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        match self.kind.constant() {
            Some((field, value)) => format!("<{} {field}='{value}'/>\n", self.kind.name()),
            None => format!("<{}/>\n", self.kind.name()),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind.constant() {
            Some((field, value)) => write!(f, "{}\t ({field}={value})", self.kind.name()),
            None => write!(f, "{}", self.kind.name()),
        }
    }
}

/// Reads any [`Nonlinearity`] record.
pub fn read_activation(input: &mut dyn Read) -> Result<Activation> {
    let version = ser::read_str(input)?;
    Activation::read_body(&version, input)
}

const RELU: &str = "relu";
const RELU_VERSION: &str = "relu_2";
const RELU_LEGACY: &str = "relu_";

/// `max(0, x)`, or the identity while disabled.
#[derive(Debug, Clone, Default)]
pub struct Relu {
    disabled: bool,
    params: Tensor,
    state: LayerState,
}

impl Relu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable(&mut self) {
        self.disabled = true;
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

impl Layer for Relu {
    fn name(&self) -> &'static str {
        RELU
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(RELU, sub.output())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(RELU)?;
        let input = sub.output();
        output.set_size(input.shape());
        for (y, x) in output.host_mut().iter_mut().zip(input.host()) {
            *y = if self.disabled { *x } else { x.max(0.0) };
        }
        Ok(())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(RELU)?;
        checks::expect_gradient(RELU, gradient_input, computed_output)?;
        let grad = sub.gradient_input()?;
        checks::expect_same_shape(RELU, grad, gradient_input)?;
        for ((dx, g), y) in grad
            .host_mut()
            .iter_mut()
            .zip(gradient_input.host())
            .zip(computed_output.host())
        {
            if self.disabled || *y > 0.0 {
                *dx += g;
            }
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
        ser::write_str(out, RELU_VERSION)?;
        ser::write_bool(out, self.disabled)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        *self = read_relu(input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        if self.disabled {
            "<relu disabled='true'/>\n".to_string()
        } else {
            "<relu/>\n".to_string()
        }
    }
}

impl fmt::Display for Relu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relu")?;
        if self.disabled {
            write!(f, "\t (disabled)")?;
        }
        Ok(())
    }
}

pub fn read_relu(input: &mut dyn Read) -> Result<Relu> {
    let version = ser::read_version(input, RELU, &[RELU_VERSION, RELU_LEGACY])?;
    let disabled = if version == RELU_VERSION {
        ser::read_bool(input)?
    } else {
        false
    };
    Ok(Relu {
        disabled,
        params: Tensor::new(),
        state: LayerState::Ready,
    })
}

const PRELU: &str = "prelu";
const PRELU_VERSION: &str = "prelu_";

/// Leaky ReLU whose negative slope is a learned scalar.
#[derive(Debug, Clone)]
pub struct Prelu {
    initial_param_value: f32,
    params: Tensor,
    state: LayerState,
}

impl Default for Prelu {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INITIAL_VALUE)
    }
}

impl Prelu {
    pub const DEFAULT_INITIAL_VALUE: f32 = 0.25;

    pub fn new(initial_param_value: f32) -> Self {
        Self {
            initial_param_value,
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }

    pub fn initial_param_value(&self) -> f32 {
        self.initial_param_value
    }

    /// Current slope, or the initial value before setup.
    pub fn slope(&self) -> f32 {
        self.params.host().first().copied().unwrap_or(self.initial_param_value)
    }
}

impl Layer for Prelu {
    fn name(&self) -> &'static str {
        PRELU
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(PRELU, sub.output())?;
        if self.params.is_empty() {
            self.params = Tensor::filled(TensorShape::new(1, 1, 1, 1), self.initial_param_value);
        }
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(PRELU)?;
        let p = self.slope();
        let input = sub.output();
        output.set_size(input.shape());
        for (y, x) in output.host_mut().iter_mut().zip(input.host()) {
            *y = if *x > 0.0 { *x } else { p * x };
        }
        Ok(())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(PRELU)?;
        checks::expect_gradient(PRELU, gradient_input, computed_output)?;
        checks::expect_params_grad(PRELU, params_grad, &self.params)?;
        let p = self.slope();
        let (input, grad) = sub.output_and_gradient()?;
        checks::expect_same_shape(PRELU, input, gradient_input)?;
        let mut dp = 0.0f64;
        for ((dx, g), x) in grad
            .host_mut()
            .iter_mut()
            .zip(gradient_input.host())
            .zip(input.host())
        {
            if *x > 0.0 {
                *dx += g;
            } else {
                *dx += p * g;
                dp += f64::from(x * g);
            }
        }
        params_grad.host_mut()[0] = dp as f32;
        Ok(())
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, PRELU_VERSION)?;
        ser::write_tensor(out, &self.params)?;
        ser::write_f32(out, self.initial_param_value)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        *self = read_prelu(input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<prelu initial_param_value='{}'>\n{}</prelu>\n",
            self.initial_param_value,
            ser::tensor_text(&self.params)
        )
    }
}

impl fmt::Display for Prelu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prelu\t (initial_param_value={})", self.initial_param_value)
    }
}

pub fn read_prelu(input: &mut dyn Read) -> Result<Prelu> {
    ser::read_version(input, PRELU, &[PRELU_VERSION])?;
    let params = ser::read_tensor(input)?;
    let initial_param_value = ser::read_f32(input)?;
    if params.size() > 1 {
        return Err(LayerError::Malformed(format!(
            "prelu holds {} parameters, expected 1",
            params.size()
        )));
    }
    let state = if params.is_empty() {
        LayerState::Uninitialized
    } else {
        LayerState::Ready
    };
    Ok(Prelu {
        initial_param_value,
        params,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients, random_tensor, GradCheck};
    use crate::Bindings;
    use std::io::Cursor;

    fn run(layer: &mut dyn Layer, input: &Tensor) -> Result<Tensor> {
        let bindings = Bindings::new(input.clone());
        layer.setup(&bindings)?;
        let mut out = Tensor::new();
        layer.forward(&bindings, &mut out)?;
        Ok(out)
    }

    #[test]
    fn matches_candle_references() -> Result<()> {
        let input = random_tensor(TensorShape::new(2, 3, 2, 2), 4);
        let x = input.to_candle(&Device::Cpu)?;
        let cases = [
            (Activation::sig(), candle_nn::ops::sigmoid(&x)?),
            (Activation::htan(), x.tanh()?),
            (Activation::elu(), x.elu(1.0)?),
            (Activation::gelu(), x.gelu_erf()?),
            (Activation::silu(), x.silu()?),
        ];
        for (mut layer, reference) in cases {
            let out = run(&mut layer, &input)?;
            let diff = out.max_abs_diff(&Tensor::from_candle(&reference)?);
            assert!(diff < 1e-5, "{layer}: {diff}");
        }
        Ok(())
    }

    #[test]
    fn piecewise_maps_hit_their_breakpoints() -> Result<()> {
        let input = Tensor::from_vec(TensorShape::new(1, 1, 1, 5), vec![-2.0, -0.5, 0.0, 0.5, 8.0])?;
        let out = run(&mut Activation::leaky_relu(), &input)?;
        assert_eq!(out.host(), &[-0.02, -0.005, 0.0, 0.5, 8.0]);
        let out = run(&mut Activation::clipped_relu(), &input)?;
        assert_eq!(out.host(), &[0.0, 0.0, 0.0, 0.5, 6.0]);
        let out = run(&mut Activation::smelu(), &input)?;
        assert_eq!(out.host(), &[0.0, 0.0625, 0.25, 0.5625, 8.0]);
        Ok(())
    }

    #[test]
    fn mish_of_zero_is_zero_and_tracks_identity_for_large_inputs() -> Result<()> {
        let input = Tensor::from_vec(TensorShape::new(1, 1, 1, 2), vec![0.0, 20.0])?;
        let out = run(&mut Activation::mish(), &input)?;
        assert_eq!(out.host()[0], 0.0);
        assert!((out.host()[1] - 20.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn gradients_match_finite_differences() -> Result<()> {
        let layers = [
            Activation::leaky_relu(),
            Activation::sig(),
            Activation::mish(),
            Activation::htan(),
            Activation::new(Nonlinearity::ClippedRelu { ceiling: 0.8 })?,
            Activation::elu(),
            Activation::gelu(),
            Activation::smelu(),
            Activation::silu(),
        ];
        for mut layer in layers {
            let bindings = Bindings::new(random_tensor(TensorShape::new(2, 2, 2, 3), 11));
            let report = check_gradients(&mut layer, bindings, GradCheck::default())?;
            assert!(report.passes(1e-2), "{layer}: {report:?}");
        }
        Ok(())
    }

    #[test]
    fn disabled_relu_is_the_identity() -> Result<()> {
        let input = random_tensor(TensorShape::new(1, 2, 3, 3), 5);
        let mut relu = Relu::new();
        relu.disable();
        assert_eq!(run(&mut relu, &input)?, input);
        let bindings = Bindings::new(input);
        let report = check_gradients(&mut relu, bindings, GradCheck::default())?;
        assert!(report.passes(1e-3), "{report:?}");
        Ok(())
    }

    #[test]
    fn relu_gradient_is_masked_by_output() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(2, 3, 2, 2), 9));
        let report = check_gradients(&mut Relu::new(), bindings, GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        Ok(())
    }

    #[test]
    fn legacy_relu_record_reads_enabled() -> Result<()> {
        let mut bytes = Vec::new();
        ser::write_str(&mut bytes, "relu_")?;
        let relu = read_relu(&mut Cursor::new(bytes))?;
        assert!(!relu.is_disabled());
        assert_eq!(relu.to_string(), "relu");
        Ok(())
    }

    #[test]
    fn prelu_learns_its_slope() -> Result<()> {
        let mut prelu = Prelu::default();
        let bindings = Bindings::new(random_tensor(TensorShape::new(2, 2, 3, 3), 13));
        let report = check_gradients(&mut prelu, bindings, GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        assert_eq!(prelu.params().host(), &[0.25]);

        let mut bytes = Vec::new();
        prelu.params_mut().host_mut()[0] = 0.1;
        prelu.serialize(&mut bytes)?;
        let loaded = read_prelu(&mut Cursor::new(bytes))?;
        assert_eq!(loaded.slope(), 0.1);
        assert_eq!(loaded.initial_param_value(), 0.25);
        Ok(())
    }

    #[test]
    fn constants_survive_a_round_trip() -> Result<()> {
        let elu = Activation::new(Nonlinearity::Elu { alpha: 0.3 })?;
        let mut bytes = Vec::new();
        elu.serialize(&mut bytes)?;
        let mut target = Activation::elu();
        target.deserialize(&mut Cursor::new(bytes))?;
        assert_eq!(target.kind(), Nonlinearity::Elu { alpha: 0.3 });
        assert_eq!(target.to_string(), "elu\t (alpha=0.3)");
        Ok(())
    }

    #[test]
    fn foreign_record_leaves_activation_untouched() -> Result<()> {
        let mut bytes = Vec::new();
        Activation::silu().serialize(&mut bytes)?;
        let mut target = Activation::mish();
        let err = target.deserialize(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, LayerError::UnknownVersion { .. }));
        assert_eq!(target.kind(), Nonlinearity::Mish);
        Ok(())
    }

    #[test]
    fn invalid_constants_are_rejected() {
        assert!(Activation::new(Nonlinearity::ClippedRelu { ceiling: 0.0 }).is_err());
        assert!(Activation::new(Nonlinearity::Smelu { beta: -1.0 }).is_err());
    }
}
