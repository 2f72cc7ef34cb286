//! Per-sample normalisation: layer norm and RMS norm.
//!
//! Both reduce over the `k·nr·nc` values of each sample and apply a
//! per-channel gain; layer norm also centres and adds a per-channel bias.
//! Nothing is carried between batches.

use std::fmt;
use std::io::{Read, Write};

use super::NORM_MULTIPLIERS;
use crate::serialize as ser;
use crate::{
    checks, AliasTensor, Layer, LayerError, LayerState, Multipliers, Result, Subnet, Tensor,
    TensorShape,
};

pub const DEFAULT_EPS: f64 = 1e-5;

/// Available per-sample normalisation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// Centred, scaled by the inverse standard deviation, with gain and bias.
    LayerNorm,
    /// Scaled by the inverse root mean square, gain only.
    RmsNorm,
}

impl NormKind {
    fn name(self) -> &'static str {
        match self {
            NormKind::LayerNorm => "layer_norm",
            NormKind::RmsNorm => "rms_norm",
        }
    }

    fn version(self) -> &'static str {
        match self {
            NormKind::LayerNorm => "layer_norm_",
            NormKind::RmsNorm => "rms_norm_",
        }
    }

    fn has_bias(self) -> bool {
        matches!(self, NormKind::LayerNorm)
    }
}

#[derive(Debug, Clone)]
struct NormImpl {
    kind: NormKind,
    eps: f64,
    multipliers: Multipliers,
    params: Tensor,
    gamma: AliasTensor,
    beta: AliasTensor,
    /// Per-sample mean (zero for RMS norm) and inverse deviation from the
    /// last forward.
    means: Tensor,
    invstds: Tensor,
    state: LayerState,
}

impl NormImpl {
    fn new(kind: NormKind, eps: f64) -> Result<Self> {
        if !(eps > 0.0) {
            return Err(LayerError::config(kind.name(), "eps must be > 0"));
        }
        Ok(Self::unchecked(kind, eps))
    }

    fn unchecked(kind: NormKind, eps: f64) -> Self {
        Self {
            kind,
            eps,
            multipliers: NORM_MULTIPLIERS,
            params: Tensor::new(),
            gamma: AliasTensor::default(),
            beta: AliasTensor::default(),
            means: Tensor::new(),
            invstds: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }

    fn setup(&mut self, input: &Tensor) -> Result<()> {
        let name = self.kind.name();
        checks::expect_non_empty(name, input)?;
        let gshape = TensorShape::new(1, input.k(), 1, 1);
        let num_params = gshape.size() * if self.kind.has_bias() { 2 } else { 1 };
        if !self.params.is_empty() {
            if self.gamma.shape() != gshape || self.params.size() != num_params {
                return Err(LayerError::shape(
                    name,
                    format!(
                        "input {} needs {} parameters but {} are already allocated",
                        input.shape(),
                        num_params,
                        self.params.size()
                    ),
                ));
            }
            self.state = LayerState::Ready;
            return Ok(());
        }
        self.gamma = AliasTensor::new(gshape, 0);
        self.beta = if self.kind.has_bias() {
            AliasTensor::new(gshape, gshape.size())
        } else {
            AliasTensor::default()
        };
        self.params.set_size(TensorShape::new(1, 1, 1, num_params));
        self.gamma.view_mut(&mut self.params)?.fill(1.0);
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, input: &Tensor, output: &mut Tensor) -> Result<()> {
        let name = self.kind.name();
        self.state.ensure_ready(name)?;
        checks::expect_k(name, input, self.gamma.shape().k)?;
        let shape = input.shape();
        let len = shape.sample_size();
        let plane = shape.plane_size();
        output.set_size(shape);
        self.means.set_size(TensorShape::new(shape.num_samples, 1, 1, 1));
        self.invstds.set_size(TensorShape::new(shape.num_samples, 1, 1, 1));

        let gamma = self.gamma.view(&self.params)?;
        let beta = if self.kind.has_bias() {
            Some(self.beta.view(&self.params)?)
        } else {
            None
        };
        for n in 0..shape.num_samples {
            let x = input.sample(n);
            let mean = match self.kind {
                NormKind::LayerNorm => x.iter().map(|v| f64::from(*v)).sum::<f64>() / len as f64,
                NormKind::RmsNorm => 0.0,
            };
            let var = x.iter().map(|v| (f64::from(*v) - mean).powi(2)).sum::<f64>() / len as f64;
            let inv = 1.0 / (var + self.eps).sqrt();
            self.means.host_mut()[n] = mean as f32;
            self.invstds.host_mut()[n] = inv as f32;
            let (mean, inv) = (mean as f32, inv as f32);
            for (i, (o, v)) in output.sample_mut(n).iter_mut().zip(x).enumerate() {
                let k = i / plane;
                *o = (v - mean) * inv * gamma.host()[k];
                if let Some(beta) = &beta {
                    *o += beta.host()[k];
                }
            }
        }
        Ok(())
    }

    fn backward(
        &mut self,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        params_grad: &mut Tensor,
    ) -> Result<()> {
        let name = self.kind.name();
        self.state.ensure_ready(name)?;
        let (input, data_grad) = sub.output_and_gradient()?;
        checks::expect_same_shape(name, input, gradient_input)?;
        let shape = input.shape();
        if self.means.size() != shape.num_samples {
            return Err(LayerError::shape(name, "backward called without a matching forward"));
        }
        let len = shape.sample_size() as f32;
        let plane = shape.plane_size();
        let gamma = self.gamma.view(&self.params)?;
        let mut dgamma = vec![0.0f32; shape.k];
        let mut dbeta = vec![0.0f32; shape.k];

        for n in 0..shape.num_samples {
            let (mean, inv) = (self.means.host()[n], self.invstds.host()[n]);
            let x = input.sample(n);
            let dy = gradient_input.sample(n);
            let mut sum_dxhat = 0.0f32;
            let mut sum_dxhat_xhat = 0.0f32;
            for (i, (xv, g)) in x.iter().zip(dy).enumerate() {
                let k = i / plane;
                let xhat = (xv - mean) * inv;
                let dxhat = g * gamma.host()[k];
                sum_dxhat += dxhat;
                sum_dxhat_xhat += dxhat * xhat;
                dgamma[k] += g * xhat;
                dbeta[k] += g;
            }
            let centred = self.kind.has_bias();
            for (i, (dx, (xv, g))) in data_grad
                .sample_mut(n)
                .iter_mut()
                .zip(x.iter().zip(dy))
                .enumerate()
            {
                let k = i / plane;
                let xhat = (xv - mean) * inv;
                let dxhat = g * gamma.host()[k];
                let shift = if centred { sum_dxhat / len } else { 0.0 };
                *dx += inv * (dxhat - shift - xhat * sum_dxhat_xhat / len);
            }
        }

        if self.multipliers.learning_rate != 0.0 {
            checks::expect_params_grad(name, params_grad, &self.params)?;
            self.gamma
                .view_slice_mut(params_grad.host_mut())?
                .copy_from(&dgamma)?;
            if self.kind.has_bias() {
                self.beta
                    .view_slice_mut(params_grad.host_mut())?
                    .copy_from(&dbeta)?;
            }
        }
        Ok(())
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, self.kind.version())?;
        ser::write_tensor(out, &self.params)?;
        ser::write_alias(out, &self.gamma)?;
        if self.kind.has_bias() {
            ser::write_alias(out, &self.beta)?;
            ser::write_tensor(out, &self.means)?;
            ser::write_tensor(out, &self.invstds)?;
        }
        ser::write_multipliers(out, &self.multipliers)?;
        ser::write_f64(out, self.eps)
    }

    fn read_record(kind: NormKind, input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, kind.name(), &[kind.version()])?;
        let params = ser::read_tensor(input)?;
        let gamma = ser::read_alias(input)?;
        let (beta, means, invstds) = if kind.has_bias() {
            (
                ser::read_alias(input)?,
                ser::read_tensor(input)?,
                ser::read_tensor(input)?,
            )
        } else {
            (AliasTensor::default(), Tensor::new(), Tensor::new())
        };
        let multipliers = ser::read_multipliers(input)?;
        let eps = ser::read_f64(input)?;
        let mut loaded = Self::new(kind, eps)?;
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
        loaded.multipliers = multipliers;
        Ok(loaded)
    }

    fn xml(&self) -> String {
        let name = self.kind.name();
        format!(
            "<{name} eps='{}'{}>\n{}</{name}>\n",
            self.eps,
            self.multipliers.xml_attrs(),
            ser::tensor_text(&self.params)
        )
    }
}

macro_rules! sample_norm_layer {
    ($ty:ident, $kind:expr, $reader:ident) => {
        impl $ty {
            pub fn new() -> Self {
                Self {
                    inner: NormImpl::unchecked($kind, DEFAULT_EPS),
                }
            }

            pub fn with_eps(eps: f64) -> Result<Self> {
                Ok(Self {
                    inner: NormImpl::new($kind, eps)?,
                })
            }

            pub fn eps(&self) -> f64 {
                self.inner.eps
            }

            pub fn multipliers(&self) -> &Multipliers {
                &self.inner.multipliers
            }

            pub fn set_multipliers(&mut self, multipliers: Multipliers) {
                self.inner.multipliers = multipliers;
            }

            pub fn gamma(&self) -> Result<Tensor> {
                Ok(self.inner.gamma.view(&self.inner.params)?.to_tensor())
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Layer for $ty {
            fn name(&self) -> &'static str {
                $kind.name()
            }

            fn state(&self) -> LayerState {
                self.inner.state
            }

            fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
                self.inner.setup(sub.output())
            }

            fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
                self.inner.forward(sub.output(), output)
            }

            fn backward(
                &mut self,
                computed_output: &Tensor,
                gradient_input: &Tensor,
                sub: &mut dyn Subnet,
                params_grad: &mut Tensor,
            ) -> Result<()> {
                checks::expect_gradient($kind.name(), gradient_input, computed_output)?;
                self.inner.backward(gradient_input, sub, params_grad)
            }

            fn params(&self) -> &Tensor {
                &self.inner.params
            }

            fn params_mut(&mut self) -> &mut Tensor {
                &mut self.inner.params
            }

            fn serialize(&self, out: &mut dyn Write) -> Result<()> {
                self.inner.serialize(out)
            }

            fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
                self.inner = NormImpl::read_record($kind, input)?;
                Ok(())
            }

            fn to_xml(&self) -> String {
                self.inner.xml()
            }
        }

        pub fn $reader(input: &mut dyn Read) -> Result<$ty> {
            Ok($ty {
                inner: NormImpl::read_record($kind, input)?,
            })
        }
    };
}

/// Layer normalisation with per-channel gain and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    inner: NormImpl,
}

/// Root-mean-square normalisation with a per-channel gain.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    inner: NormImpl,
}

sample_norm_layer!(LayerNorm, NormKind::LayerNorm, read_layer_norm);
sample_norm_layer!(RmsNorm, NormKind::RmsNorm, read_rms_norm);

impl fmt::Display for LayerNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "layer_norm eps={}{}",
            self.inner.eps,
            self.inner.multipliers.summary(true)
        )
    }
}

impl fmt::Display for RmsNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rms_norm (eps={}){}",
            self.inner.eps,
            self.inner.multipliers.summary(true)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients, random_tensor, GradCheck};
    use crate::Bindings;
    use candle_core::{Device, D};
    use std::io::Cursor;

    #[test]
    fn layer_norm_matches_candle_over_each_sample() -> Result<()> {
        let input = random_tensor(TensorShape::new(3, 4, 2, 5), 1);
        let mut ln = LayerNorm::new();
        let bindings = Bindings::new(input.clone());
        ln.setup(&bindings)?;
        let mut out = Tensor::new();
        ln.forward(&bindings, &mut out)?;

        let flat = input.to_candle(&Device::Cpu)?.reshape((3, 40))?;
        let ones = candle_core::Tensor::ones(40, candle_core::DType::F32, &Device::Cpu)?;
        let zeros = candle_core::Tensor::zeros(40, candle_core::DType::F32, &Device::Cpu)?;
        let reference = candle_nn::ops::layer_norm(&flat, &ones, &zeros, 1e-5)?;
        let expected = Tensor::from_candle(&reference.reshape((3, 4, 2, 5))?)?;
        assert!(out.max_abs_diff(&expected) < 1e-4);
        Ok(())
    }

    #[test]
    fn rms_norm_matches_candle_over_each_sample() -> Result<()> {
        let input = random_tensor(TensorShape::new(2, 3, 3, 3), 2);
        let mut rms = RmsNorm::new();
        let bindings = Bindings::new(input.clone());
        rms.setup(&bindings)?;
        let mut out = Tensor::new();
        rms.forward(&bindings, &mut out)?;

        let flat = input.to_candle(&Device::Cpu)?.reshape((2, 27))?;
        let ms = flat.sqr()?.mean_keepdim(D::Minus1)?;
        let reference = flat.broadcast_div(&(ms + 1e-5)?.sqrt()?)?;
        let expected = Tensor::from_candle(&reference.reshape((2, 3, 3, 3))?)?;
        assert!(out.max_abs_diff(&expected) < 1e-4);
        assert_eq!(rms.params().size(), 3);
        Ok(())
    }

    #[test]
    fn gradients_match_finite_differences() -> Result<()> {
        let shape = TensorShape::new(2, 3, 2, 2);
        let report = check_gradients(
            &mut LayerNorm::new(),
            Bindings::new(random_tensor(shape, 3)),
            GradCheck::default(),
        )?;
        assert!(report.passes(2e-2), "layer_norm: {report:?}");
        let report = check_gradients(
            &mut RmsNorm::new(),
            Bindings::new(random_tensor(shape, 4)),
            GradCheck::default(),
        )?;
        assert!(report.passes(2e-2), "rms_norm: {report:?}");
        Ok(())
    }

    #[test]
    fn default_multipliers_skip_gain_decay() {
        let ln = LayerNorm::new();
        assert_eq!(*ln.multipliers(), Multipliers::new(1.0, 0.0, 1.0, 1.0));
        assert!(ln.to_string().starts_with("layer_norm eps=0.00001"));
    }

    #[test]
    fn records_round_trip() -> Result<()> {
        let mut rms = RmsNorm::with_eps(1e-6)?;
        rms.setup(&Bindings::new(random_tensor(TensorShape::new(1, 2, 2, 2), 1)))?;
        let mut buf = Vec::new();
        rms.serialize(&mut buf)?;
        let loaded = read_rms_norm(&mut Cursor::new(&buf))?;
        assert_eq!(loaded.eps(), 1e-6);
        assert_eq!(loaded.params(), rms.params());

        let mut ln = LayerNorm::new();
        assert!(ln.deserialize(&mut Cursor::new(&buf)).is_err());
        assert_eq!(ln.state(), LayerState::Uninitialized);
        Ok(())
    }
}
