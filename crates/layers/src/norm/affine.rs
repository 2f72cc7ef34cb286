//! Frozen scale-and-shift, usually produced by folding a batch norm.
//!
//! The gain and bias are not trainable, so [`Layer::params`] is always
//! empty; they live in a separate buffer that is serialized with the layer.

use std::fmt;
use std::io::{Read, Write};

use super::batch::BatchNorm;
use super::NormMode;
use crate::serialize as ser;
use crate::{checks, AliasTensor, Layer, LayerError, LayerState, Result, Subnet, Tensor, TensorShape};

const NAME: &str = "affine";
const VERSION: &str = "affine_2";
const VERSION_NO_DISABLE: &str = "affine_";

#[derive(Debug, Clone)]
pub struct Affine {
    mode: NormMode,
    disabled: bool,
    values: Tensor,
    gamma: AliasTensor,
    beta: AliasTensor,
    empty: Tensor,
    state: LayerState,
}

impl Affine {
    pub fn new(mode: NormMode) -> Self {
        Self {
            mode,
            disabled: false,
            values: Tensor::new(),
            gamma: AliasTensor::default(),
            beta: AliasTensor::default(),
            empty: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }

    /// Folds a batch norm's gain, bias and running statistics:
    /// `g = γ/√(var+eps)`, `b = β − g·mean`.
    pub fn from_batch_norm(bn: &BatchNorm) -> Result<Self> {
        bn.state().ensure_ready(bn.name())?;
        let gamma = bn.gamma()?;
        let beta = bn.beta()?;
        let (rm, rv) = (bn.running_means(), bn.running_variances());
        if rm.size() != gamma.size() || rv.size() != gamma.size() {
            return Err(LayerError::shape(
                NAME,
                "running statistics do not match the batch norm gains",
            ));
        }
        let gshape = gamma.shape();
        let eps = bn.eps() as f32;
        let mut values = Tensor::zeros(TensorShape::new(1, 1, 1, 2 * gshape.size()));
        let (g, b) = values.host_mut().split_at_mut(gshape.size());
        for i in 0..gshape.size() {
            g[i] = gamma.host()[i] / (rv.host()[i] + eps).sqrt();
            b[i] = beta.host()[i] - g[i] * rm.host()[i];
        }
        Ok(Self {
            mode: bn.mode(),
            disabled: false,
            values,
            gamma: AliasTensor::new(gshape, 0),
            beta: AliasTensor::new(gshape, gshape.size()),
            empty: Tensor::new(),
            state: LayerState::Ready,
        })
    }

    pub fn mode(&self) -> NormMode {
        self.mode
    }

    /// Turns the layer into the identity and releases its values.
    pub fn disable(&mut self) {
        self.values = Tensor::new();
        self.gamma = AliasTensor::default();
        self.beta = AliasTensor::default();
        self.disabled = true;
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn gamma(&self) -> Result<Tensor> {
        Ok(self.gamma.view(&self.values)?.to_tensor())
    }

    pub fn beta(&self) -> Result<Tensor> {
        Ok(self.beta.view(&self.values)?.to_tensor())
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        let version = ser::read_str(input)?;
        match version.as_str() {
            "bn_con2" | "bn_fc2" => {
                log::warn!("{NAME}: folding a serialized {version} record");
                let mode = if version == "bn_con2" {
                    NormMode::Conv
                } else {
                    NormMode::Fc
                };
                Self::from_batch_norm(&BatchNorm::read_fields(mode, input)?)
            }
            VERSION | VERSION_NO_DISABLE => {
                let values = ser::read_tensor(input)?;
                let gamma = ser::read_alias(input)?;
                let beta = ser::read_alias(input)?;
                let mode = NormMode::from_code(ser::read_i64(input)?)?;
                let disabled = if version == VERSION {
                    ser::read_bool(input)?
                } else {
                    false
                };
                Ok(Self {
                    mode,
                    disabled,
                    state: if values.is_empty() && !disabled {
                        LayerState::Uninitialized
                    } else {
                        LayerState::Ready
                    },
                    values,
                    gamma,
                    beta,
                    empty: Tensor::new(),
                })
            }
            _ => Err(LayerError::UnknownVersion {
                layer: NAME,
                found: version,
            }),
        }
    }
}

impl Layer for Affine {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        if self.disabled {
            self.state = LayerState::Ready;
            return Ok(());
        }
        let input = sub.output();
        checks::expect_non_empty(NAME, input)?;
        let gshape = self.mode.group_shape(input.shape());
        if !self.values.is_empty() {
            if self.gamma.shape() != gshape {
                return Err(LayerError::shape(
                    NAME,
                    format!("input {} does not match gains of shape {}", input.shape(), self.gamma.shape()),
                ));
            }
            self.state = LayerState::Ready;
            return Ok(());
        }
        self.gamma = AliasTensor::new(gshape, 0);
        self.beta = AliasTensor::new(gshape, gshape.size());
        self.values.set_size(TensorShape::new(1, 1, 1, 2 * gshape.size()));
        self.gamma.view_mut(&mut self.values)?.fill(1.0);
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        let input = sub.output();
        output.set_size(input.shape());
        if self.disabled {
            output.host_mut().copy_from_slice(input.host());
            return Ok(());
        }
        if self.gamma.shape() != self.mode.group_shape(input.shape()) {
            return Err(LayerError::shape(
                NAME,
                format!("input {} does not match gains of shape {}", input.shape(), self.gamma.shape()),
            ));
        }
        let g = self.gamma.view(&self.values)?;
        let b = self.beta.view(&self.values)?;
        let shape = input.shape();
        for (i, (o, x)) in output.host_mut().iter_mut().zip(input.host()).enumerate() {
            let grp = self.mode.group(shape, i);
            *o = x * g.host()[grp] + b.host()[grp];
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
        self.state.ensure_ready(NAME)?;
        checks::expect_gradient(NAME, gradient_input, computed_output)?;
        let data_grad = sub.gradient_input()?;
        if self.disabled {
            return data_grad.add_assign(gradient_input);
        }
        let g = self.gamma.view(&self.values)?;
        let shape = gradient_input.shape();
        for (i, (dx, dy)) in data_grad
            .host_mut()
            .iter_mut()
            .zip(gradient_input.host())
            .enumerate()
        {
            *dx += dy * g.host()[self.mode.group(shape, i)];
        }
        Ok(())
    }

    fn params(&self) -> &Tensor {
        &self.empty
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.empty
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, VERSION)?;
        ser::write_tensor(out, &self.values)?;
        ser::write_alias(out, &self.gamma)?;
        ser::write_alias(out, &self.beta)?;
        ser::write_i64(out, self.mode.code())?;
        ser::write_bool(out, self.disabled)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        *self = Self::read_record(input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        let tag = match self.mode {
            NormMode::Conv => "affine_con",
            NormMode::Fc => "affine_fc",
        };
        let disabled = if self.disabled { " disabled='true'" } else { "" };
        format!(
            "<{tag}{disabled}>\n{}</{tag}>\n",
            ser::tensor_text(&self.values)
        )
    }
}

impl fmt::Display for Affine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "affine")?;
        if self.disabled {
            write!(f, "\t (disabled)")?;
        }
        Ok(())
    }
}

/// Reads an `affine_2`/`affine_` record, or folds a `bn_con2`/`bn_fc2` one.
pub fn read_affine(input: &mut dyn Read) -> Result<Affine> {
    Affine::read_record(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients, random_tensor, GradCheck};
    use crate::norm::BatchNormOptions;
    use crate::Bindings;
    use std::io::Cursor;

    fn trained_bn(mode: NormMode, bindings: &Bindings) -> Result<BatchNorm> {
        let mut bn = BatchNorm::new(BatchNormOptions::new(mode))?;
        bn.setup(bindings)?;
        let mut out = Tensor::new();
        for _ in 0..3 {
            bn.forward_train(bindings, &mut out)?;
        }
        let params = bn.params_mut().host_mut();
        let half = params.len() / 2;
        for (i, v) in params.iter_mut().enumerate() {
            *v = if i < half { 1.5 + i as f32 * 0.1 } else { -0.25 * i as f32 };
        }
        Ok(bn)
    }

    #[test]
    fn fold_reproduces_batch_norm_inference() -> Result<()> {
        for mode in [NormMode::Conv, NormMode::Fc] {
            let bindings = Bindings::new(random_tensor(TensorShape::new(4, 3, 2, 2), 1));
            let mut bn = trained_bn(mode, &bindings)?;
            let mut expected = Tensor::new();
            bn.forward(&bindings, &mut expected)?;

            let mut affine = Affine::from_batch_norm(&bn)?;
            affine.setup(&bindings)?;
            let mut out = Tensor::new();
            affine.forward(&bindings, &mut out)?;
            assert!(out.max_abs_diff(&expected) < 1e-5, "{mode:?}");
            assert!(affine.params().is_empty());
        }
        Ok(())
    }

    #[test]
    fn batch_norm_record_reads_back_as_affine() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(3, 2, 3, 3), 2));
        let bn = trained_bn(NormMode::Conv, &bindings)?;
        let mut buf = Vec::new();
        bn.serialize(&mut buf)?;

        let mut affine = Affine::new(NormMode::Fc);
        affine.deserialize(&mut Cursor::new(&buf))?;
        assert_eq!(affine.mode(), NormMode::Conv);
        let folded = Affine::from_batch_norm(&bn)?;
        assert_eq!(affine.gamma()?, folded.gamma()?);
        assert_eq!(affine.beta()?, folded.beta()?);
        Ok(())
    }

    #[test]
    fn disabled_mode_is_the_identity() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(2, 2, 2, 2), 3));
        let mut affine = Affine::new(NormMode::Conv);
        affine.disable();
        let report = check_gradients(&mut affine, bindings.clone(), GradCheck::default())?;
        assert!(report.passes(1e-3), "{report:?}");
        let mut out = Tensor::new();
        affine.forward(&bindings, &mut out)?;
        assert_eq!(&out, bindings.input());
        assert_eq!(affine.to_string(), "affine\t (disabled)");

        let mut buf = Vec::new();
        affine.serialize(&mut buf)?;
        assert!(read_affine(&mut Cursor::new(&buf))?.is_disabled());
        Ok(())
    }

    #[test]
    fn input_gradient_scales_by_gain() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(2, 3, 2, 2), 4));
        let bn = trained_bn(NormMode::Fc, &bindings)?;
        let mut affine = Affine::from_batch_norm(&bn)?;
        let report = check_gradients(&mut affine, bindings, GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        Ok(())
    }

    #[test]
    fn unknown_tag_is_rejected() -> Result<()> {
        let mut buf = Vec::new();
        ser::write_str(&mut buf, "relu_2")?;
        let mut affine = Affine::new(NormMode::Conv);
        assert!(matches!(
            affine.deserialize(&mut Cursor::new(&buf)),
            Err(LayerError::UnknownVersion { .. })
        ));
        Ok(())
    }
}
