//! Dropout and its inference-time stand-in, a constant multiply.
//!
//! [`Dropout::forward_train`] samples a fresh keep mask from the layer's seeded
//! generator; [`Dropout::forward`] scales by the keep probability `1 − rate`
//! so that inference sees the expected training activation. A serialized
//! dropout record can be read back as a [`Multiply`] with `value = 1 − rate`.

use std::fmt;
use std::io::{Read, Write};

use crate::rng::{TensorRng, DEFAULT_SEED};
use crate::serialize as ser;
use crate::{checks, Layer, LayerError, LayerState, Result, Subnet, Tensor};

const NAME: &str = "dropout";
const VERSION: &str = "dropout_";
pub const DEFAULT_DROP_RATE: f32 = 0.5;

fn validate_rate(rate: f32) -> Result<()> {
    if (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(LayerError::config(NAME, format!("drop rate {rate} outside [0, 1]")))
    }
}

#[derive(Debug, Clone)]
pub struct Dropout {
    drop_rate: f32,
    /// Keep mask of the last training forward; empty after an inference forward.
    mask: Tensor,
    rng: TensorRng,
    params: Tensor,
    state: LayerState,
}

impl Default for Dropout {
    fn default() -> Self {
        Self {
            drop_rate: DEFAULT_DROP_RATE,
            mask: Tensor::new(),
            rng: TensorRng::new(DEFAULT_SEED),
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }
}

impl Dropout {
    pub fn new(drop_rate: f32) -> Result<Self> {
        validate_rate(drop_rate)?;
        Ok(Self {
            drop_rate,
            ..Self::default()
        })
    }

    /// Reseeds the mask generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = TensorRng::new(seed);
        self
    }

    pub fn drop_rate(&self) -> f32 {
        self.drop_rate
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask
    }
}

impl Layer for Dropout {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(NAME, sub.output())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        let input = sub.output();
        self.mask = Tensor::new();
        output.set_size(input.shape());
        let keep = 1.0 - self.drop_rate;
        for (y, x) in output.host_mut().iter_mut().zip(input.host()) {
            *y = x * keep;
        }
        Ok(())
    }

    fn forward_train(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        let input = sub.output();
        self.mask.set_size(input.shape());
        self.rng.fill_uniform(self.mask.host_mut());
        let rate = self.drop_rate;
        for m in self.mask.host_mut() {
            *m = if *m >= rate { 1.0 } else { 0.0 };
        }
        output.set_size(input.shape());
        for ((y, x), m) in output.host_mut().iter_mut().zip(input.host()).zip(self.mask.host()) {
            *y = x * m;
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
        let grad = sub.gradient_input()?;
        checks::expect_same_shape(NAME, grad, gradient_input)?;
        if self.mask.is_empty() {
            grad.add_scaled(gradient_input, 1.0 - self.drop_rate)?;
        } else {
            checks::expect_same_shape(NAME, &self.mask, gradient_input)?;
            for ((dx, g), m) in grad
                .host_mut()
                .iter_mut()
                .zip(gradient_input.host())
                .zip(self.mask.host())
            {
                *dx += g * m;
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
        ser::write_str(out, VERSION)?;
        ser::write_f32(out, self.drop_rate)?;
        ser::write_tensor(out, &self.mask)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = read_dropout(input)?;
        self.drop_rate = loaded.drop_rate;
        self.mask = loaded.mask;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!("<dropout drop_rate='{}'/>\n", self.drop_rate)
    }
}

impl fmt::Display for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dropout\t (drop_rate={})", self.drop_rate)
    }
}

pub fn read_dropout(input: &mut dyn Read) -> Result<Dropout> {
    ser::read_version(input, NAME, &[VERSION])?;
    let mut loaded = Dropout::new(ser::read_f32(input)?)?;
    loaded.mask = ser::read_tensor(input)?;
    loaded.state = LayerState::Ready;
    Ok(loaded)
}

const MULTIPLY: &str = "multiply";
const MULTIPLY_VERSION: &str = "multiply_";

/// Scales every element by a constant.
#[derive(Debug, Clone)]
pub struct Multiply {
    value: f32,
    params: Tensor,
    state: LayerState,
}

impl Default for Multiply {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl Multiply {
    pub fn new(value: f32) -> Self {
        Self {
            value,
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }

    /// The inference equivalent of `dropout`: scale by its keep probability.
    pub fn from_dropout(dropout: &Dropout) -> Self {
        Self::new(1.0 - dropout.drop_rate())
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

impl Layer for Multiply {
    fn name(&self) -> &'static str {
        MULTIPLY
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(MULTIPLY, sub.output())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(MULTIPLY)?;
        let input = sub.output();
        output.set_size(input.shape());
        for (y, x) in output.host_mut().iter_mut().zip(input.host()) {
            *y = x * self.value;
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
        self.state.ensure_ready(MULTIPLY)?;
        checks::expect_gradient(MULTIPLY, gradient_input, computed_output)?;
        sub.gradient_input()?.add_scaled(gradient_input, self.value)
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, MULTIPLY_VERSION)?;
        ser::write_f32(out, self.value)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        *self = read_multiply(input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!("<multiply val='{}'/>\n", self.value)
    }
}

impl fmt::Display for Multiply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "multiply (val={})", self.value)
    }
}

/// Reads a `multiply` record, or converts a `dropout` one.
pub fn read_multiply(input: &mut dyn Read) -> Result<Multiply> {
    let version = ser::read_version(input, MULTIPLY, &[MULTIPLY_VERSION, VERSION])?;
    let mut loaded = if version == VERSION {
        let rate = ser::read_f32(input)?;
        validate_rate(rate)?;
        ser::read_tensor(input)?;
        log::warn!("{MULTIPLY}: converting a serialized dropout (drop_rate={rate})");
        Multiply::new(1.0 - rate)
    } else {
        Multiply::new(ser::read_f32(input)?)
    };
    loaded.state = LayerState::Ready;
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::random_tensor;
    use crate::{Bindings, TensorShape};
    use std::io::Cursor;

    #[test]
    fn zero_rate_is_the_identity() -> Result<()> {
        let input = random_tensor(TensorShape::new(2, 3, 4, 4), 1);
        let mut dropout = Dropout::new(0.0)?;
        let mut bindings = Bindings::new(input.clone());
        dropout.setup(&bindings)?;
        let mut out = Tensor::new();
        dropout.forward_train(&bindings, &mut out)?;
        assert_eq!(out, input);
        dropout.forward(&bindings, &mut out)?;
        assert_eq!(out, input);

        let upstream = random_tensor(input.shape(), 2);
        dropout.backward(&out, &upstream, &mut bindings, &mut Tensor::new())?;
        assert_eq!(bindings.gradient(), &upstream);
        Ok(())
    }

    #[test]
    fn training_mask_gates_forward_and_backward() -> Result<()> {
        let input = Tensor::filled(TensorShape::new(4, 2, 8, 8), 1.0);
        let mut dropout = Dropout::new(0.3)?.with_seed(17);
        let mut bindings = Bindings::new(input.clone());
        dropout.setup(&bindings)?;
        let mut out = Tensor::new();
        dropout.forward_train(&bindings, &mut out)?;
        assert_eq!(&out, dropout.mask());
        let kept = out.sum() / out.size() as f64;
        assert!((kept - 0.7).abs() < 0.1, "kept fraction {kept}");

        let upstream = Tensor::filled(input.shape(), 2.0);
        dropout.backward(&out, &upstream, &mut bindings, &mut Tensor::new())?;
        for (g, m) in bindings.gradient().host().iter().zip(dropout.mask().host()) {
            assert_eq!(*g, 2.0 * m);
        }
        Ok(())
    }

    #[test]
    fn same_seed_same_mask() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(1, 1, 6, 6), 3));
        let mut masks = Vec::new();
        for _ in 0..2 {
            let mut dropout = Dropout::default().with_seed(5);
            dropout.setup(&bindings)?;
            dropout.forward_train(&bindings, &mut Tensor::new())?;
            masks.push(dropout.mask().clone());
        }
        assert_eq!(masks[0], masks[1]);
        Ok(())
    }

    #[test]
    fn inference_scales_by_keep_probability() -> Result<()> {
        let input = Tensor::filled(TensorShape::new(1, 1, 2, 2), 4.0);
        let mut dropout = Dropout::new(0.25)?;
        let bindings = Bindings::new(input);
        dropout.setup(&bindings)?;
        let mut out = Tensor::new();
        dropout.forward(&bindings, &mut out)?;
        assert!(out.host().iter().all(|v| *v == 3.0));
        Ok(())
    }

    #[test]
    fn rate_outside_unit_interval_is_rejected() {
        assert!(matches!(Dropout::new(1.5), Err(LayerError::Config { .. })));
        assert!(Dropout::new(-0.1).is_err());
    }

    #[test]
    fn dropout_record_reads_back_as_multiply() -> Result<()> {
        let mut bytes = Vec::new();
        Dropout::new(0.2)?.serialize(&mut bytes)?;
        let multiply = read_multiply(&mut Cursor::new(bytes))?;
        assert!((multiply.value() - 0.8).abs() < 1e-6);
        assert_eq!(multiply.state(), LayerState::Ready);
        Ok(())
    }

    #[test]
    fn multiply_accumulates_scaled_gradient() -> Result<()> {
        let input = random_tensor(TensorShape::new(1, 2, 2, 2), 8);
        let mut multiply = Multiply::new(3.0);
        let mut bindings = Bindings::new(input.clone());
        multiply.setup(&bindings)?;
        let mut out = Tensor::new();
        multiply.forward(&bindings, &mut out)?;
        bindings.gradient_input()?.fill(1.0);
        let upstream = Tensor::filled(input.shape(), 1.0);
        multiply.backward(&out, &upstream, &mut bindings, &mut Tensor::new())?;
        assert!(bindings.gradient().host().iter().all(|v| *v == 4.0));
        assert_eq!(multiply.to_string(), "multiply (val=3)");
        Ok(())
    }
}
