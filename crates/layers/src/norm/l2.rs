//! Scales every sample to unit L2 norm: `y = x / √(Σx² + eps)`.

use std::fmt;
use std::io::{Read, Write};

use crate::serialize as ser;
use crate::{checks, Layer, LayerError, LayerState, Result, Subnet, Tensor};

const NAME: &str = "l2normalize";
const VERSION: &str = "l2normalize_";
pub const DEFAULT_EPS: f64 = 1e-5;

#[derive(Debug, Clone)]
pub struct L2Normalize {
    eps: f64,
    inv_norms: Vec<f32>,
    params: Tensor,
    state: LayerState,
}

impl Default for L2Normalize {
    fn default() -> Self {
        Self {
            eps: DEFAULT_EPS,
            inv_norms: Vec::new(),
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }
}

impl L2Normalize {
    pub fn new(eps: f64) -> Result<Self> {
        if !(eps > 0.0) {
            return Err(LayerError::config(NAME, "eps must be > 0"));
        }
        Ok(Self {
            eps,
            ..Self::default()
        })
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }
}

impl Layer for L2Normalize {
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
        output.set_size(input.shape());
        self.inv_norms.clear();
        for n in 0..input.num_samples() {
            let x = input.sample(n);
            let sq: f64 = x.iter().map(|v| f64::from(*v) * f64::from(*v)).sum();
            let inv = (1.0 / (sq + self.eps).sqrt()) as f32;
            self.inv_norms.push(inv);
            for (o, v) in output.sample_mut(n).iter_mut().zip(x) {
                *o = v * inv;
            }
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
        if self.inv_norms.len() != computed_output.num_samples() {
            return Err(LayerError::shape(NAME, "backward called without a matching forward"));
        }
        let grad = sub.gradient_input()?;
        checks::expect_same_shape(NAME, grad, gradient_input)?;
        for n in 0..gradient_input.num_samples() {
            let y = computed_output.sample(n);
            let g = gradient_input.sample(n);
            let dot: f32 = y.iter().zip(g).map(|(a, b)| a * b).sum();
            let inv = self.inv_norms[n];
            for (dx, (yv, gv)) in grad.sample_mut(n).iter_mut().zip(y.iter().zip(g)) {
                *dx += inv * (gv - yv * dot);
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
        ser::write_f64(out, self.eps)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        *self = read_l2normalize(input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!("<l2normalize eps='{}'/>\n", self.eps)
    }
}

impl fmt::Display for L2Normalize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l2normalize eps={}", self.eps)
    }
}

pub fn read_l2normalize(input: &mut dyn Read) -> Result<L2Normalize> {
    ser::read_version(input, NAME, &[VERSION])?;
    let mut loaded = L2Normalize::new(ser::read_f64(input)?)?;
    loaded.state = LayerState::Ready;
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients, random_tensor, GradCheck};
    use crate::{Bindings, TensorShape};

    #[test]
    fn samples_come_out_with_unit_norm() -> Result<()> {
        let mut l2 = L2Normalize::default();
        let bindings = Bindings::new(random_tensor(TensorShape::new(3, 4, 2, 2), 1));
        l2.setup(&bindings)?;
        let mut out = Tensor::new();
        l2.forward(&bindings, &mut out)?;
        for n in 0..3 {
            let norm: f32 = out.sample(n).iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn gradients_match_finite_differences() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(2, 3, 1, 2), 2));
        let report = check_gradients(&mut L2Normalize::default(), bindings, GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        Ok(())
    }
}
