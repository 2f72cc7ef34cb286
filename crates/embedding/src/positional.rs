//! Fixed sinusoidal positional encodings.

use std::fmt;
use std::io::{Read, Write};

use candle_core::{DType, Device};
use layers::serialize as ser;
use layers::{checks, Layer, LayerState, Result, Subnet, Tensor, TensorShape};

const NAME: &str = "positional_encodings";
const VERSION: &str = "positional_encodings_";
const BASE: f64 = 10_000.0;

/// One `(nr, nc)` plane of `sin(θ)` in even columns and `cos(θ)` in odd
/// ones, with `θ = r / 10000^(c / nc)`.
pub fn encoding_plane(nr: usize, nc: usize) -> Result<Vec<f32>> {
    if nr == 0 || nc == 0 {
        return Ok(Vec::new());
    }
    let device = Device::Cpu;
    let positions = candle_core::Tensor::arange(0u32, nr as u32, &device)?
        .to_dtype(DType::F32)?
        .reshape((nr, 1))?;
    let inv_freq = candle_core::Tensor::arange(0u32, nc as u32, &device)?
        .to_dtype(DType::F32)?
        .affine(-BASE.ln() / nc as f64, 0.0)?
        .exp()?
        .reshape((1, nc))?;
    let theta = positions.broadcast_mul(&inv_freq)?;
    let sin = theta.sin()?.flatten_all()?.to_vec1::<f32>()?;
    let cos = theta.cos()?.flatten_all()?.to_vec1::<f32>()?;
    Ok(sin
        .into_iter()
        .zip(cos)
        .enumerate()
        .map(|(i, (s, c))| if (i % nc) % 2 == 0 { s } else { c })
        .collect())
}

/// Adds a non-trainable sin/cos tensor keyed to row (sequence position) and
/// column (embedding index). The tensor is rebuilt on every shape change.
#[derive(Debug, Clone)]
pub struct PositionalEncodings {
    sequence_dim: usize,
    embedding_dim: usize,
    pe: Tensor,
    params: Tensor,
    state: LayerState,
}

impl Default for PositionalEncodings {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionalEncodings {
    pub fn new() -> Self {
        Self {
            sequence_dim: 1,
            embedding_dim: 1,
            pe: Tensor::new(),
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }

    pub fn sequence_dim(&self) -> usize {
        self.sequence_dim
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn encodings(&self) -> &Tensor {
        &self.pe
    }

    fn rebuild(&mut self, shape: TensorShape) -> Result<()> {
        log::debug!("positional_encodings: regenerating for {shape}");
        let plane = encoding_plane(shape.nr, shape.nc)?;
        let mut data = Vec::with_capacity(shape.size());
        for _ in 0..shape.num_samples * shape.k {
            data.extend_from_slice(&plane);
        }
        self.pe = Tensor::from_vec(shape, data)?;
        self.sequence_dim = shape.nr;
        self.embedding_dim = shape.nc;
        Ok(())
    }
}

impl Layer for PositionalEncodings {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(NAME, sub.output())?;
        self.rebuild(sub.output().shape())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        let input = sub.output();
        if !self.pe.same_dims(input) {
            self.rebuild(input.shape())?;
        }
        output.set_size(input.shape());
        for ((o, x), p) in output
            .host_mut()
            .iter_mut()
            .zip(input.host())
            .zip(self.pe.host())
        {
            *o = x + p;
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
        sub.gradient_input()?.add_assign(gradient_input)
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, VERSION)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        *self = read_positional_encodings(input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        "<positional_encodings/>\n".to_string()
    }
}

impl fmt::Display for PositionalEncodings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "positional_encodings (seq_len={}, d_model={})",
            self.sequence_dim, self.embedding_dim
        )
    }
}

pub fn read_positional_encodings(input: &mut dyn Read) -> Result<PositionalEncodings> {
    ser::read_version(input, NAME, &[VERSION])?;
    Ok(PositionalEncodings::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use layers::gradcheck::{check_gradients, random_tensor, GradCheck};
    use layers::Bindings;

    #[test]
    fn plane_follows_the_closed_form() -> Result<()> {
        let (nr, nc) = (5, 6);
        let plane = encoding_plane(nr, nc)?;
        for r in 0..nr {
            for c in 0..nc {
                let theta = r as f64 / BASE.powf(c as f64 / nc as f64);
                let expected = if c % 2 == 0 { theta.sin() } else { theta.cos() };
                assert!((f64::from(plane[r * nc + c]) - expected).abs() < 1e-4, "({r},{c})");
            }
        }
        Ok(())
    }

    #[test]
    fn encodings_are_added_per_plane() -> Result<()> {
        let b = Bindings::new(Tensor::zeros(TensorShape::new(2, 3, 4, 4)));
        let mut pe = PositionalEncodings::new();
        pe.setup(&b)?;
        let mut out = Tensor::new();
        pe.forward(&b, &mut out)?;
        let plane = encoding_plane(4, 4)?;
        for sample in 0..2 {
            for chunk in out.sample(sample).chunks(16) {
                assert_eq!(chunk, plane.as_slice());
            }
        }
        assert_eq!((pe.sequence_dim(), pe.embedding_dim()), (4, 4));
        Ok(())
    }

    #[test]
    fn shape_change_regenerates() -> Result<()> {
        let mut pe = PositionalEncodings::new();
        pe.setup(&Bindings::new(Tensor::zeros(TensorShape::new(1, 1, 2, 2))))?;
        let b = Bindings::new(Tensor::zeros(TensorShape::new(1, 1, 7, 3)));
        let mut out = Tensor::new();
        pe.forward(&b, &mut out)?;
        assert_eq!(pe.encodings().shape(), TensorShape::new(1, 1, 7, 3));
        assert_eq!(pe.to_string(), "positional_encodings (seq_len=7, d_model=3)");
        Ok(())
    }

    #[test]
    fn gradient_passes_through() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(2, 1, 3, 4), 4));
        let report = check_gradients(&mut PositionalEncodings::new(), bindings, GradCheck::default())?;
        assert!(report.passes(1e-3), "{report:?}");
        Ok(())
    }
}
