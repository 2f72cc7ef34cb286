//! Shape-changing views: `reshape_to` and `flatten`.
//!
//! `reshape_to` decides at setup whether it reinterprets the elements (equal
//! per-sample count) or bilinearly resamples each plane (same `k`, different
//! spatial extent). Any other combination is rejected.

use std::fmt;
use std::io::{Read, Write};

use crate::backend;
use crate::serialize::{self as ser, check_field};
use crate::{checks, DPoint, Layer, LayerError, LayerState, Result, Subnet, Tensor, TensorShape};

const RESHAPE: &str = "reshape_to";
const RESHAPE_VERSION: &str = "reshape_to_";
const FLATTEN: &str = "flatten";
const FLATTEN_VERSION: &str = "flatten_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReshapeMode {
    Reinterpret,
    Resample,
}

/// Target `(k, nr, nc)`; `None` keeps the input's extent along that axis.
#[derive(Debug, Clone)]
pub struct ReshapeTo {
    k: Option<usize>,
    nr: Option<usize>,
    nc: Option<usize>,
    mode: ReshapeMode,
    input_dims: (usize, usize),
    params: Tensor,
    state: LayerState,
}

fn encode_dim(dim: Option<usize>) -> i64 {
    dim.map_or(-1, |d| d as i64)
}

fn decode_dim(raw: i64) -> Result<Option<usize>> {
    match raw {
        -1 => Ok(None),
        d if d > 0 => Ok(Some(d as usize)),
        other => Err(LayerError::Malformed(format!("invalid reshape extent {other}"))),
    }
}

impl ReshapeTo {
    pub fn new(k: Option<usize>, nr: Option<usize>, nc: Option<usize>) -> Result<Self> {
        for (value, field) in [(k, "k"), (nr, "nr"), (nc, "nc")] {
            if let Some(v) = value {
                checks::expect_positive(RESHAPE, field, v)?;
            }
        }
        Ok(Self {
            k,
            nr,
            nc,
            mode: ReshapeMode::Reinterpret,
            input_dims: (0, 0),
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        })
    }

    fn target(&self, input: TensorShape) -> TensorShape {
        TensorShape::new(
            input.num_samples,
            self.k.unwrap_or(input.k),
            self.nr.unwrap_or(input.nr),
            self.nc.unwrap_or(input.nc),
        )
    }

    /// `true` when the last setup chose bilinear resampling.
    pub fn resamples(&self) -> bool {
        self.mode == ReshapeMode::Resample
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, RESHAPE, &[RESHAPE_VERSION])?;
        let k = decode_dim(ser::read_i64(input)?)?;
        let nr = decode_dim(ser::read_i64(input)?)?;
        let nc = decode_dim(ser::read_i64(input)?)?;
        let resample = ser::read_bool(input)?;
        let input_dims = (ser::read_usize(input)?, ser::read_usize(input)?);
        let mut loaded = Self::new(k, nr, nc)?;
        loaded.mode = if resample {
            ReshapeMode::Resample
        } else {
            ReshapeMode::Reinterpret
        };
        loaded.input_dims = input_dims;
        loaded.state = LayerState::Ready;
        Ok(loaded)
    }
}

impl Layer for ReshapeTo {
    fn name(&self) -> &'static str {
        RESHAPE
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        let input = sub.output().shape();
        let target = self.target(input);
        self.mode = if target.sample_size() == input.sample_size() {
            ReshapeMode::Reinterpret
        } else if target.k == input.k {
            ReshapeMode::Resample
        } else {
            return Err(LayerError::shape(
                RESHAPE,
                format!(
                    "cannot reshape {} into {}: element counts differ and k changes",
                    input, target
                ),
            ));
        };
        self.input_dims = (input.nr, input.nc);
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(RESHAPE)?;
        let input = sub.output();
        let target = self.target(input.shape());
        output.set_size(target);
        match self.mode {
            ReshapeMode::Reinterpret => {
                checks::expect_sample_size(RESHAPE, input, target.sample_size())?;
                output.host_mut().copy_from_slice(input.host());
                Ok(())
            }
            ReshapeMode::Resample => backend::resize_bilinear(output, input),
        }
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(RESHAPE)?;
        checks::expect_gradient(RESHAPE, gradient_input, computed_output)?;
        let grad = sub.gradient_input()?;
        match self.mode {
            ReshapeMode::Reinterpret => {
                checks::expect_sample_size(RESHAPE, grad, gradient_input.shape().sample_size())?;
                for (g, d) in grad.host_mut().iter_mut().zip(gradient_input.host()) {
                    *g += d;
                }
                Ok(())
            }
            ReshapeMode::Resample => backend::resize_bilinear_gradient(grad, gradient_input),
        }
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn map_input_to_output(&self, p: DPoint) -> DPoint {
        let (inr, inc) = self.input_dims;
        if inr == 0 || inc == 0 {
            return p;
        }
        let sy = self.nr.unwrap_or(inr) as f64 / inr as f64;
        let sx = self.nc.unwrap_or(inc) as f64 / inc as f64;
        DPoint::new(p.x * sx, p.y * sy)
    }

    fn map_output_to_input(&self, p: DPoint) -> DPoint {
        let (inr, inc) = self.input_dims;
        if inr == 0 || inc == 0 {
            return p;
        }
        let sy = self.nr.unwrap_or(inr) as f64 / inr as f64;
        let sx = self.nc.unwrap_or(inc) as f64 / inc as f64;
        DPoint::new(p.x / sx, p.y / sy)
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, RESHAPE_VERSION)?;
        ser::write_i64(out, encode_dim(self.k))?;
        ser::write_i64(out, encode_dim(self.nr))?;
        ser::write_i64(out, encode_dim(self.nc))?;
        ser::write_bool(out, self.resamples())?;
        ser::write_usize(out, self.input_dims.0)?;
        ser::write_usize(out, self.input_dims.1)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(input)?;
        check_field(RESHAPE, "k", encode_dim(self.k), encode_dim(loaded.k))?;
        check_field(RESHAPE, "nr", encode_dim(self.nr), encode_dim(loaded.nr))?;
        check_field(RESHAPE, "nc", encode_dim(self.nc), encode_dim(loaded.nc))?;
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<reshape_to k='{}' nr='{}' nc='{}'/>\n",
            encode_dim(self.k),
            encode_dim(self.nr),
            encode_dim(self.nc)
        )
    }
}

impl fmt::Display for ReshapeTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reshape_to (k={}, nr={}, nc={})",
            encode_dim(self.k),
            encode_dim(self.nr),
            encode_dim(self.nc)
        )?;
        if self.resamples() {
            write!(f, " resample")?;
        }
        Ok(())
    }
}

pub fn read_reshape_to(input: &mut dyn Read) -> Result<ReshapeTo> {
    ReshapeTo::read_record(input)
}

/// Collapses each sample to `(k·nr·nc, 1, 1)`.
#[derive(Debug, Clone, Default)]
pub struct Flatten {
    params: Tensor,
    state: LayerState,
}

impl Flatten {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Flatten {
    fn name(&self) -> &'static str {
        FLATTEN
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(FLATTEN, sub.output())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(FLATTEN)?;
        let input = sub.output();
        output.set_size(TensorShape::new(
            input.num_samples(),
            input.shape().sample_size(),
            1,
            1,
        ));
        output.host_mut().copy_from_slice(input.host());
        Ok(())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(FLATTEN)?;
        checks::expect_gradient(FLATTEN, gradient_input, computed_output)?;
        let grad = sub.gradient_input()?;
        checks::expect_sample_size(FLATTEN, grad, gradient_input.k())?;
        for (g, d) in grad.host_mut().iter_mut().zip(gradient_input.host()) {
            *g += d;
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
        ser::write_str(out, FLATTEN_VERSION)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        *self = read_flatten(input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        "<flatten/>\n".to_string()
    }
}

impl fmt::Display for Flatten {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flatten")
    }
}

pub fn read_flatten(input: &mut dyn Read) -> Result<Flatten> {
    ser::read_version(input, FLATTEN, &[FLATTEN_VERSION])?;
    Ok(Flatten {
        params: Tensor::new(),
        state: LayerState::Ready,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients, random_tensor, GradCheck};
    use crate::Bindings;
    use std::io::Cursor;

    #[test]
    fn equal_counts_reinterpret_bit_exactly() -> Result<()> {
        let mut reshape = ReshapeTo::new(Some(2), Some(6), None)?;
        let bindings = Bindings::new(random_tensor(TensorShape::new(2, 3, 4, 1), 1));
        reshape.setup(&bindings)?;
        assert!(!reshape.resamples());
        let mut out = Tensor::new();
        reshape.forward(&bindings, &mut out)?;
        assert_eq!(out.shape(), TensorShape::new(2, 2, 6, 1));
        assert_eq!(out.host(), bindings.input().host());
        Ok(())
    }

    #[test]
    fn spatial_change_with_same_k_resamples() -> Result<()> {
        let mut reshape = ReshapeTo::new(None, Some(8), Some(8))?;
        let bindings = Bindings::new(random_tensor(TensorShape::new(1, 3, 4, 4), 2));
        reshape.setup(&bindings)?;
        assert!(reshape.resamples());
        let p = reshape.map_input_to_output(DPoint::new(1.0, 3.0));
        assert_eq!(p, DPoint::new(2.0, 6.0));
        let report = check_gradients(&mut reshape, bindings, GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        Ok(())
    }

    #[test]
    fn incompatible_target_is_rejected() -> Result<()> {
        let mut reshape = ReshapeTo::new(Some(5), Some(3), Some(3))?;
        let bindings = Bindings::new(random_tensor(TensorShape::new(1, 2, 4, 4), 3));
        assert!(matches!(reshape.setup(&bindings), Err(LayerError::Shape { .. })));
        Ok(())
    }

    #[test]
    fn flatten_gradient_flows_back() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(3, 2, 2, 3), 4));
        let report = check_gradients(&mut Flatten::new(), bindings, GradCheck::default())?;
        assert!(report.passes(1e-3), "{report:?}");
        Ok(())
    }

    #[test]
    fn reshape_record_round_trips() -> Result<()> {
        let mut reshape = ReshapeTo::new(None, Some(2), Some(8))?;
        reshape.setup(&Bindings::new(random_tensor(TensorShape::new(1, 1, 4, 4), 1)))?;
        let mut buf = Vec::new();
        reshape.serialize(&mut buf)?;
        let mut fresh = ReshapeTo::new(None, Some(2), Some(8))?;
        fresh.deserialize(&mut Cursor::new(&buf))?;
        assert_eq!(fresh.to_string(), "reshape_to (k=-1, nr=2, nc=8)");
        let mut other = ReshapeTo::new(Some(1), Some(2), Some(8))?;
        assert!(other.deserialize(&mut Cursor::new(&buf)).is_err());
        Ok(())
    }
}
