//! Space-to-depth reorganization.
//!
//! Output `(n, k·sy·sx, nr/sy, nc/sx)`. Output channel `k` reads input
//! channel `k mod K` at the sub-pixel `(dy, dx)` given by `k div K`, laid out
//! row-major over the `sy × sx` block.

use std::fmt;
use std::io::{Read, Write};

use crate::serialize::{self as ser, check_field};
use crate::{checks, DPoint, Layer, LayerError, LayerState, Result, Subnet, Tensor, TensorShape};

const NAME: &str = "reorg";
const VERSION: &str = "reorg_";

#[derive(Debug, Clone)]
pub struct Reorg {
    row_stride: usize,
    col_stride: usize,
    params: Tensor,
    state: LayerState,
}

impl Default for Reorg {
    fn default() -> Self {
        Self {
            row_stride: 2,
            col_stride: 2,
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }
}

impl Reorg {
    pub fn new(row_stride: usize, col_stride: usize) -> Result<Self> {
        checks::expect_positive(NAME, "row_stride", row_stride)?;
        checks::expect_positive(NAME, "col_stride", col_stride)?;
        Ok(Self {
            row_stride,
            col_stride,
            ..Self::default()
        })
    }

    pub fn strides(&self) -> (usize, usize) {
        (self.row_stride, self.col_stride)
    }

    fn check_input(&self, input: &Tensor) -> Result<()> {
        if input.nr() % self.row_stride != 0 || input.nc() % self.col_stride != 0 {
            return Err(LayerError::shape(
                NAME,
                format!(
                    "input {} is not divisible by strides ({}, {})",
                    input.shape(),
                    self.row_stride,
                    self.col_stride
                ),
            ));
        }
        Ok(())
    }

    /// Calls `f(out_index, in_index)` for every output element.
    fn for_each_pair(&self, input: TensorShape, mut f: impl FnMut(usize, usize)) {
        let (rs, cs) = (self.row_stride, self.col_stride);
        let (onr, onc) = (input.nr / rs, input.nc / cs);
        let ok = input.k * rs * cs;
        let mut out_idx = 0;
        for n in 0..input.num_samples {
            for k in 0..ok {
                let in_k = k % input.k;
                let block = k / input.k;
                let (dy, dx) = (block / cs, block % cs);
                for r in 0..onr {
                    for c in 0..onc {
                        let in_r = r * rs + dy;
                        let in_c = c * cs + dx;
                        let in_idx = ((n * input.k + in_k) * input.nr + in_r) * input.nc + in_c;
                        f(out_idx, in_idx);
                        out_idx += 1;
                    }
                }
            }
        }
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, NAME, &[VERSION])?;
        let row_stride = ser::read_usize(input)?;
        let col_stride = ser::read_usize(input)?;
        let mut loaded = Self::new(row_stride, col_stride)?;
        loaded.state = LayerState::Ready;
        Ok(loaded)
    }
}

impl Layer for Reorg {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        self.check_input(sub.output())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        let input = sub.output();
        self.check_input(input)?;
        let s = input.shape();
        output.set_size(TensorShape::new(
            s.num_samples,
            s.k * self.row_stride * self.col_stride,
            s.nr / self.row_stride,
            s.nc / self.col_stride,
        ));
        let src = input.host();
        let dst = output.host_mut();
        self.for_each_pair(s, |o, i| dst[o] = src[i]);
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
        let shape = grad.shape();
        let g = gradient_input.host();
        let dst = grad.host_mut();
        self.for_each_pair(shape, |o, i| dst[i] += g[o]);
        Ok(())
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn map_input_to_output(&self, p: DPoint) -> DPoint {
        DPoint::new(p.x / self.col_stride as f64, p.y / self.row_stride as f64)
    }

    fn map_output_to_input(&self, p: DPoint) -> DPoint {
        DPoint::new(p.x * self.col_stride as f64, p.y * self.row_stride as f64)
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, VERSION)?;
        ser::write_usize(out, self.row_stride)?;
        ser::write_usize(out, self.col_stride)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(input)?;
        check_field(NAME, "row_stride", self.row_stride, loaded.row_stride)?;
        check_field(NAME, "col_stride", self.col_stride, loaded.col_stride)?;
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<reorg row_stride='{}' col_stride='{}'/>\n",
            self.row_stride, self.col_stride
        )
    }
}

impl fmt::Display for Reorg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reorg\t (row_stride={}, col_stride={})",
            self.row_stride, self.col_stride
        )
    }
}

pub fn read_reorg(input: &mut dyn Read) -> Result<Reorg> {
    Reorg::read_record(input)
}
