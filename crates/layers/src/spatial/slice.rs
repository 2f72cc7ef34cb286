//! Sub-tensor views: a 3-D block (`slice`) or a flat per-sample range
//! (`extract`). Backward scatters the gradient into the matching region of
//! the input gradient and leaves the rest alone.

use std::fmt;
use std::io::{Read, Write};

use crate::serialize::{self as ser, check_field};
use crate::{checks, Layer, LayerError, LayerState, Result, Subnet, Tensor, TensorShape};

const SLICE: &str = "slice";
const SLICE_VERSION: &str = "slice_";
const EXTRACT: &str = "extract";
const EXTRACT_VERSION: &str = "extract_";

/// Copies the block starting at `(offset_k, offset_nr, offset_nc)` with
/// extent `(k, nr, nc)` out of every sample.
#[derive(Debug, Clone)]
pub struct Slice {
    offset_k: usize,
    offset_nr: usize,
    offset_nc: usize,
    k: usize,
    nr: usize,
    nc: usize,
    params: Tensor,
    state: LayerState,
}

impl Slice {
    pub fn new(
        offset: (usize, usize, usize),
        k: usize,
        nr: usize,
        nc: usize,
    ) -> Result<Self> {
        checks::expect_positive(SLICE, "k", k)?;
        checks::expect_positive(SLICE, "nr", nr)?;
        checks::expect_positive(SLICE, "nc", nc)?;
        Ok(Self {
            offset_k: offset.0,
            offset_nr: offset.1,
            offset_nc: offset.2,
            k,
            nr,
            nc,
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        })
    }

    fn check_input(&self, input: &Tensor) -> Result<()> {
        if self.offset_k + self.k > input.k()
            || self.offset_nr + self.nr > input.nr()
            || self.offset_nc + self.nc > input.nc()
        {
            return Err(LayerError::shape(
                SLICE,
                format!(
                    "block ({}, {}, {})+({}, {}, {}) exceeds input {}",
                    self.offset_k,
                    self.offset_nr,
                    self.offset_nc,
                    self.k,
                    self.nr,
                    self.nc,
                    input.shape()
                ),
            ));
        }
        Ok(())
    }

    /// Calls `f(out_row_start, in_row_start)` once per copied row of `nc` values.
    fn for_each_row(&self, input: TensorShape, mut f: impl FnMut(usize, usize)) {
        let mut out = 0;
        for n in 0..input.num_samples {
            for k in 0..self.k {
                for r in 0..self.nr {
                    let in_idx = ((n * input.k + self.offset_k + k) * input.nr + self.offset_nr + r)
                        * input.nc
                        + self.offset_nc;
                    f(out, in_idx);
                    out += self.nc;
                }
            }
        }
    }

    fn fields(&self) -> [usize; 6] {
        [self.offset_k, self.offset_nr, self.offset_nc, self.k, self.nr, self.nc]
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, SLICE, &[SLICE_VERSION])?;
        let mut f = [0usize; 6];
        for v in f.iter_mut() {
            *v = ser::read_usize(input)?;
        }
        let mut loaded = Self::new((f[0], f[1], f[2]), f[3], f[4], f[5])?;
        loaded.state = LayerState::Ready;
        Ok(loaded)
    }
}

impl Layer for Slice {
    fn name(&self) -> &'static str {
        SLICE
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
        self.state.ensure_ready(SLICE)?;
        let input = sub.output();
        self.check_input(input)?;
        output.set_size(TensorShape::new(input.num_samples(), self.k, self.nr, self.nc));
        let nc = self.nc;
        let src = input.host();
        let dst = output.host_mut();
        self.for_each_row(input.shape(), |o, i| {
            dst[o..o + nc].copy_from_slice(&src[i..i + nc]);
        });
        Ok(())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(SLICE)?;
        checks::expect_gradient(SLICE, gradient_input, computed_output)?;
        let grad = sub.gradient_input()?;
        self.check_input(grad)?;
        let nc = self.nc;
        let shape = grad.shape();
        let g = gradient_input.host();
        let dst = grad.host_mut();
        self.for_each_row(shape, |o, i| {
            for (d, v) in dst[i..i + nc].iter_mut().zip(&g[o..o + nc]) {
                *d += v;
            }
        });
        Ok(())
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, SLICE_VERSION)?;
        for v in self.fields() {
            ser::write_usize(out, v)?;
        }
        Ok(())
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(input)?;
        let names = ["offset_k", "offset_nr", "offset_nc", "k", "nr", "nc"];
        for ((name, mine), theirs) in names.into_iter().zip(self.fields()).zip(loaded.fields()) {
            check_field(SLICE, name, mine, theirs)?;
        }
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<slice offset_k='{}' offset_nr='{}' offset_nc='{}' k='{}' nr='{}' nc='{}'/>\n",
            self.offset_k, self.offset_nr, self.offset_nc, self.k, self.nr, self.nc
        )
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slice\t (offset_k={}, offset_nr={}, offset_nc={}, k={}, nr={}, nc={})",
            self.offset_k, self.offset_nr, self.offset_nc, self.k, self.nr, self.nc
        )
    }
}

pub fn read_slice(input: &mut dyn Read) -> Result<Slice> {
    Slice::read_record(input)
}

/// Copies the flat range `[offset, offset + k·nr·nc)` of every sample and
/// views it as `(k, nr, nc)`.
#[derive(Debug, Clone)]
pub struct Extract {
    offset: usize,
    k: usize,
    nr: usize,
    nc: usize,
    params: Tensor,
    state: LayerState,
}

impl Extract {
    pub fn new(offset: usize, k: usize, nr: usize, nc: usize) -> Result<Self> {
        checks::expect_positive(EXTRACT, "k", k)?;
        checks::expect_positive(EXTRACT, "nr", nr)?;
        checks::expect_positive(EXTRACT, "nc", nc)?;
        Ok(Self {
            offset,
            k,
            nr,
            nc,
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        })
    }

    fn extent(&self) -> usize {
        self.k * self.nr * self.nc
    }

    fn check_input(&self, input: &Tensor) -> Result<()> {
        let available = input.shape().sample_size();
        if self.offset + self.extent() > available {
            return Err(LayerError::shape(
                EXTRACT,
                format!(
                    "range [{}, {}) exceeds the {} values per sample of {}",
                    self.offset,
                    self.offset + self.extent(),
                    available,
                    input.shape()
                ),
            ));
        }
        Ok(())
    }

    fn fields(&self) -> [usize; 4] {
        [self.offset, self.k, self.nr, self.nc]
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, EXTRACT, &[EXTRACT_VERSION])?;
        let mut f = [0usize; 4];
        for v in f.iter_mut() {
            *v = ser::read_usize(input)?;
        }
        let mut loaded = Self::new(f[0], f[1], f[2], f[3])?;
        loaded.state = LayerState::Ready;
        Ok(loaded)
    }
}

impl Layer for Extract {
    fn name(&self) -> &'static str {
        EXTRACT
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
        self.state.ensure_ready(EXTRACT)?;
        let input = sub.output();
        self.check_input(input)?;
        output.set_size(TensorShape::new(input.num_samples(), self.k, self.nr, self.nc));
        let len = self.extent();
        for n in 0..input.num_samples() {
            let src = &input.sample(n)[self.offset..self.offset + len];
            output.sample_mut(n).copy_from_slice(src);
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
        self.state.ensure_ready(EXTRACT)?;
        checks::expect_gradient(EXTRACT, gradient_input, computed_output)?;
        let grad = sub.gradient_input()?;
        self.check_input(grad)?;
        let len = self.extent();
        for n in 0..gradient_input.num_samples() {
            let dst = &mut grad.sample_mut(n)[self.offset..self.offset + len];
            for (d, v) in dst.iter_mut().zip(gradient_input.sample(n)) {
                *d += v;
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
        ser::write_str(out, EXTRACT_VERSION)?;
        for v in self.fields() {
            ser::write_usize(out, v)?;
        }
        Ok(())
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(input)?;
        let names = ["offset", "k", "nr", "nc"];
        for ((name, mine), theirs) in names.into_iter().zip(self.fields()).zip(loaded.fields()) {
            check_field(EXTRACT, name, mine, theirs)?;
        }
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<extract offset='{}' k='{}' nr='{}' nc='{}'/>\n",
            self.offset, self.k, self.nr, self.nc
        )
    }
}

impl fmt::Display for Extract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "extract\t (offset={}, k={}, nr={}, nc={})",
            self.offset, self.k, self.nr, self.nc
        )
    }
}

pub fn read_extract(input: &mut dyn Read) -> Result<Extract> {
    Extract::read_record(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients, random_tensor, GradCheck};
    use crate::Bindings;
    use std::io::Cursor;

    #[test]
    fn slice_copies_the_block() -> Result<()> {
        let shape = TensorShape::new(1, 2, 3, 3);
        let input = Tensor::from_vec(shape, (0..18).map(|v| v as f32).collect())?;
        let mut slice = Slice::new((1, 1, 0), 1, 2, 2)?;
        let bindings = Bindings::new(input);
        slice.setup(&bindings)?;
        let mut out = Tensor::new();
        slice.forward(&bindings, &mut out)?;
        assert_eq!(out.host(), &[12.0, 13.0, 15.0, 16.0]);
        Ok(())
    }

    #[test]
    fn slice_gradient_lands_only_in_the_block() -> Result<()> {
        let mut slice = Slice::new((0, 1, 1), 2, 2, 1)?;
        let bindings = Bindings::new(random_tensor(TensorShape::new(2, 3, 4, 3), 5));
        let report = check_gradients(&mut slice, bindings, GradCheck::default())?;
        assert!(report.passes(1e-3), "{report:?}");
        Ok(())
    }

    #[test]
    fn extract_takes_a_flat_range() -> Result<()> {
        let shape = TensorShape::new(2, 2, 2, 2);
        let input = Tensor::from_vec(shape, (0..16).map(|v| v as f32).collect())?;
        let mut extract = Extract::new(3, 1, 1, 4)?;
        let bindings = Bindings::new(input);
        extract.setup(&bindings)?;
        let mut out = Tensor::new();
        extract.forward(&bindings, &mut out)?;
        assert_eq!(out.host(), &[3.0, 4.0, 5.0, 6.0, 11.0, 12.0, 13.0, 14.0]);

        let report = check_gradients(&mut extract, bindings, GradCheck::default())?;
        assert!(report.passes(1e-3), "{report:?}");
        Ok(())
    }

    #[test]
    fn out_of_range_views_are_rejected() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(1, 2, 3, 3), 1));
        assert!(Slice::new((2, 0, 0), 1, 1, 1)?.setup(&bindings).is_err());
        assert!(Extract::new(10, 1, 3, 3)?.setup(&bindings).is_err());
        assert!(Extract::new(0, 0, 1, 1).is_err());
        Ok(())
    }

    #[test]
    fn records_check_static_fields() -> Result<()> {
        let mut buf = Vec::new();
        Extract::new(2, 1, 2, 2)?.serialize(&mut buf)?;
        let mut same = Extract::new(2, 1, 2, 2)?;
        same.deserialize(&mut Cursor::new(&buf))?;
        assert_eq!(same.state(), LayerState::Ready);
        let mut other = Extract::new(1, 1, 2, 2)?;
        let err = other.deserialize(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, LayerError::FieldMismatch { field: "offset", .. }));
        assert_eq!(other.state(), LayerState::Uninitialized);
        Ok(())
    }
}
