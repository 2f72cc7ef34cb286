//! Host-resident 4-D activation tensor.
//!
//! Data is stored row-major as `(num_samples, k, nr, nc)`. Conversions to and
//! from [`candle_core::Tensor`] let kernels and tests borrow candle's
//! implementations where the layout lines up.

use std::fmt;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::{LayerError, Result};

/// Extent of a tensor along its four semantic axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorShape {
    pub num_samples: usize,
    pub k: usize,
    pub nr: usize,
    pub nc: usize,
}

impl TensorShape {
    pub const fn new(num_samples: usize, k: usize, nr: usize, nc: usize) -> Self {
        Self {
            num_samples,
            k,
            nr,
            nc,
        }
    }

    /// Total number of elements.
    pub const fn size(&self) -> usize {
        self.num_samples * self.k * self.nr * self.nc
    }

    /// Elements per sample (`k * nr * nc`).
    pub const fn sample_size(&self) -> usize {
        self.k * self.nr * self.nc
    }

    /// Elements per channel plane (`nr * nc`).
    pub const fn plane_size(&self) -> usize {
        self.nr * self.nc
    }

    pub const fn dims(&self) -> [usize; 4] {
        [self.num_samples, self.k, self.nr, self.nc]
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.num_samples, self.k, self.nr, self.nc
        )
    }
}

/// Dense `f32` tensor with a resizable shape.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tensor {
    shape: TensorShape,
    data: Vec<f32>,
}

impl Tensor {
    /// Empty tensor with every dimension zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zeros(shape: TensorShape) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: TensorShape, value: f32) -> Self {
        Self {
            shape,
            data: vec![value; shape.size()],
        }
    }

    /// Wraps `data`, which must hold exactly `shape.size()` values.
    pub fn from_vec(shape: TensorShape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.size() {
            return Err(LayerError::shape(
                "tensor",
                format!(
                    "shape {} needs {} values, got {}",
                    shape,
                    shape.size(),
                    data.len()
                ),
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn num_samples(&self) -> usize {
        self.shape.num_samples
    }

    pub fn k(&self) -> usize {
        self.shape.k
    }

    pub fn nr(&self) -> usize {
        self.shape.nr
    }

    pub fn nc(&self) -> usize {
        self.shape.nc
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reshapes to `shape`, zeroing the contents.
    pub fn set_size(&mut self, shape: TensorShape) {
        self.shape = shape;
        self.data.clear();
        self.data.resize(shape.size(), 0.0);
    }

    /// Reinterprets the existing values under a new shape of equal size.
    pub fn reshape(&mut self, shape: TensorShape) -> Result<()> {
        if shape.size() != self.data.len() {
            return Err(LayerError::shape(
                "tensor",
                format!("cannot reshape {} into {}", self.shape, shape),
            ));
        }
        self.shape = shape;
        Ok(())
    }

    pub fn copy_size(&mut self, other: &Tensor) {
        self.set_size(other.shape);
    }

    pub fn same_dims(&self, other: &Tensor) -> bool {
        self.shape == other.shape
    }

    pub fn host(&self) -> &[f32] {
        &self.data
    }

    pub fn host_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Flat offset of element `(n, k, r, c)`.
    #[inline]
    pub fn index(&self, n: usize, k: usize, r: usize, c: usize) -> usize {
        ((n * self.shape.k + k) * self.shape.nr + r) * self.shape.nc + c
    }

    #[inline]
    pub fn at(&self, n: usize, k: usize, r: usize, c: usize) -> f32 {
        self.data[self.index(n, k, r, c)]
    }

    pub fn sample(&self, n: usize) -> &[f32] {
        let len = self.shape.sample_size();
        &self.data[n * len..(n + 1) * len]
    }

    pub fn sample_mut(&mut self, n: usize) -> &mut [f32] {
        let len = self.shape.sample_size();
        &mut self.data[n * len..(n + 1) * len]
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// `self += other`; both tensors must share a shape.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        self.add_scaled(other, 1.0)
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> Result<()> {
        if self.data.len() != other.data.len() {
            return Err(LayerError::shape(
                "tensor",
                format!("cannot accumulate {} into {}", other.shape, self.shape),
            ));
        }
        for (dst, src) in self.data.iter_mut().zip(&other.data) {
            *dst += scale * src;
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f32) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// Sum of element-wise products, accumulated in `f64`.
    pub fn dot(&self, other: &Tensor) -> f64 {
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| f64::from(*a) * f64::from(*b))
            .sum()
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().map(|v| f64::from(*v)).sum()
    }

    /// Largest absolute element-wise difference; infinite when shapes differ.
    pub fn max_abs_diff(&self, other: &Tensor) -> f32 {
        if self.shape != other.shape {
            return f32::INFINITY;
        }
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }

    /// Copies into a rank-4 candle tensor on `device`.
    pub fn to_candle(&self, device: &Device) -> Result<candle_core::Tensor> {
        let dims = self.shape.dims();
        Ok(candle_core::Tensor::from_slice(&self.data, &dims[..], device)?)
    }

    /// Copies a candle tensor of rank 1 to 4; missing trailing axes become 1.
    pub fn from_candle(tensor: &candle_core::Tensor) -> Result<Self> {
        let dims = tensor.dims();
        let shape = match *dims {
            [n] => TensorShape::new(n, 1, 1, 1),
            [n, k] => TensorShape::new(n, k, 1, 1),
            [n, k, r] => TensorShape::new(n, k, r, 1),
            [n, k, r, c] => TensorShape::new(n, k, r, c),
            _ => {
                return Err(LayerError::shape(
                    "tensor",
                    format!("expected rank 1 to 4, got {:?}", dims),
                ))
            }
        };
        let data = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Self::from_vec(shape, data)
    }
}
