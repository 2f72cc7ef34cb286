//! Non-owning views into a flat parameter buffer.
//!
//! A layer keeps a single [`Tensor`] of parameters and describes its logical
//! pieces (filters, biases, gains) as [`AliasTensor`]s: a shape plus an
//! element offset. Views borrow the buffer for as long as they live and are
//! bounds-checked whenever they are taken, so an alias computed for an older
//! buffer size fails instead of reading stale memory.

use crate::{LayerError, Result, Tensor, TensorShape};

/// A `(shape, offset)` descriptor into some buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AliasTensor {
    shape: TensorShape,
    offset: usize,
}

impl AliasTensor {
    pub fn new(shape: TensorShape, offset: usize) -> Self {
        Self { shape, offset }
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// First element past the aliased region.
    pub fn end(&self) -> usize {
        self.offset + self.shape.size()
    }

    fn check(&self, len: usize) -> Result<()> {
        if self.end() > len {
            return Err(LayerError::AliasBounds {
                offset: self.offset,
                extent: self.size(),
                len,
            });
        }
        Ok(())
    }

    pub fn view<'a>(&self, buffer: &'a Tensor) -> Result<AliasView<'a>> {
        self.view_slice(buffer.host())
    }

    pub fn view_mut<'a>(&self, buffer: &'a mut Tensor) -> Result<AliasViewMut<'a>> {
        self.view_slice_mut(buffer.host_mut())
    }

    pub fn view_slice<'a>(&self, data: &'a [f32]) -> Result<AliasView<'a>> {
        self.check(data.len())?;
        Ok(AliasView {
            shape: self.shape,
            data: &data[self.offset..self.end()],
        })
    }

    pub fn view_slice_mut<'a>(&self, data: &'a mut [f32]) -> Result<AliasViewMut<'a>> {
        self.check(data.len())?;
        let end = self.end();
        Ok(AliasViewMut {
            shape: self.shape,
            data: &mut data[self.offset..end],
        })
    }
}

/// Read-only window onto an aliased region.
#[derive(Debug, Clone, Copy)]
pub struct AliasView<'a> {
    shape: TensorShape,
    data: &'a [f32],
}

impl<'a> AliasView<'a> {
    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn host(&self) -> &'a [f32] {
        self.data
    }

    #[inline]
    pub fn at(&self, n: usize, k: usize, r: usize, c: usize) -> f32 {
        let s = self.shape;
        self.data[((n * s.k + k) * s.nr + r) * s.nc + c]
    }

    /// Copies the region out into an owned tensor.
    pub fn to_tensor(&self) -> Tensor {
        let mut owned = Tensor::zeros(self.shape);
        owned.host_mut().copy_from_slice(self.data);
        owned
    }
}

/// Mutable window onto an aliased region.
#[derive(Debug)]
pub struct AliasViewMut<'a> {
    shape: TensorShape,
    data: &'a mut [f32],
}

impl<'a> AliasViewMut<'a> {
    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn host(&self) -> &[f32] {
        self.data
    }

    pub fn host_mut(&mut self) -> &mut [f32] {
        self.data
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    pub fn copy_from(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.data.len() {
            return Err(LayerError::shape(
                "alias",
                format!(
                    "cannot copy {} values into a region of {}",
                    values.len(),
                    self.data.len()
                ),
            ));
        }
        self.data.copy_from_slice(values);
        Ok(())
    }
}
