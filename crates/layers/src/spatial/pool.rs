//! Max and average pooling layers.
//!
//! A window of size 0 along an axis pools over the whole input along that
//! axis (global pooling) and then requires zero padding.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::backend::{self, pool, PoolGeometry, PoolKind};
use crate::serialize::{self as ser, check_field};
use crate::{checks, DPoint, Layer, LayerError, LayerState, Result, Subnet, Tensor, TensorShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    pub nr: usize,
    pub nc: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub padding_y: usize,
    pub padding_x: usize,
}

impl PoolOptions {
    /// Window and stride with the default padding (`window/2` at stride 1).
    pub fn new(nr: usize, nc: usize, stride_y: usize, stride_x: usize) -> Self {
        Self {
            nr,
            nc,
            stride_y,
            stride_x,
            padding_y: if stride_y == 1 && nr != 0 { nr / 2 } else { 0 },
            padding_x: if stride_x == 1 && nc != 0 { nc / 2 } else { 0 },
        }
    }

    /// Pools each whole plane down to a single value.
    pub fn global() -> Self {
        Self::new(0, 0, 1, 1)
    }

    pub fn with_padding(mut self, padding_y: usize, padding_x: usize) -> Self {
        self.padding_y = padding_y;
        self.padding_x = padding_x;
        self
    }

    fn validate(&self, layer: &'static str) -> Result<()> {
        checks::expect_positive(layer, "stride_y", self.stride_y)?;
        checks::expect_positive(layer, "stride_x", self.stride_x)?;
        for (size, pad, axis) in [(self.nr, self.padding_y, "y"), (self.nc, self.padding_x, "x")] {
            let ok = if size == 0 { pad == 0 } else { pad < size };
            if !ok {
                return Err(LayerError::config(
                    layer,
                    format!("padding_{axis} ({pad}) must be smaller than the window ({size})"),
                ));
            }
        }
        Ok(())
    }

    fn geometry(&self, input: &Tensor) -> PoolGeometry {
        PoolGeometry {
            window_nr: if self.nr == 0 { input.nr() } else { self.nr },
            window_nc: if self.nc == 0 { input.nc() } else { self.nc },
            stride_y: self.stride_y,
            stride_x: self.stride_x,
            pad_y: self.padding_y,
            pad_x: self.padding_x,
        }
    }
}

/// Pooling layer; `kind` selects `max_pool` or `avg_pool`.
#[derive(Debug, Clone)]
pub struct Pool {
    kind: PoolKind,
    options: PoolOptions,
    params: Tensor,
    state: LayerState,
}

fn layer_name(kind: PoolKind) -> &'static str {
    match kind {
        PoolKind::Max => "max_pool",
        PoolKind::Avg => "avg_pool",
    }
}

fn version_tag(kind: PoolKind) -> &'static str {
    match kind {
        PoolKind::Max => "max_pool_2",
        PoolKind::Avg => "avg_pool_2",
    }
}

impl Pool {
    pub fn new(kind: PoolKind, options: PoolOptions) -> Result<Self> {
        options.validate(layer_name(kind))?;
        Ok(Self {
            kind,
            options,
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        })
    }

    pub fn max(options: PoolOptions) -> Result<Self> {
        Self::new(PoolKind::Max, options)
    }

    pub fn avg(options: PoolOptions) -> Result<Self> {
        Self::new(PoolKind::Avg, options)
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    fn output_shape(&self, input: &Tensor) -> Result<TensorShape> {
        let g = self.options.geometry(input);
        let nr = backend::strided_output_dim(input.nr(), g.window_nr, g.stride_y, g.pad_y);
        let nc = backend::strided_output_dim(input.nc(), g.window_nc, g.stride_x, g.pad_x);
        match (nr, nc) {
            (Some(nr), Some(nc)) if nr > 0 && nc > 0 => {
                Ok(TensorShape::new(input.num_samples(), input.k(), nr, nc))
            }
            _ => Err(LayerError::shape(
                layer_name(self.kind),
                format!("{}x{} window does not fit input {}", g.window_nr, g.window_nc, input.shape()),
            )),
        }
    }

    fn read_record(kind: PoolKind, input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, layer_name(kind), &[version_tag(kind)])?;
        let mut dims = [0usize; 6];
        for d in dims.iter_mut() {
            *d = ser::read_usize(input)?;
        }
        let options = PoolOptions {
            nr: dims[0],
            nc: dims[1],
            stride_y: dims[2],
            stride_x: dims[3],
            padding_y: dims[4],
            padding_x: dims[5],
        };
        options.validate(layer_name(kind))?;
        Ok(Self {
            kind,
            options,
            params: Tensor::new(),
            state: LayerState::Ready,
        })
    }
}

impl Layer for Pool {
    fn name(&self) -> &'static str {
        layer_name(self.kind)
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(self.name(), sub.output())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(self.name())?;
        let input = sub.output();
        output.set_size(self.output_shape(input)?);
        pool::pool_forward(self.kind, output, input, self.options.geometry(input))
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(self.name())?;
        checks::expect_gradient(self.name(), gradient_input, computed_output)?;
        let (input, grad) = sub.output_and_gradient()?;
        let geom = self.options.geometry(input);
        pool::pool_backward(self.kind, grad, gradient_input, input, geom)
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn map_input_to_output(&self, mut p: DPoint) -> DPoint {
        let o = &self.options;
        p.x = (p.x + o.padding_x as f64 - (o.nc / 2) as f64) / o.stride_x as f64;
        p.y = (p.y + o.padding_y as f64 - (o.nr / 2) as f64) / o.stride_y as f64;
        p
    }

    fn map_output_to_input(&self, mut p: DPoint) -> DPoint {
        let o = &self.options;
        p.x = p.x * o.stride_x as f64 - o.padding_x as f64 + (o.nc / 2) as f64;
        p.y = p.y * o.stride_y as f64 - o.padding_y as f64 + (o.nr / 2) as f64;
        p
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        let o = &self.options;
        ser::write_str(out, version_tag(self.kind))?;
        for v in [o.nr, o.nc, o.stride_y, o.stride_x, o.padding_y, o.padding_x] {
            ser::write_usize(out, v)?;
        }
        Ok(())
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(self.kind, input)?;
        let name = self.name();
        let (mine, theirs) = (&self.options, &loaded.options);
        check_field(name, "nr", mine.nr, theirs.nr)?;
        check_field(name, "nc", mine.nc, theirs.nc)?;
        check_field(name, "stride_y", mine.stride_y, theirs.stride_y)?;
        check_field(name, "stride_x", mine.stride_x, theirs.stride_x)?;
        check_field(name, "padding_y", mine.padding_y, theirs.padding_y)?;
        check_field(name, "padding_x", mine.padding_x, theirs.padding_x)?;
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        let o = &self.options;
        format!(
            "<{} nr='{}' nc='{}' stride_y='{}' stride_x='{}' padding_y='{}' padding_x='{}'/>\n",
            self.name(),
            o.nr,
            o.nc,
            o.stride_y,
            o.stride_x,
            o.padding_y,
            o.padding_x
        )
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.options;
        write!(
            f,
            "{} (nr={}, nc={}, stride_y={}, stride_x={}, padding_y={}, padding_x={})",
            self.name(),
            o.nr,
            o.nc,
            o.stride_y,
            o.stride_x,
            o.padding_y,
            o.padding_x
        )
    }
}

pub fn read_max_pool(input: &mut dyn Read) -> Result<Pool> {
    Pool::read_record(PoolKind::Max, input)
}

pub fn read_avg_pool(input: &mut dyn Read) -> Result<Pool> {
    Pool::read_record(PoolKind::Avg, input)
}
