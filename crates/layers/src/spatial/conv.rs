//! Strided 2-D convolution with optional bias and fused ReLU.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::backend::{self, ConvGeometry};
use crate::serialize::{self as ser, check_field};
use crate::{
    checks, AliasTensor, DPoint, Layer, LayerError, LayerState, Multipliers, Result, Subnet,
    Tensor, TensorRng, TensorShape,
};

const NAME: &str = "con";
const VERSION: &str = "con_6";
const VERSION_NO_RELU: &str = "con_5";
const VERSION_NO_BIAS: &str = "con_4";

/// Static configuration shared by convolution and transposed convolution.
///
/// A filter size of `0` spans the whole input along that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvOptions {
    pub num_filters: usize,
    pub nr: usize,
    pub nc: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub padding_y: usize,
    pub padding_x: usize,
}

impl ConvOptions {
    /// Square-stride options with the default padding: `size/2` when the
    /// stride is 1, otherwise 0.
    pub fn new(num_filters: usize, nr: usize, nc: usize, stride_y: usize, stride_x: usize) -> Self {
        Self {
            num_filters,
            nr,
            nc,
            stride_y,
            stride_x,
            padding_y: if stride_y == 1 { nr / 2 } else { 0 },
            padding_x: if stride_x == 1 { nc / 2 } else { 0 },
        }
    }

    pub fn with_padding(mut self, padding_y: usize, padding_x: usize) -> Self {
        self.padding_y = padding_y;
        self.padding_x = padding_x;
        self
    }

    pub(crate) fn validate(&self, layer: &'static str, allow_full_span: bool) -> Result<()> {
        checks::expect_positive(layer, "num_filters", self.num_filters)?;
        checks::expect_positive(layer, "stride_y", self.stride_y)?;
        checks::expect_positive(layer, "stride_x", self.stride_x)?;
        for (size, pad, axis) in [(self.nr, self.padding_y, "y"), (self.nc, self.padding_x, "x")] {
            if size == 0 {
                if !allow_full_span {
                    return Err(LayerError::config(layer, "filter size must be > 0"));
                }
                if pad != 0 {
                    return Err(LayerError::config(
                        layer,
                        format!("padding_{axis} must be 0 when the filter spans the input"),
                    ));
                }
            } else if pad >= size {
                return Err(LayerError::config(
                    layer,
                    format!("padding_{axis} ({pad}) must be smaller than the filter ({size})"),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn geometry(&self) -> ConvGeometry {
        ConvGeometry {
            stride_y: self.stride_y,
            stride_x: self.stride_x,
            pad_y: self.padding_y,
            pad_x: self.padding_x,
        }
    }
}

/// Convolution layer (`con`).
#[derive(Debug, Clone)]
pub struct Conv {
    options: ConvOptions,
    multipliers: Multipliers,
    use_bias: bool,
    use_relu: bool,
    params: Tensor,
    filters: AliasTensor,
    biases: AliasTensor,
    seed: u64,
    state: LayerState,
}

impl Conv {
    pub fn new(options: ConvOptions) -> Result<Self> {
        options.validate(NAME, true)?;
        Ok(Self {
            options,
            multipliers: Multipliers::default(),
            use_bias: true,
            use_relu: false,
            params: Tensor::new(),
            filters: AliasTensor::default(),
            biases: AliasTensor::default(),
            seed: crate::rng::DEFAULT_SEED,
            state: LayerState::Uninitialized,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn options(&self) -> &ConvOptions {
        &self.options
    }

    pub fn num_filters(&self) -> usize {
        self.options.num_filters
    }

    /// Changes the filter count; only allowed before parameters exist.
    pub fn set_num_filters(&mut self, num: usize) -> Result<()> {
        checks::expect_positive(NAME, "num_filters", num)?;
        if num != self.options.num_filters && !self.params.is_empty() {
            return Err(LayerError::config(
                NAME,
                "cannot change num_filters once parameters are allocated",
            ));
        }
        self.options.num_filters = num;
        Ok(())
    }

    pub fn multipliers(&self) -> &Multipliers {
        &self.multipliers
    }

    pub fn set_multipliers(&mut self, multipliers: Multipliers) {
        self.multipliers = multipliers;
    }

    pub fn use_bias(&self) -> bool {
        self.use_bias
    }

    pub fn use_relu(&self) -> bool {
        self.use_relu
    }

    pub fn set_relu(&mut self, enabled: bool) {
        self.use_relu = enabled;
    }

    /// Drops the bias region from the parameter buffer.
    pub fn disable_bias(&mut self) {
        if !self.use_bias {
            return;
        }
        self.use_bias = false;
        if !self.params.is_empty() {
            let keep = self.filters.size();
            let mut params = Tensor::zeros(TensorShape::new(1, 1, 1, keep));
            params.host_mut().copy_from_slice(&self.params.host()[..keep]);
            self.params = params;
            self.biases = AliasTensor::default();
        }
    }

    /// Appends a zeroed bias region to the parameter buffer.
    pub fn enable_bias(&mut self) {
        if self.use_bias {
            return;
        }
        self.use_bias = true;
        if !self.params.is_empty() {
            let keep = self.filters.size();
            let mut params = Tensor::zeros(TensorShape::new(1, 1, 1, keep + self.options.num_filters));
            params.host_mut()[..keep].copy_from_slice(&self.params.host()[..keep]);
            self.params = params;
            self.biases = AliasTensor::new(
                TensorShape::new(1, self.options.num_filters, 1, 1),
                self.filters.size(),
            );
        }
    }

    /// Filter region of the parameter buffer.
    pub fn filters(&self) -> &AliasTensor {
        &self.filters
    }

    /// Bias region of the parameter buffer.
    pub fn biases(&self) -> &AliasTensor {
        &self.biases
    }

    fn filter_dims(&self) -> (usize, usize) {
        let s = self.filters.shape();
        if self.filters.size() > 0 {
            (s.nr, s.nc)
        } else {
            (self.options.nr, self.options.nc)
        }
    }

    fn output_shape(&self, input: &Tensor) -> Result<TensorShape> {
        let (fr, fc) = self.filter_dims();
        let o = &self.options;
        let nr = backend::strided_output_dim(input.nr(), fr, o.stride_y, o.padding_y);
        let nc = backend::strided_output_dim(input.nc(), fc, o.stride_x, o.padding_x);
        match (nr, nc) {
            (Some(nr), Some(nc)) => Ok(TensorShape::new(input.num_samples(), o.num_filters, nr, nc)),
            _ => Err(LayerError::shape(
                NAME,
                format!("{}x{} filter does not fit input {}", fr, fc, input.shape()),
            )),
        }
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        let version = ser::read_version(input, NAME, &[VERSION, VERSION_NO_RELU, VERSION_NO_BIAS])?;
        let params = ser::read_tensor(input)?;
        let num_filters = ser::read_usize(input)?;
        let nr = ser::read_usize(input)?;
        let nc = ser::read_usize(input)?;
        let stride_y = ser::read_usize(input)?;
        let stride_x = ser::read_usize(input)?;
        let padding_y = ser::read_usize(input)?;
        let padding_x = ser::read_usize(input)?;
        let filters = ser::read_alias(input)?;
        let biases = ser::read_alias(input)?;
        let multipliers = ser::read_multipliers(input)?;
        let use_bias = if version == VERSION_NO_BIAS { true } else { ser::read_bool(input)? };
        let use_relu = if version == VERSION { ser::read_bool(input)? } else { false };
        Ok(Self {
            options: ConvOptions {
                num_filters,
                nr,
                nc,
                stride_y,
                stride_x,
                padding_y,
                padding_x,
            },
            multipliers,
            use_bias,
            use_relu,
            state: if params.is_empty() {
                LayerState::Uninitialized
            } else {
                LayerState::Ready
            },
            params,
            filters,
            biases,
            seed: crate::rng::DEFAULT_SEED,
        })
    }
}

/// Adds a per-channel bias to every plane.
pub(crate) fn add_channel_bias(output: &mut Tensor, bias: &[f32]) {
    let plane = output.shape().plane_size();
    let k = output.k();
    for (i, chunk) in output.host_mut().chunks_mut(plane).enumerate() {
        let b = bias[i % k];
        chunk.iter_mut().for_each(|v| *v += b);
    }
}

/// Sums a gradient over samples and spatial positions, per channel.
pub(crate) fn channel_bias_gradient(gradient: &Tensor, out: &mut [f32]) {
    out.iter_mut().for_each(|v| *v = 0.0);
    let plane = gradient.shape().plane_size();
    let k = gradient.k();
    for (i, chunk) in gradient.host().chunks(plane).enumerate() {
        out[i % k] += chunk.iter().sum::<f32>();
    }
}

impl Layer for Conv {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        let input = sub.output();
        checks::expect_non_empty(NAME, input)?;
        let o = self.options;
        let fr = if o.nr == 0 { input.nr() } else { o.nr };
        let fc = if o.nc == 0 { input.nc() } else { o.nc };
        let filter_shape = TensorShape::new(o.num_filters, input.k(), fr, fc);
        let num_params = filter_shape.size() + usize::from(self.use_bias) * o.num_filters;

        if !self.params.is_empty() {
            if self.params.size() != num_params || self.filters.shape() != filter_shape {
                return Err(LayerError::shape(
                    NAME,
                    format!(
                        "input {} needs {} parameters but {} are already allocated",
                        input.shape(),
                        num_params,
                        self.params.size()
                    ),
                ));
            }
            self.state = LayerState::Ready;
            return Ok(());
        }

        self.filters = AliasTensor::new(filter_shape, 0);
        self.biases = if self.use_bias {
            AliasTensor::new(TensorShape::new(1, o.num_filters, 1, 1), filter_shape.size())
        } else {
            AliasTensor::default()
        };
        self.params.set_size(TensorShape::new(1, 1, 1, num_params));
        let fan_in = fr * fc * input.k();
        TensorRng::new(self.seed).xavier_uniform(
            &mut self.params.host_mut()[..filter_shape.size()],
            fan_in + o.num_filters,
        );
        log::debug!("{NAME}: allocated {num_params} parameters for input {}", input.shape());
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        let input = sub.output();
        checks::expect_k(NAME, input, self.filters.shape().k)?;
        output.set_size(self.output_shape(input)?);
        let filters = self.filters.view(&self.params)?;
        backend::conv_forward(
            output,
            false,
            input,
            filters.host(),
            filters.shape(),
            self.options.geometry(),
        )?;
        if self.use_bias {
            add_channel_bias(output, self.biases.view(&self.params)?.host());
        }
        if self.use_relu {
            output.host_mut().iter_mut().for_each(|v| *v = v.max(0.0));
        }
        Ok(())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        checks::expect_gradient(NAME, gradient_input, computed_output)?;
        let masked;
        let grad = if self.use_relu {
            let mut g = gradient_input.clone();
            for (gv, out) in g.host_mut().iter_mut().zip(computed_output.host()) {
                if *out <= 0.0 {
                    *gv = 0.0;
                }
            }
            masked = g;
            &masked
        } else {
            gradient_input
        };

        let geom = self.options.geometry();
        let filters = self.filters.view(&self.params)?;
        let (input, data_grad) = sub.output_and_gradient()?;
        backend::conv_backward_data(data_grad, grad, filters.host(), filters.shape(), geom)?;

        if self.multipliers.learning_rate != 0.0 {
            checks::expect_params_grad(NAME, params_grad, &self.params)?;
            let mut fgrad = self.filters.view_slice_mut(params_grad.host_mut())?;
            backend::conv_backward_filters(fgrad.host_mut(), filters.shape(), grad, input, geom)?;
            if self.use_bias {
                let mut bgrad = self.biases.view_slice_mut(params_grad.host_mut())?;
                channel_bias_gradient(grad, bgrad.host_mut());
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

    fn map_input_to_output(&self, mut p: DPoint) -> DPoint {
        let (fr, fc) = self.filter_dims();
        let o = &self.options;
        p.x = (p.x + o.padding_x as f64 - (fc / 2) as f64) / o.stride_x as f64;
        p.y = (p.y + o.padding_y as f64 - (fr / 2) as f64) / o.stride_y as f64;
        p
    }

    fn map_output_to_input(&self, mut p: DPoint) -> DPoint {
        let (fr, fc) = self.filter_dims();
        let o = &self.options;
        p.x = p.x * o.stride_x as f64 - o.padding_x as f64 + (fc / 2) as f64;
        p.y = p.y * o.stride_y as f64 - o.padding_y as f64 + (fr / 2) as f64;
        p
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        let o = &self.options;
        ser::write_str(out, VERSION)?;
        ser::write_tensor(out, &self.params)?;
        for v in [o.num_filters, o.nr, o.nc, o.stride_y, o.stride_x, o.padding_y, o.padding_x] {
            ser::write_usize(out, v)?;
        }
        ser::write_alias(out, &self.filters)?;
        ser::write_alias(out, &self.biases)?;
        ser::write_multipliers(out, &self.multipliers)?;
        ser::write_bool(out, self.use_bias)?;
        ser::write_bool(out, self.use_relu)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(input)?;
        let (mine, theirs) = (&self.options, &loaded.options);
        check_field(NAME, "nr", mine.nr, theirs.nr)?;
        check_field(NAME, "nc", mine.nc, theirs.nc)?;
        check_field(NAME, "stride_y", mine.stride_y, theirs.stride_y)?;
        check_field(NAME, "stride_x", mine.stride_x, theirs.stride_x)?;
        check_field(NAME, "padding_y", mine.padding_y, theirs.padding_y)?;
        check_field(NAME, "padding_x", mine.padding_x, theirs.padding_x)?;
        let seed = self.seed;
        *self = Self { seed, ..loaded };
        Ok(())
    }

    fn to_xml(&self) -> String {
        let o = &self.options;
        format!(
            "<con num_filters='{}' nr='{}' nc='{}' stride_y='{}' stride_x='{}' padding_y='{}' padding_x='{}'{} use_bias='{}' use_relu='{}'>\n{}</con>\n",
            o.num_filters,
            o.nr,
            o.nc,
            o.stride_y,
            o.stride_x,
            o.padding_y,
            o.padding_x,
            self.multipliers.xml_attrs(),
            self.use_bias,
            self.use_relu,
            ser::tensor_text(&self.params)
        )
    }
}

impl fmt::Display for Conv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.options;
        write!(
            f,
            "con\t (num_filters={}, nr={}, nc={}, stride_y={}, stride_x={}, padding_y={}, padding_x={}){}",
            o.num_filters,
            o.nr,
            o.nc,
            o.stride_y,
            o.stride_x,
            o.padding_y,
            o.padding_x,
            self.multipliers.summary(self.use_bias)
        )?;
        if self.use_relu {
            write!(f, " use_relu=true")?;
        }
        Ok(())
    }
}

/// Reads any accepted `con` record, adopting its configuration.
pub fn read_conv(input: &mut dyn Read) -> Result<Conv> {
    Conv::read_record(input)
}
