//! Transposed convolution (`cont`), the dual of [`super::Conv`].
//!
//! Forward runs the convolution's data-gradient kernel, backward-for-data
//! runs the convolution's forward kernel. Output extent is
//! `stride·(in − 1) + filter − 2·padding`.

use std::fmt;
use std::io::{Read, Write};

use crate::backend;
use crate::serialize::{self as ser, check_field};
use crate::spatial::conv::{add_channel_bias, channel_bias_gradient, ConvOptions};
use crate::{
    checks, AliasTensor, DPoint, Layer, LayerError, LayerState, Multipliers, Result, Subnet,
    Tensor, TensorRng, TensorShape,
};

const NAME: &str = "cont";
const VERSION: &str = "cont_2";
const VERSION_NO_BIAS: &str = "cont_1";

#[derive(Debug, Clone)]
pub struct ConvTranspose {
    options: ConvOptions,
    multipliers: Multipliers,
    use_bias: bool,
    params: Tensor,
    filters: AliasTensor,
    biases: AliasTensor,
    seed: u64,
    state: LayerState,
}

fn transposed_dim(input: usize, filter: usize, stride: usize, pad: usize) -> Option<usize> {
    if input == 0 {
        return None;
    }
    (stride * (input - 1) + filter).checked_sub(2 * pad).filter(|v| *v > 0)
}

impl ConvTranspose {
    pub fn new(options: ConvOptions) -> Result<Self> {
        options.validate(NAME, false)?;
        Ok(Self {
            options,
            multipliers: Multipliers::default(),
            use_bias: true,
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

    /// Must be called before `setup`; toggling later would need a resize.
    pub fn set_use_bias(&mut self, use_bias: bool) -> Result<()> {
        if use_bias != self.use_bias && !self.params.is_empty() {
            return Err(LayerError::config(
                NAME,
                "cannot toggle the bias once parameters are allocated",
            ));
        }
        self.use_bias = use_bias;
        Ok(())
    }

    fn output_shape(&self, input: &Tensor) -> Result<TensorShape> {
        let o = &self.options;
        let nr = transposed_dim(input.nr(), o.nr, o.stride_y, o.padding_y);
        let nc = transposed_dim(input.nc(), o.nc, o.stride_x, o.padding_x);
        match (nr, nc) {
            (Some(nr), Some(nc)) => Ok(TensorShape::new(input.num_samples(), o.num_filters, nr, nc)),
            _ => Err(LayerError::shape(
                NAME,
                format!("input {} produces an empty output", input.shape()),
            )),
        }
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        let version = ser::read_version(input, NAME, &[VERSION, VERSION_NO_BIAS])?;
        let params = ser::read_tensor(input)?;
        let mut dims = [0usize; 7];
        for d in dims.iter_mut() {
            *d = ser::read_usize(input)?;
        }
        let filters = ser::read_alias(input)?;
        let biases = ser::read_alias(input)?;
        let multipliers = ser::read_multipliers(input)?;
        let use_bias = if version == VERSION { ser::read_bool(input)? } else { true };
        Ok(Self {
            options: ConvOptions {
                num_filters: dims[0],
                nr: dims[1],
                nc: dims[2],
                stride_y: dims[3],
                stride_x: dims[4],
                padding_y: dims[5],
                padding_x: dims[6],
            },
            multipliers,
            use_bias,
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

impl Layer for ConvTranspose {
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
        let filter_shape = TensorShape::new(input.k(), o.num_filters, o.nr, o.nc);
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
        let fan = o.nr * o.nc * o.num_filters + input.k();
        TensorRng::new(self.seed)
            .xavier_uniform(&mut self.params.host_mut()[..filter_shape.size()], fan);
        log::debug!("{NAME}: allocated {num_params} parameters for input {}", input.shape());
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        let input = sub.output();
        checks::expect_k(NAME, input, self.filters.shape().num_samples)?;
        output.set_size(self.output_shape(input)?);
        let filters = self.filters.view(&self.params)?;
        backend::conv_backward_data(
            output,
            input,
            filters.host(),
            filters.shape(),
            self.options.geometry(),
        )?;
        if self.use_bias {
            add_channel_bias(output, self.biases.view(&self.params)?.host());
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
        let geom = self.options.geometry();
        let filters = self.filters.view(&self.params)?;
        let (input, data_grad) = sub.output_and_gradient()?;
        backend::conv_forward(
            data_grad,
            true,
            gradient_input,
            filters.host(),
            filters.shape(),
            geom,
        )?;

        if self.multipliers.learning_rate != 0.0 {
            checks::expect_params_grad(NAME, params_grad, &self.params)?;
            let mut fgrad = self.filters.view_slice_mut(params_grad.host_mut())?;
            backend::conv_backward_filters(
                fgrad.host_mut(),
                filters.shape(),
                input,
                gradient_input,
                geom,
            )?;
            if self.use_bias {
                let mut bgrad = self.biases.view_slice_mut(params_grad.host_mut())?;
                channel_bias_gradient(gradient_input, bgrad.host_mut());
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
        let o = &self.options;
        p.x = p.x * o.stride_x as f64 + (o.nc / 2) as f64 - o.padding_x as f64;
        p.y = p.y * o.stride_y as f64 + (o.nr / 2) as f64 - o.padding_y as f64;
        p
    }

    fn map_output_to_input(&self, mut p: DPoint) -> DPoint {
        let o = &self.options;
        p.x = (p.x - (o.nc / 2) as f64 + o.padding_x as f64) / o.stride_x as f64;
        p.y = (p.y - (o.nr / 2) as f64 + o.padding_y as f64) / o.stride_y as f64;
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
        ser::write_bool(out, self.use_bias)
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
            "<cont num_filters='{}' nr='{}' nc='{}' stride_y='{}' stride_x='{}' padding_y='{}' padding_x='{}'{} use_bias='{}'>\n{}</cont>\n",
            o.num_filters,
            o.nr,
            o.nc,
            o.stride_y,
            o.stride_x,
            o.padding_y,
            o.padding_x,
            self.multipliers.xml_attrs(),
            self.use_bias,
            ser::tensor_text(&self.params)
        )
    }
}

impl fmt::Display for ConvTranspose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.options;
        write!(
            f,
            "cont\t (num_filters={}, nr={}, nc={}, stride_y={}, stride_x={}, padding_y={}, padding_x={}){}",
            o.num_filters,
            o.nr,
            o.nc,
            o.stride_y,
            o.stride_x,
            o.padding_y,
            o.padding_x,
            self.multipliers.summary(self.use_bias)
        )
    }
}

pub fn read_conv_transpose(input: &mut dyn Read) -> Result<ConvTranspose> {
    ConvTranspose::read_record(input)
}
