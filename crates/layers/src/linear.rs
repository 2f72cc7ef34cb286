//! Dense projections.
//!
//! [`Fc`] flattens every sample to a `k·nr·nc` row vector and maps it to
//! `num_outputs` channels. [`Linear`] projects only the `nc` axis, keeping
//! `(k, nr)`, so a `(batch, 1, seq, dim)` activation maps to
//! `(batch, 1, seq, num_outputs)` as in a transformer block.
//!
//! Both keep a `(num_inputs [+ 1], num_outputs)` parameter buffer: weights
//! first, then one bias row. Products go through [`backend::gemm`].

use std::fmt;
use std::io::{Read, Write};

use crate::backend::{self, MatRef};
use crate::serialize::{self as ser, check_field};
use crate::{
    checks, AliasTensor, Layer, LayerError, LayerState, Multipliers, Result, Subnet, Tensor,
    TensorRng, TensorShape,
};

/// Weight and bias regions of a dense parameter buffer.
#[derive(Debug, Clone)]
struct Projection {
    num_outputs: usize,
    num_inputs: usize,
    use_bias: bool,
    params: Tensor,
    weights: AliasTensor,
    biases: AliasTensor,
}

impl Projection {
    fn new(num_outputs: usize, use_bias: bool) -> Self {
        Self {
            num_outputs,
            num_inputs: 0,
            use_bias,
            params: Tensor::new(),
            weights: AliasTensor::default(),
            biases: AliasTensor::default(),
        }
    }

    fn num_params(&self, num_inputs: usize) -> usize {
        (num_inputs + usize::from(self.use_bias)) * self.num_outputs
    }

    /// Allocates on first use; later calls only confirm the size.
    fn allocate(&mut self, layer: &'static str, num_inputs: usize, seed: u64) -> Result<()> {
        let needed = self.num_params(num_inputs);
        if !self.params.is_empty() {
            if self.params.size() != needed || self.num_inputs != num_inputs {
                return Err(LayerError::shape(
                    layer,
                    format!(
                        "{num_inputs} inputs need {needed} parameters but {} are already allocated",
                        self.params.size()
                    ),
                ));
            }
            return Ok(());
        }
        self.num_inputs = num_inputs;
        let rows = num_inputs + usize::from(self.use_bias);
        self.params.set_size(TensorShape::new(rows, self.num_outputs, 1, 1));
        self.weights = AliasTensor::new(TensorShape::new(num_inputs, self.num_outputs, 1, 1), 0);
        self.biases = if self.use_bias {
            AliasTensor::new(TensorShape::new(1, self.num_outputs, 1, 1), self.weights.size())
        } else {
            AliasTensor::default()
        };
        TensorRng::new(seed).xavier_uniform(
            &mut self.params.host_mut()[..self.weights.size()],
            num_inputs + self.num_outputs,
        );
        log::debug!("{layer}: allocated {needed} parameters for {num_inputs} inputs");
        Ok(())
    }

    /// `out = x·W (+ b)` for `rows` input rows.
    fn forward(&self, x: &[f32], rows: usize, out: &mut [f32]) -> Result<()> {
        let w = self.weights.view(&self.params)?;
        backend::gemm(
            0.0,
            out,
            1.0,
            MatRef::new(x, rows, self.num_inputs)?,
            false,
            MatRef::new(w.host(), self.num_inputs, self.num_outputs)?,
            false,
        )?;
        if self.use_bias {
            let b = self.biases.view(&self.params)?;
            for row in out.chunks_mut(self.num_outputs) {
                row.iter_mut().zip(b.host()).for_each(|(o, bv)| *o += bv);
            }
        }
        Ok(())
    }

    /// Writes `weight_scale·xᵀ·g` and the column sums of `g` into `params_grad`.
    fn params_gradient(
        &self,
        x: &[f32],
        g: &[f32],
        rows: usize,
        weight_scale: f32,
        params_grad: &mut Tensor,
    ) -> Result<()> {
        let mut pw = self.weights.view_slice_mut(params_grad.host_mut())?;
        backend::gemm(
            0.0,
            pw.host_mut(),
            weight_scale,
            MatRef::new(x, rows, self.num_inputs)?,
            true,
            MatRef::new(g, rows, self.num_outputs)?,
            false,
        )?;
        if self.use_bias {
            let mut pb = self.biases.view_slice_mut(params_grad.host_mut())?;
            let pb = pb.host_mut();
            pb.fill(0.0);
            for row in g.chunks(self.num_outputs) {
                pb.iter_mut().zip(row).for_each(|(b, gv)| *b += gv);
            }
        }
        Ok(())
    }

    /// `dx += g·Wᵀ`.
    fn data_gradient(&self, g: &[f32], rows: usize, dx: &mut [f32]) -> Result<()> {
        let w = self.weights.view(&self.params)?;
        backend::gemm(
            1.0,
            dx,
            1.0,
            MatRef::new(g, rows, self.num_outputs)?,
            false,
            MatRef::new(w.host(), self.num_inputs, self.num_outputs)?,
            true,
        )
    }

    fn write(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_usize(out, self.num_outputs)?;
        ser::write_usize(out, self.num_inputs)?;
        ser::write_tensor(out, &self.params)?;
        ser::write_alias(out, &self.weights)?;
        ser::write_alias(out, &self.biases)
    }

    fn read(input: &mut dyn Read) -> Result<Self> {
        let num_outputs = ser::read_usize(input)?;
        let num_inputs = ser::read_usize(input)?;
        let params = ser::read_tensor(input)?;
        let weights = ser::read_alias(input)?;
        let biases = ser::read_alias(input)?;
        Ok(Self {
            num_outputs,
            num_inputs,
            use_bias: biases.size() > 0,
            params,
            weights,
            biases,
        })
    }

    fn state(&self) -> LayerState {
        if self.params.is_empty() {
            LayerState::Uninitialized
        } else {
            LayerState::Ready
        }
    }
}

const FC: &str = "fc";
const FC_VERSION: &str = "fc_3";
const FC_VERSION_ALWAYS_BIAS: &str = "fc_2";

/// Fully connected layer over the flattened sample.
#[derive(Debug, Clone)]
pub struct Fc {
    dense: Projection,
    multipliers: Multipliers,
    seed: u64,
    state: LayerState,
}

impl Fc {
    pub fn new(num_outputs: usize) -> Result<Self> {
        checks::expect_positive(FC, "num_outputs", num_outputs)?;
        Ok(Self {
            dense: Projection::new(num_outputs, true),
            multipliers: Multipliers::default(),
            seed: crate::rng::DEFAULT_SEED,
            state: LayerState::Uninitialized,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn num_outputs(&self) -> usize {
        self.dense.num_outputs
    }

    /// Input features seen at setup; 0 before.
    pub fn num_inputs(&self) -> usize {
        self.dense.num_inputs
    }

    pub fn set_num_outputs(&mut self, num: usize) -> Result<()> {
        checks::expect_positive(FC, "num_outputs", num)?;
        if num != self.dense.num_outputs && !self.dense.params.is_empty() {
            return Err(LayerError::config(
                FC,
                "cannot change num_outputs once parameters are allocated",
            ));
        }
        self.dense.num_outputs = num;
        Ok(())
    }

    pub fn multipliers(&self) -> &Multipliers {
        &self.multipliers
    }

    pub fn set_multipliers(&mut self, multipliers: Multipliers) {
        self.multipliers = multipliers;
    }

    pub fn use_bias(&self) -> bool {
        self.dense.use_bias
    }

    /// Drops the bias row from the parameter buffer.
    pub fn disable_bias(&mut self) {
        if !self.dense.use_bias {
            return;
        }
        self.dense.use_bias = false;
        self.dense.biases = AliasTensor::default();
        if !self.dense.params.is_empty() {
            let d = &mut self.dense;
            let keep = d.weights.size();
            let mut params = Tensor::zeros(TensorShape::new(d.num_inputs, d.num_outputs, 1, 1));
            params.host_mut().copy_from_slice(&d.params.host()[..keep]);
            d.params = params;
        }
    }

    /// Appends a zeroed bias row to the parameter buffer.
    pub fn enable_bias(&mut self) {
        if self.dense.use_bias {
            return;
        }
        self.dense.use_bias = true;
        if !self.dense.params.is_empty() {
            let d = &mut self.dense;
            let keep = d.weights.size();
            let mut params = Tensor::zeros(TensorShape::new(d.num_inputs + 1, d.num_outputs, 1, 1));
            params.host_mut()[..keep].copy_from_slice(&d.params.host()[..keep]);
            d.params = params;
            d.biases = AliasTensor::new(TensorShape::new(1, d.num_outputs, 1, 1), d.weights.size());
        }
    }

    pub fn weights(&self) -> &AliasTensor {
        &self.dense.weights
    }

    pub fn biases(&self) -> &AliasTensor {
        &self.dense.biases
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        let version = ser::read_version(input, FC, &[FC_VERSION, FC_VERSION_ALWAYS_BIAS])?;
        let mut dense = Projection::read(input)?;
        let multipliers = ser::read_multipliers(input)?;
        dense.use_bias = if version == FC_VERSION {
            ser::read_bool(input)?
        } else {
            true
        };
        if dense.use_bias && !dense.params.is_empty() && dense.biases.size() != dense.num_outputs {
            return Err(LayerError::Malformed(format!(
                "{FC} record has a bias region of {} values for {} outputs",
                dense.biases.size(),
                dense.num_outputs
            )));
        }
        Ok(Self {
            state: dense.state(),
            dense,
            multipliers,
            seed: crate::rng::DEFAULT_SEED,
        })
    }
}

impl Layer for Fc {
    fn name(&self) -> &'static str {
        FC
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        let input = sub.output();
        checks::expect_non_empty(FC, input)?;
        self.dense.allocate(FC, input.shape().sample_size(), self.seed)?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(FC)?;
        let input = sub.output();
        checks::expect_sample_size(FC, input, self.dense.num_inputs)?;
        let rows = input.num_samples();
        output.set_size(TensorShape::new(rows, self.dense.num_outputs, 1, 1));
        self.dense.forward(input.host(), rows, output.host_mut())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(FC)?;
        checks::expect_gradient(FC, gradient_input, computed_output)?;
        let rows = gradient_input.num_samples();
        let (input, grad) = sub.output_and_gradient()?;
        if self.multipliers.learning_rate != 0.0 {
            checks::expect_params_grad(FC, params_grad, &self.dense.params)?;
            self.dense
                .params_gradient(input.host(), gradient_input.host(), rows, 1.0, params_grad)?;
        }
        self.dense.data_gradient(gradient_input.host(), rows, grad.host_mut())
    }

    fn params(&self) -> &Tensor {
        &self.dense.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.dense.params
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, FC_VERSION)?;
        self.dense.write(out)?;
        ser::write_multipliers(out, &self.multipliers)?;
        ser::write_bool(out, self.dense.use_bias)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(input)?;
        let seed = self.seed;
        *self = Self { seed, ..loaded };
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<fc num_outputs='{}'{} use_bias='{}'>\n{}</fc>\n",
            self.dense.num_outputs,
            self.multipliers.xml_attrs(),
            self.dense.use_bias,
            ser::tensor_text(&self.dense.params)
        )
    }
}

impl fmt::Display for Fc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fc\t (num_outputs={}){}",
            self.dense.num_outputs,
            self.multipliers.summary(self.dense.use_bias)
        )
    }
}

pub fn read_fc(input: &mut dyn Read) -> Result<Fc> {
    Fc::read_record(input)
}

const LINEAR: &str = "linear";
const LINEAR_VERSION: &str = "linear_";

/// Projection of the `nc` axis.
#[derive(Debug, Clone)]
pub struct Linear {
    dense: Projection,
    learning_rate_multiplier: f64,
    seed: u64,
    state: LayerState,
}

impl Linear {
    pub fn new(num_outputs: usize, use_bias: bool) -> Result<Self> {
        checks::expect_positive(LINEAR, "num_outputs", num_outputs)?;
        Ok(Self {
            dense: Projection::new(num_outputs, use_bias),
            learning_rate_multiplier: 1.0,
            seed: crate::rng::DEFAULT_SEED,
            state: LayerState::Uninitialized,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn num_outputs(&self) -> usize {
        self.dense.num_outputs
    }

    pub fn num_inputs(&self) -> usize {
        self.dense.num_inputs
    }

    pub fn set_num_outputs(&mut self, num: usize) -> Result<()> {
        checks::expect_positive(LINEAR, "num_outputs", num)?;
        if num != self.dense.num_outputs && !self.dense.params.is_empty() {
            return Err(LayerError::config(
                LINEAR,
                "cannot change num_outputs once parameters are allocated",
            ));
        }
        self.dense.num_outputs = num;
        Ok(())
    }

    pub fn use_bias(&self) -> bool {
        self.dense.use_bias
    }

    pub fn learning_rate_multiplier(&self) -> f64 {
        self.learning_rate_multiplier
    }

    pub fn set_learning_rate_multiplier(&mut self, value: f64) {
        self.learning_rate_multiplier = value;
    }

    pub fn weights(&self) -> &AliasTensor {
        &self.dense.weights
    }

    pub fn biases(&self) -> &AliasTensor {
        &self.dense.biases
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, LINEAR, &[LINEAR_VERSION])?;
        let mut dense = Projection::read(input)?;
        dense.use_bias = match ser::read_i64(input)? {
            0 => true,
            1 => false,
            other => return Err(LayerError::Malformed(format!("unknown linear bias mode {other}"))),
        };
        let learning_rate_multiplier = ser::read_f64(input)?;
        Ok(Self {
            state: dense.state(),
            dense,
            learning_rate_multiplier,
            seed: crate::rng::DEFAULT_SEED,
        })
    }
}

impl Layer for Linear {
    fn name(&self) -> &'static str {
        LINEAR
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        let input = sub.output();
        checks::expect_non_empty(LINEAR, input)?;
        self.dense.allocate(LINEAR, input.nc(), self.seed)?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(LINEAR)?;
        let input = sub.output();
        if input.nc() != self.dense.num_inputs {
            return Err(LayerError::shape(
                LINEAR,
                format!("expected nc = {}, got input {}", self.dense.num_inputs, input.shape()),
            ));
        }
        let s = input.shape();
        let rows = s.num_samples * s.k * s.nr;
        output.set_size(TensorShape::new(s.num_samples, s.k, s.nr, self.dense.num_outputs));
        self.dense.forward(input.host(), rows, output.host_mut())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(LINEAR)?;
        checks::expect_gradient(LINEAR, gradient_input, computed_output)?;
        let s = gradient_input.shape();
        let rows = s.num_samples * s.k * s.nr;
        let (input, grad) = sub.output_and_gradient()?;
        if self.learning_rate_multiplier != 0.0 {
            checks::expect_params_grad(LINEAR, params_grad, &self.dense.params)?;
            self.dense.params_gradient(
                input.host(),
                gradient_input.host(),
                rows,
                self.learning_rate_multiplier as f32,
                params_grad,
            )?;
        }
        self.dense.data_gradient(gradient_input.host(), rows, grad.host_mut())
    }

    fn params(&self) -> &Tensor {
        &self.dense.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.dense.params
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, LINEAR_VERSION)?;
        self.dense.write(out)?;
        ser::write_i64(out, if self.dense.use_bias { 0 } else { 1 })?;
        ser::write_f64(out, self.learning_rate_multiplier)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(input)?;
        check_field(LINEAR, "bias", self.dense.use_bias, loaded.dense.use_bias)?;
        let seed = self.seed;
        *self = Self { seed, ..loaded };
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<linear num_outputs='{}' bias='{}' learning_rate_mult='{}'>\n{}</linear>\n",
            self.dense.num_outputs,
            self.dense.use_bias,
            self.learning_rate_multiplier,
            ser::tensor_text(&self.dense.params)
        )
    }
}

impl fmt::Display for Linear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "linear\t (num_outputs={}, bias={}) learning_rate_mult={}",
            self.dense.num_outputs, self.dense.use_bias, self.learning_rate_multiplier
        )
    }
}

pub fn read_linear(input: &mut dyn Read) -> Result<Linear> {
    Linear::read_record(input)
}
