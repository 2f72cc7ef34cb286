//! The contract every primitive implements, and the view it is given of the
//! surrounding stack.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::{LayerError, Result, Tensor};

/// Identifier naming an earlier stack position.
pub type TagId = u32;

/// A 2-D spatial coordinate (`x` = column, `y` = row).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DPoint {
    pub x: f64,
    pub y: f64,
}

impl DPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Lifecycle of a layer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerState {
    #[default]
    Uninitialized,
    Ready,
}

impl LayerState {
    /// Errors unless the layer has been set up.
    pub fn ensure_ready(self, layer: &'static str) -> Result<()> {
        match self {
            LayerState::Ready => Ok(()),
            LayerState::Uninitialized => Err(LayerError::NotReady { layer }),
        }
    }
}

/// Learning-rate and weight-decay multipliers for main and bias parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Multipliers {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub bias_learning_rate: f64,
    pub bias_weight_decay: f64,
}

impl Multipliers {
    pub const fn new(
        learning_rate: f64,
        weight_decay: f64,
        bias_learning_rate: f64,
        bias_weight_decay: f64,
    ) -> Self {
        Self {
            learning_rate,
            weight_decay,
            bias_learning_rate,
            bias_weight_decay,
        }
    }
}

impl Multipliers {
    /// Summary fragment; bias multipliers are replaced by `use_bias=false`
    /// when the layer has no bias.
    pub fn summary(&self, use_bias: bool) -> String {
        let mut text = format!(
            " learning_rate_mult={} weight_decay_mult={}",
            self.learning_rate, self.weight_decay
        );
        if use_bias {
            text.push_str(&format!(
                " bias_learning_rate_mult={} bias_weight_decay_mult={}",
                self.bias_learning_rate, self.bias_weight_decay
            ));
        } else {
            text.push_str(" use_bias=false");
        }
        text
    }

    pub fn xml_attrs(&self) -> String {
        format!(
            " learning_rate_mult='{}' weight_decay_mult='{}' bias_learning_rate_mult='{}' bias_weight_decay_mult='{}'",
            self.learning_rate, self.weight_decay, self.bias_learning_rate, self.bias_weight_decay
        )
    }
}

impl Default for Multipliers {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0, 0.0)
    }
}

/// What a layer sees of the stack around it.
///
/// `output` is the previous position's output, i.e. this layer's input.
/// Gradient slots are accumulators: layers add into them.
pub trait Subnet {
    fn output(&self) -> &Tensor;

    fn gradient_input(&mut self) -> Result<&mut Tensor>;

    /// Borrows the input and its gradient slot together.
    fn output_and_gradient(&mut self) -> Result<(&Tensor, &mut Tensor)>;

    fn tagged_output(&self, tag: TagId) -> Result<&Tensor>;

    fn tagged_gradient_input(&mut self, tag: TagId) -> Result<&mut Tensor>;
}

/// Uniform computation contract shared by every primitive.
///
/// `Display` renders the one-line summary used for model inspection.
pub trait Layer: fmt::Display {
    /// Short primitive name, e.g. `"con"`.
    fn name(&self) -> &'static str;

    fn state(&self) -> LayerState;

    /// Allocates parameters and caches against the observed input.
    ///
    /// Calling it again on a ready layer keeps existing parameters when their
    /// size is unchanged and fails otherwise.
    fn setup(&mut self, sub: &dyn Subnet) -> Result<()>;

    /// Inference-mode forward pass.
    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()>;

    /// Training-mode forward pass.
    fn forward_train(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.forward(sub, output)
    }

    /// Adds the input gradient into `sub`'s gradient slots and overwrites
    /// `params_grad`, which must have the same size as [`Layer::params`].
    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        params_grad: &mut Tensor,
    ) -> Result<()>;

    fn params(&self) -> &Tensor;

    fn params_mut(&mut self) -> &mut Tensor;

    fn map_input_to_output(&self, p: DPoint) -> DPoint {
        p
    }

    fn map_output_to_input(&self, p: DPoint) -> DPoint {
        p
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()>;

    /// Replaces this layer's state with a record read from `input`.
    ///
    /// Static fields on disk must match this instance's configuration; on any
    /// failure the layer is left untouched.
    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()>;

    /// XML-ish dump including parameter values.
    fn to_xml(&self) -> String;
}

/// Single-layer harness: one input, its gradient, and optional tagged slots.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    input: Tensor,
    gradient: Tensor,
    tagged: Vec<TaggedSlot>,
}

#[derive(Debug, Clone)]
struct TaggedSlot {
    tag: TagId,
    output: Tensor,
    gradient: Tensor,
}

impl Bindings {
    pub fn new(input: Tensor) -> Self {
        let gradient = Tensor::zeros(input.shape());
        Self {
            input,
            gradient,
            tagged: Vec::new(),
        }
    }

    /// Registers the output of an earlier position under `tag`.
    pub fn with_tag(mut self, tag: TagId, output: Tensor) -> Self {
        let gradient = Tensor::zeros(output.shape());
        self.tagged.retain(|slot| slot.tag != tag);
        self.tagged.push(TaggedSlot {
            tag,
            output,
            gradient,
        });
        self
    }

    pub fn input(&self) -> &Tensor {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Tensor {
        &mut self.input
    }

    pub fn gradient(&self) -> &Tensor {
        &self.gradient
    }

    pub fn tagged_gradient(&self, tag: TagId) -> Result<&Tensor> {
        self.slot(tag).map(|slot| &slot.gradient)
    }

    pub fn tagged_mut(&mut self, tag: TagId) -> Result<&mut Tensor> {
        self.slot_mut(tag).map(|slot| &mut slot.output)
    }

    /// Tags bound so far, in binding order.
    pub fn tags(&self) -> Vec<TagId> {
        self.tagged.iter().map(|slot| slot.tag).collect()
    }

    /// Zeroes every gradient slot, keeping shapes.
    pub fn reset_gradients(&mut self) {
        self.gradient.set_size(self.input.shape());
        for slot in &mut self.tagged {
            slot.gradient.set_size(slot.output.shape());
        }
    }

    fn slot(&self, tag: TagId) -> Result<&TaggedSlot> {
        self.tagged
            .iter()
            .find(|slot| slot.tag == tag)
            .ok_or_else(|| LayerError::tag(tag, "not bound"))
    }

    fn slot_mut(&mut self, tag: TagId) -> Result<&mut TaggedSlot> {
        self.tagged
            .iter_mut()
            .find(|slot| slot.tag == tag)
            .ok_or_else(|| LayerError::tag(tag, "not bound"))
    }
}

impl Subnet for Bindings {
    fn output(&self) -> &Tensor {
        &self.input
    }

    fn gradient_input(&mut self) -> Result<&mut Tensor> {
        if !self.gradient.same_dims(&self.input) {
            self.gradient.set_size(self.input.shape());
        }
        Ok(&mut self.gradient)
    }

    fn output_and_gradient(&mut self) -> Result<(&Tensor, &mut Tensor)> {
        if !self.gradient.same_dims(&self.input) {
            self.gradient.set_size(self.input.shape());
        }
        Ok((&self.input, &mut self.gradient))
    }

    fn tagged_output(&self, tag: TagId) -> Result<&Tensor> {
        self.slot(tag).map(|slot| &slot.output)
    }

    fn tagged_gradient_input(&mut self, tag: TagId) -> Result<&mut Tensor> {
        let slot = self.slot_mut(tag)?;
        if !slot.gradient.same_dims(&slot.output) {
            slot.gradient.set_size(slot.output.shape());
        }
        Ok(&mut slot.gradient)
    }
}
