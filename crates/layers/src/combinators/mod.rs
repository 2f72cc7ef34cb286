//! Layers that combine their input with the output of an earlier, tagged
//! position in the stack.
//!
//! Each combinator names its partner by [`TagId`]; the container resolves the
//! id when the stack is built and hands the partner's output and gradient
//! slot through [`Subnet`]. Backward always adds into both slots.

pub mod concat;
pub mod prev;

use std::fmt;
use std::io::{Read, Write};

pub use concat::{read_concat, Concat};
pub use prev::{
    read_add_prev, read_mult_prev, read_resize_prev_to_tagged, read_scale, read_scale_prev,
    AddPrev, MultPrev, ResizePrevToTagged, Scale, ScalePrev,
};

use crate::serialize::{self as ser, check_field};
use crate::{checks, Layer, LayerError, LayerState, Result, Subnet, TagId, Tensor};

/// The computation a [`Tagged`] layer performs.
pub trait TaggedOp: fmt::Debug + Clone + Default {
    const NAME: &'static str;
    const VERSION: &'static str;

    fn forward(&mut self, input: &Tensor, tagged: &Tensor, output: &mut Tensor) -> Result<()>;

    /// Adds into `sub`'s input gradient and into the gradient slot of `tag`.
    fn backward(&mut self, gradient_input: &Tensor, sub: &mut dyn Subnet, tag: TagId) -> Result<()>;
}

/// A parameter-free layer reading one tagged position.
#[derive(Debug, Clone)]
pub struct Tagged<O> {
    tag: TagId,
    op: O,
    params: Tensor,
    state: LayerState,
}

impl<O: TaggedOp> Tagged<O> {
    pub fn new(tag: TagId) -> Self {
        Self {
            tag,
            op: O::default(),
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }

    pub fn tag(&self) -> TagId {
        self.tag
    }

    /// Reads a record written by [`Layer::serialize`]; the result is ready.
    pub fn read_record(input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, O::NAME, &[O::VERSION])?;
        let tag = TagId::try_from(ser::read_u64(input)?)
            .map_err(|_| LayerError::Malformed(format!("{} tag out of range", O::NAME)))?;
        let mut loaded = Self::new(tag);
        loaded.state = LayerState::Ready;
        Ok(loaded)
    }
}

impl<O: TaggedOp> Layer for Tagged<O> {
    fn name(&self) -> &'static str {
        O::NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(O::NAME, sub.output())?;
        sub.tagged_output(self.tag)?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(O::NAME)?;
        let tagged = sub.tagged_output(self.tag)?;
        self.op.forward(sub.output(), tagged, output)
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(O::NAME)?;
        checks::expect_gradient(O::NAME, gradient_input, computed_output)?;
        self.op.backward(gradient_input, sub, self.tag)
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, O::VERSION)?;
        ser::write_u64(out, u64::from(self.tag))
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(input)?;
        check_field(O::NAME, "tag", self.tag, loaded.tag)?;
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!("<{} tag='{}'/>\n", O::NAME, self.tag)
    }
}

impl<O: TaggedOp> fmt::Display for Tagged<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", O::NAME, self.tag)
    }
}
