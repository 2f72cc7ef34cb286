//! Channel-wise concatenation of two to five tagged outputs.

use std::fmt;
use std::io::{Read, Write};

use crate::serialize::{self as ser, check_field};
use crate::{Layer, LayerError, LayerState, Result, Subnet, TagId, Tensor, TensorShape};

const NAME: &str = "concat";
const VERSION: &str = "concat_";
const MIN_TAGS: usize = 2;
const MAX_TAGS: usize = 5;

/// Stacks the tagged outputs along `k`, in tag order. The layer's own input
/// is not read and receives no gradient.
#[derive(Debug, Clone)]
pub struct Concat {
    tags: Vec<TagId>,
    params: Tensor,
    state: LayerState,
}

impl Concat {
    pub fn new(tags: &[TagId]) -> Result<Self> {
        if !(MIN_TAGS..=MAX_TAGS).contains(&tags.len()) {
            return Err(LayerError::config(
                NAME,
                format!("expected {MIN_TAGS} to {MAX_TAGS} tags, got {}", tags.len()),
            ));
        }
        Ok(Self {
            tags: tags.to_vec(),
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        })
    }

    pub fn tags(&self) -> &[TagId] {
        &self.tags
    }

    /// Shape of the concatenation; every source must agree on `n`, `nr`, `nc`.
    fn output_shape(&self, sub: &dyn Subnet) -> Result<TensorShape> {
        let first = sub.tagged_output(self.tags[0])?.shape();
        let mut k = 0;
        for &tag in &self.tags {
            let s = sub.tagged_output(tag)?.shape();
            if (s.num_samples, s.nr, s.nc) != (first.num_samples, first.nr, first.nc) {
                return Err(LayerError::shape(
                    NAME,
                    format!("tag {tag} output {s} does not stack with {first}"),
                ));
            }
            k += s.k;
        }
        Ok(TensorShape::new(first.num_samples, k, first.nr, first.nc))
    }

    fn tag_list(&self) -> String {
        self.tags.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(",")
    }
}

impl Layer for Concat {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        self.output_shape(sub)?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        let shape = self.output_shape(sub)?;
        output.set_size(shape);
        let out_sample = shape.sample_size();
        let mut offset = 0;
        for &tag in &self.tags {
            let src = sub.tagged_output(tag)?;
            let len = src.shape().sample_size();
            for n in 0..shape.num_samples {
                let start = n * out_sample + offset;
                output.host_mut()[start..start + len].copy_from_slice(src.sample(n));
            }
            offset += len;
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
        self.state.ensure_ready(NAME)?;
        crate::checks::expect_gradient(NAME, gradient_input, computed_output)?;
        let out_sample = gradient_input.shape().sample_size();
        let mut offset = 0;
        for &tag in &self.tags {
            let grad = sub.tagged_gradient_input(tag)?;
            let len = grad.shape().sample_size();
            if offset + len > out_sample {
                return Err(LayerError::shape(NAME, "gradient narrower than the concatenation"));
            }
            for n in 0..grad.num_samples() {
                let start = n * out_sample + offset;
                let slice = &gradient_input.host()[start..start + len];
                for (d, g) in grad.sample_mut(n).iter_mut().zip(slice) {
                    *d += g;
                }
            }
            offset += len;
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
        ser::write_str(out, VERSION)?;
        ser::write_usize(out, self.tags.len())?;
        for &tag in &self.tags {
            ser::write_u64(out, u64::from(tag))?;
        }
        Ok(())
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = read_concat(input)?;
        check_field(NAME, "tag count", self.tags.len(), loaded.tags.len())?;
        check_field(NAME, "tags", self.tag_list(), loaded.tag_list())?;
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!("<concat tags='{}'/>\n", self.tag_list())
    }
}

impl fmt::Display for Concat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "concat\t ({})", self.tag_list())
    }
}

pub fn read_concat(input: &mut dyn Read) -> Result<Concat> {
    ser::read_version(input, NAME, &[VERSION])?;
    let count = ser::read_usize(input)?;
    if !(MIN_TAGS..=MAX_TAGS).contains(&count) {
        return Err(LayerError::Malformed(format!("invalid concat tag count {count}")));
    }
    let mut tags = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = ser::read_u64(input)?;
        tags.push(
            TagId::try_from(tag)
                .map_err(|_| LayerError::Malformed(format!("concat tag {tag} out of range")))?,
        );
    }
    let mut loaded = Concat::new(&tags)?;
    loaded.state = LayerState::Ready;
    Ok(loaded)
}
