//! A linear stack of layers with tagged positions.
//!
//! Position 0 is the network input and position `i + 1` the output of layer
//! `i`. A tag names a position; combinators look it up while running and
//! only positions at or below their own input are visible to them.

use std::fmt;
use std::io::{Read, Write};

use layers::serialize as ser;
use layers::{DPoint, Layer, LayerError, LayerState, Result, Subnet, TagId, Tensor};

use crate::catalog::read_layer;

const VERSION: &str = "net_";

/// What layer `position` sees of the stack below it.
struct StackView<'a> {
    outputs: &'a [Tensor],
    gradients: &'a mut [Tensor],
    tags: &'a [(TagId, usize)],
}

impl StackView<'_> {
    fn resolve(&self, tag: TagId) -> Result<usize> {
        let position = self
            .tags
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, p)| *p)
            .ok_or_else(|| LayerError::tag(tag, "no position carries this tag"))?;
        if position >= self.outputs.len() {
            return Err(LayerError::tag(
                tag,
                format!("position {position} is not computed before this layer"),
            ));
        }
        Ok(position)
    }

    fn top(&self) -> usize {
        self.outputs.len() - 1
    }
}

impl Subnet for StackView<'_> {
    fn output(&self) -> &Tensor {
        &self.outputs[self.top()]
    }

    fn gradient_input(&mut self) -> Result<&mut Tensor> {
        let top = self.top();
        Ok(&mut self.gradients[top])
    }

    fn output_and_gradient(&mut self) -> Result<(&Tensor, &mut Tensor)> {
        let top = self.top();
        Ok((&self.outputs[top], &mut self.gradients[top]))
    }

    fn tagged_output(&self, tag: TagId) -> Result<&Tensor> {
        let position = self.resolve(tag)?;
        Ok(&self.outputs[position])
    }

    fn tagged_gradient_input(&mut self, tag: TagId) -> Result<&mut Tensor> {
        let position = self.resolve(tag)?;
        Ok(&mut self.gradients[position])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Inference,
    Training,
}

/// Owns a stack of layers together with every intermediate output and
/// gradient accumulator.
pub struct Net {
    layers: Vec<Box<dyn Layer>>,
    tags: Vec<(TagId, usize)>,
    outputs: Vec<Tensor>,
    gradients: Vec<Tensor>,
    params_grads: Vec<Tensor>,
    last_pass: Option<Pass>,
}

impl Default for Net {
    fn default() -> Self {
        Self::new()
    }
}

impl Net {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            tags: Vec::new(),
            outputs: vec![Tensor::new()],
            gradients: vec![Tensor::new()],
            params_grads: Vec::new(),
            last_pass: None,
        }
    }

    /// Appends a layer on top of the stack.
    pub fn push(&mut self, layer: Box<dyn Layer>) -> &mut Self {
        self.layers.push(layer);
        self.outputs.push(Tensor::new());
        self.gradients.push(Tensor::new());
        self.params_grads.push(Tensor::new());
        self.last_pass = None;
        self
    }

    pub fn with(mut self, layer: impl Layer + 'static) -> Self {
        self.push(Box::new(layer));
        self
    }

    /// Tags the current top of the stack (the input when empty).
    pub fn tag(&mut self, tag: TagId) -> Result<&mut Self> {
        if self.tags.iter().any(|(t, _)| *t == tag) {
            return Err(LayerError::tag(tag, "already bound to another position"));
        }
        self.tags.push((tag, self.layers.len()));
        Ok(self)
    }

    pub fn with_tag(mut self, tag: TagId) -> Result<Self> {
        self.tag(tag)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, index: usize) -> Option<&dyn Layer> {
        self.layers.get(index).map(|l| l.as_ref())
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut (dyn Layer + 'static)> {
        self.layers.get_mut(index).map(|l| l.as_mut())
    }

    /// Position bound to `tag`, if any.
    pub fn tagged_position(&self, tag: TagId) -> Option<usize> {
        self.tags.iter().find(|(t, _)| *t == tag).map(|(_, p)| *p)
    }

    /// Output of the top layer after the last forward pass.
    pub fn output(&self) -> &Tensor {
        &self.outputs[self.layers.len()]
    }

    /// Output at `position` (0 is the input).
    pub fn position_output(&self, position: usize) -> Option<&Tensor> {
        self.outputs.get(position)
    }

    /// Gradient with respect to the network input after the last backward.
    pub fn input_gradient(&self) -> &Tensor {
        &self.gradients[0]
    }

    /// Parameter gradient of layer `index` after the last backward.
    pub fn params_grad(&self, index: usize) -> Option<&Tensor> {
        self.params_grads.get(index)
    }

    pub fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.run(input, Pass::Inference)
    }

    pub fn forward_train(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.run(input, Pass::Training)
    }

    fn run(&mut self, input: &Tensor, pass: Pass) -> Result<&Tensor> {
        let Self {
            layers,
            tags,
            outputs,
            gradients,
            ..
        } = self;
        outputs[0] = input.clone();
        for (i, layer) in layers.iter_mut().enumerate() {
            let (below, above) = outputs.split_at_mut(i + 1);
            let view = StackView {
                outputs: below,
                gradients: &mut gradients[..=i],
                tags: tags.as_slice(),
            };
            if layer.state() == LayerState::Uninitialized {
                layer.setup(&view)?;
                log::debug!("net: set up layer {i} ({})", layer.name());
            }
            match pass {
                Pass::Inference => layer.forward(&view, &mut above[0])?,
                Pass::Training => layer.forward_train(&view, &mut above[0])?,
            }
        }
        self.last_pass = Some(pass);
        Ok(self.output())
    }

    /// Back-propagates `gradient` (with respect to the top output) through
    /// every layer, following the last forward pass.
    pub fn backward(&mut self, gradient: &Tensor) -> Result<()> {
        if self.last_pass.is_none() || self.layers.is_empty() {
            return Err(LayerError::NotReady { layer: "net" });
        }
        if !gradient.same_dims(self.output()) {
            return Err(LayerError::shape(
                "net",
                format!("gradient {} does not match output {}", gradient.shape(), self.output().shape()),
            ));
        }

        let Self {
            layers,
            tags,
            outputs,
            gradients,
            params_grads,
            ..
        } = self;
        for (g, o) in gradients.iter_mut().zip(outputs.iter()) {
            g.set_size(o.shape());
        }
        let top = layers.len();
        gradients[top] = gradient.clone();

        for i in (0..top).rev() {
            let (below, above) = outputs.split_at(i + 1);
            let (grads_below, grads_above) = gradients.split_at_mut(i + 1);
            let mut view = StackView {
                outputs: below,
                gradients: grads_below,
                tags: tags.as_slice(),
            };
            let params_grad = &mut params_grads[i];
            params_grad.set_size(layers[i].params().shape());
            layers[i].backward(&above[0], &grads_above[0], &mut view, params_grad)?;
        }
        Ok(())
    }

    /// Maps a point on the input plane through every layer.
    pub fn map_input_to_output(&self, p: DPoint) -> DPoint {
        self.layers.iter().fold(p, |p, l| l.map_input_to_output(p))
    }

    /// Maps a point on the output plane back to the input.
    pub fn map_output_to_input(&self, p: DPoint) -> DPoint {
        self.layers.iter().rev().fold(p, |p, l| l.map_output_to_input(p))
    }

    pub fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, VERSION)?;
        ser::write_usize(out, self.layers.len())?;
        for layer in &self.layers {
            layer.serialize(out)?;
        }
        ser::write_usize(out, self.tags.len())?;
        for &(tag, position) in &self.tags {
            ser::write_u64(out, u64::from(tag))?;
            ser::write_usize(out, position)?;
        }
        Ok(())
    }

    pub fn deserialize(input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, "net", &[VERSION])?;
        let count = ser::read_usize(input)?;
        let mut net = Net::new();
        for _ in 0..count {
            net.push(read_layer(input)?);
        }
        let tag_count = ser::read_usize(input)?;
        for _ in 0..tag_count {
            let raw = ser::read_u64(input)?;
            let tag = TagId::try_from(raw)
                .map_err(|_| LayerError::Malformed(format!("tag {raw} out of range")))?;
            let position = ser::read_usize(input)?;
            if position > count {
                return Err(LayerError::Malformed(format!(
                    "tag {tag} points at position {position} of a {count} layer stack"
                )));
            }
            if net.tagged_position(tag).is_some() {
                return Err(LayerError::Malformed(format!("tag {tag} bound twice")));
            }
            net.tags.push((tag, position));
        }
        log::info!("net: loaded {} layers and {} tags", count, tag_count);
        Ok(net)
    }

    /// XML-ish dump of every layer, bottom first.
    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<net>\n");
        for (i, layer) in self.layers.iter().enumerate() {
            xml.push_str(&format!("<layer idx='{i}'>\n"));
            xml.push_str(&layer.to_xml());
            xml.push_str("</layer>\n");
        }
        xml.push_str("</net>\n");
        xml
    }
}

impl fmt::Debug for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Net")
            .field("layers", &self.layers.len())
            .field("tags", &self.tags)
            .finish()
    }
}

impl fmt::Display for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in (0..=self.layers.len()).rev() {
            for (tag, _) in self.tags.iter().filter(|(_, p)| *p == i) {
                writeln!(f, "tag{tag}")?;
            }
            if i > 0 {
                writeln!(f, "layer<{}>\t{}", i - 1, self.layers[i - 1])?;
            } else {
                writeln!(f, "input")?;
            }
        }
        Ok(())
    }
}
