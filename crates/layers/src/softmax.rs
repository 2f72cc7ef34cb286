//! Softmax over channels, over planes, or over a whole sample.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::serialize as ser;
use crate::{checks, Layer, LayerError, LayerState, Result, Subnet, Tensor, TensorShape};

/// Axis a [`Softmax`] normalizes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftmaxMode {
    /// Over `k` at every `(r, c)` position.
    #[default]
    ChannelWise,
    /// Over every `nr × nc` plane.
    PlaneWise,
}

impl SoftmaxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SoftmaxMode::ChannelWise => "channel_wise",
            SoftmaxMode::PlaneWise => "plane_wise",
        }
    }

    fn parse(text: &str) -> Result<Self> {
        match text {
            "channel_wise" => Ok(SoftmaxMode::ChannelWise),
            "plane_wise" => Ok(SoftmaxMode::PlaneWise),
            other => Err(LayerError::Malformed(format!("unknown softmax mode '{other}'"))),
        }
    }
}

impl fmt::Display for SoftmaxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of elements normalized together: `len` values, `stride` apart.
#[derive(Debug, Clone, Copy)]
struct Group {
    start: usize,
    stride: usize,
    len: usize,
}

impl Group {
    fn indices(self) -> impl Iterator<Item = usize> {
        (0..self.len).map(move |i| self.start + i * self.stride)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extent {
    Channels,
    Plane,
    Sample,
}

fn groups(shape: TensorShape, extent: Extent) -> Vec<Group> {
    let plane = shape.plane_size();
    let sample = shape.sample_size();
    match extent {
        Extent::Channels => (0..shape.num_samples)
            .flat_map(|n| {
                (0..plane).map(move |p| Group {
                    start: n * sample + p,
                    stride: plane,
                    len: shape.k,
                })
            })
            .collect(),
        Extent::Plane => (0..shape.num_samples * shape.k)
            .map(|i| Group {
                start: i * plane,
                stride: 1,
                len: plane,
            })
            .collect(),
        Extent::Sample => (0..shape.num_samples)
            .map(|n| Group {
                start: n * sample,
                stride: 1,
                len: sample,
            })
            .collect(),
    }
}

fn softmax_forward(output: &mut Tensor, input: &Tensor, extent: Extent) {
    output.set_size(input.shape());
    let x = input.host();
    let y = output.host_mut();
    for group in groups(input.shape(), extent) {
        let max = group.indices().map(|i| x[i]).fold(f32::NEG_INFINITY, f32::max);
        let mut total = 0.0f32;
        for i in group.indices() {
            y[i] = (x[i] - max).exp();
            total += y[i];
        }
        for i in group.indices() {
            y[i] /= total;
        }
    }
}

/// `dx += y ⊙ (g − ⟨y, g⟩)` per group.
fn softmax_backward(grad: &mut Tensor, output: &Tensor, gradient_input: &Tensor, extent: Extent) {
    let y = output.host();
    let g = gradient_input.host();
    let dx = grad.host_mut();
    for group in groups(output.shape(), extent) {
        let dot: f32 = group.indices().map(|i| y[i] * g[i]).sum();
        for i in group.indices() {
            dx[i] += y[i] * (g[i] - dot);
        }
    }
}

const NAME: &str = "softmax";
const VERSION: &str = "softmax_";

#[derive(Debug, Clone, Default)]
pub struct Softmax {
    mode: SoftmaxMode,
    params: Tensor,
    state: LayerState,
}

impl Softmax {
    pub fn new(mode: SoftmaxMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn channel_wise() -> Self {
        Self::new(SoftmaxMode::ChannelWise)
    }

    pub fn plane_wise() -> Self {
        Self::new(SoftmaxMode::PlaneWise)
    }

    pub fn mode(&self) -> SoftmaxMode {
        self.mode
    }

    fn extent(&self) -> Extent {
        match self.mode {
            SoftmaxMode::ChannelWise => Extent::Channels,
            SoftmaxMode::PlaneWise => Extent::Plane,
        }
    }
}

impl Layer for Softmax {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(NAME, sub.output())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        softmax_forward(output, sub.output(), self.extent());
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
        checks::expect_gradient(NAME, gradient_input, computed_output)?;
        let grad = sub.gradient_input()?;
        checks::expect_same_shape(NAME, grad, computed_output)?;
        softmax_backward(grad, computed_output, gradient_input, self.extent());
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
        ser::write_str(out, self.mode.as_str())
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = read_softmax(input)?;
        ser::check_field(NAME, "mode", self.mode, loaded.mode)?;
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!("<softmax mode='{}'/>\n", self.mode)
    }
}

impl fmt::Display for Softmax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "softmax (mode={})", self.mode)
    }
}

pub fn read_softmax(input: &mut dyn Read) -> Result<Softmax> {
    ser::read_version(input, NAME, &[VERSION])?;
    let mode = SoftmaxMode::parse(&ser::read_str(input)?)?;
    Ok(Softmax {
        mode,
        params: Tensor::new(),
        state: LayerState::Ready,
    })
}

const ALL_NAME: &str = "softmax_all";
const ALL_VERSION: &str = "softmax_all_";

/// Softmax across all `k·nr·nc` values of each sample.
#[derive(Debug, Clone, Default)]
pub struct SoftmaxAll {
    params: Tensor,
    state: LayerState,
}

impl SoftmaxAll {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for SoftmaxAll {
    fn name(&self) -> &'static str {
        ALL_NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(ALL_NAME, sub.output())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(ALL_NAME)?;
        softmax_forward(output, sub.output(), Extent::Sample);
        Ok(())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(ALL_NAME)?;
        checks::expect_gradient(ALL_NAME, gradient_input, computed_output)?;
        let grad = sub.gradient_input()?;
        checks::expect_same_shape(ALL_NAME, grad, computed_output)?;
        softmax_backward(grad, computed_output, gradient_input, Extent::Sample);
        Ok(())
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, ALL_VERSION)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        *self = read_softmax_all(input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        "<softmax_all/>\n".to_string()
    }
}

impl fmt::Display for SoftmaxAll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "softmax_all")
    }
}

pub fn read_softmax_all(input: &mut dyn Read) -> Result<SoftmaxAll> {
    ser::read_version(input, ALL_NAME, &[ALL_VERSION])?;
    Ok(SoftmaxAll {
        params: Tensor::new(),
        state: LayerState::Ready,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients, random_tensor, GradCheck};
    use crate::Bindings;
    use candle_core::Device;
    use std::io::Cursor;

    fn run(layer: &mut dyn Layer, input: &Tensor) -> Result<Tensor> {
        let bindings = Bindings::new(input.clone());
        layer.setup(&bindings)?;
        let mut out = Tensor::new();
        layer.forward(&bindings, &mut out)?;
        Ok(out)
    }

    #[test]
    fn channel_wise_matches_candle_over_dim_one() -> Result<()> {
        let input = random_tensor(TensorShape::new(2, 4, 3, 3), 1);
        let out = run(&mut Softmax::channel_wise(), &input)?;
        let reference = candle_nn::ops::softmax(&input.to_candle(&Device::Cpu)?, 1)?;
        assert!(out.max_abs_diff(&Tensor::from_candle(&reference)?) < 1e-6);
        Ok(())
    }

    #[test]
    fn plane_wise_matches_candle_over_flattened_planes() -> Result<()> {
        let shape = TensorShape::new(2, 3, 2, 4);
        let input = random_tensor(shape, 2);
        let out = run(&mut Softmax::plane_wise(), &input)?;
        let flat = input.to_candle(&Device::Cpu)?.reshape((2, 3, 8))?;
        let reference = candle_nn::ops::softmax(&flat, 2)?.reshape((2, 3, 2, 4))?;
        assert!(out.max_abs_diff(&Tensor::from_candle(&reference)?) < 1e-6);
        Ok(())
    }

    #[test]
    fn softmax_all_sums_to_one_per_sample() -> Result<()> {
        let input = random_tensor(TensorShape::new(3, 2, 2, 2), 3);
        let out = run(&mut SoftmaxAll::new(), &input)?;
        for n in 0..3 {
            let total: f32 = out.sample(n).iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn gradients_match_finite_differences() -> Result<()> {
        let shape = TensorShape::new(2, 3, 2, 2);
        let layers: [Box<dyn Layer>; 3] = [
            Box::new(Softmax::channel_wise()),
            Box::new(Softmax::plane_wise()),
            Box::new(SoftmaxAll::new()),
        ];
        for mut layer in layers {
            let report = check_gradients(layer.as_mut(), Bindings::new(random_tensor(shape, 4)), GradCheck::default())?;
            assert!(report.passes(1e-2), "{layer}: {report:?}");
        }
        Ok(())
    }

    #[test]
    fn mode_is_checked_on_load() -> Result<()> {
        let mut bytes = Vec::new();
        Softmax::plane_wise().serialize(&mut bytes)?;
        assert_eq!(read_softmax(&mut Cursor::new(bytes.clone()))?.mode(), SoftmaxMode::PlaneWise);
        let mut target = Softmax::channel_wise();
        assert!(matches!(
            target.deserialize(&mut Cursor::new(bytes)),
            Err(LayerError::FieldMismatch { .. })
        ));
        assert_eq!(target.to_string(), "softmax (mode=channel_wise)");
        Ok(())
    }
}
