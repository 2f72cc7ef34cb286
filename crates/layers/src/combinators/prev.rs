//! Two-input combinators: the layer input and one tagged output.

use std::io::Read;

use super::{Tagged, TaggedOp};
use crate::backend;
use crate::{checks, LayerError, Result, Subnet, TagId, Tensor, TensorShape};

/// Per-axis maximum of two shapes.
fn union_shape(a: TensorShape, b: TensorShape) -> TensorShape {
    TensorShape::new(
        a.num_samples.max(b.num_samples),
        a.k.max(b.k),
        a.nr.max(b.nr),
        a.nc.max(b.nc),
    )
}

/// Value of `t` at `(n, k, r, c)`, or 0 outside its extent.
#[inline]
fn padded(t: &Tensor, n: usize, k: usize, r: usize, c: usize) -> f32 {
    let s = t.shape();
    if n < s.num_samples && k < s.k && r < s.nr && c < s.nc {
        t.at(n, k, r, c)
    } else {
        0.0
    }
}

/// Writes `op(a, b)` over the union of both extents, zero-padding each.
fn combine_padded(output: &mut Tensor, a: &Tensor, b: &Tensor, op: impl Fn(f32, f32) -> f32) {
    if a.same_dims(b) {
        output.set_size(a.shape());
        for ((o, x), y) in output.host_mut().iter_mut().zip(a.host()).zip(b.host()) {
            *o = op(*x, *y);
        }
        return;
    }
    let s = union_shape(a.shape(), b.shape());
    output.set_size(s);
    let mut i = 0;
    let out = output.host_mut();
    for n in 0..s.num_samples {
        for k in 0..s.k {
            for r in 0..s.nr {
                for c in 0..s.nc {
                    out[i] = op(padded(a, n, k, r, c), padded(b, n, k, r, c));
                    i += 1;
                }
            }
        }
    }
}

/// `dst += g · factor` over `dst`'s extent; `factor` is zero-padded, `None`
/// means 1.
fn accumulate_cropped(dst: &mut Tensor, g: &Tensor, factor: Option<&Tensor>) {
    let s = dst.shape();
    let mut i = 0;
    let d = dst.host_mut();
    for n in 0..s.num_samples {
        for k in 0..s.k {
            for r in 0..s.nr {
                for c in 0..s.nc {
                    let f = factor.map_or(1.0, |t| padded(t, n, k, r, c));
                    d[i] += padded(g, n, k, r, c) * f;
                    i += 1;
                }
            }
        }
    }
}

/// Element-wise sum, zero-padded to the larger extent on every axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Add;

impl TaggedOp for Add {
    const NAME: &'static str = "add_prev";
    const VERSION: &'static str = "add_prev_";

    fn forward(&mut self, input: &Tensor, tagged: &Tensor, output: &mut Tensor) -> Result<()> {
        combine_padded(output, input, tagged, |a, b| a + b);
        Ok(())
    }

    fn backward(&mut self, gradient_input: &Tensor, sub: &mut dyn Subnet, tag: TagId) -> Result<()> {
        accumulate_cropped(sub.gradient_input()?, gradient_input, None);
        accumulate_cropped(sub.tagged_gradient_input(tag)?, gradient_input, None);
        Ok(())
    }
}

/// Element-wise product, zero-padded to the larger extent on every axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mult;

impl TaggedOp for Mult {
    const NAME: &'static str = "mult_prev";
    const VERSION: &'static str = "mult_prev_";

    fn forward(&mut self, input: &Tensor, tagged: &Tensor, output: &mut Tensor) -> Result<()> {
        combine_padded(output, input, tagged, |a, b| a * b);
        Ok(())
    }

    fn backward(&mut self, gradient_input: &Tensor, sub: &mut dyn Subnet, tag: TagId) -> Result<()> {
        let input = sub.output().clone();
        accumulate_cropped(sub.tagged_gradient_input(tag)?, gradient_input, Some(&input));
        let tagged = sub.tagged_output(tag)?.clone();
        accumulate_cropped(sub.gradient_input()?, gradient_input, Some(&tagged));
        Ok(())
    }
}

/// `src` must be `(n, k, nr, nc)` and `scales` `(n, k, 1, 1)`.
fn check_scales(layer: &'static str, src: &Tensor, scales: &Tensor) -> Result<()> {
    let expected = TensorShape::new(src.num_samples(), src.k(), 1, 1);
    if scales.shape() != expected {
        return Err(LayerError::shape(
            layer,
            format!("scales {} do not match source {}", scales.shape(), src.shape()),
        ));
    }
    Ok(())
}

/// `dst (+)= src · scales[n, k]` plane by plane.
fn scale_channels(dst: &mut Tensor, src: &Tensor, scales: &Tensor, accumulate: bool) {
    let plane = src.shape().plane_size();
    for ((d, s), f) in dst
        .host_mut()
        .chunks_mut(plane)
        .zip(src.host().chunks(plane))
        .zip(scales.host())
    {
        for (dv, sv) in d.iter_mut().zip(s) {
            if accumulate {
                *dv += sv * f;
            } else {
                *dv = sv * f;
            }
        }
    }
}

/// `dst[n, k] += ⟨src[n, k], g[n, k]⟩` over each plane.
fn accumulate_plane_dots(dst: &mut Tensor, src: &Tensor, g: &Tensor) {
    let plane = src.shape().plane_size();
    for ((d, s), gp) in dst
        .host_mut()
        .iter_mut()
        .zip(src.host().chunks(plane))
        .zip(g.host().chunks(plane))
    {
        *d += s.iter().zip(gp).map(|(a, b)| a * b).sum::<f32>();
    }
}

/// Scales the tagged output's channels by the layer input, shaped `(n, k, 1, 1)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaleOp;

impl TaggedOp for ScaleOp {
    const NAME: &'static str = "scale";
    const VERSION: &'static str = "scale_";

    fn forward(&mut self, input: &Tensor, tagged: &Tensor, output: &mut Tensor) -> Result<()> {
        check_scales(Self::NAME, tagged, input)?;
        output.set_size(tagged.shape());
        scale_channels(output, tagged, input, false);
        Ok(())
    }

    fn backward(&mut self, gradient_input: &Tensor, sub: &mut dyn Subnet, tag: TagId) -> Result<()> {
        let scales = sub.output().clone();
        let src_grad = sub.tagged_gradient_input(tag)?;
        checks::expect_same_shape(Self::NAME, src_grad, gradient_input)?;
        scale_channels(src_grad, gradient_input, &scales, true);
        let src = sub.tagged_output(tag)?.clone();
        accumulate_plane_dots(sub.gradient_input()?, &src, gradient_input);
        Ok(())
    }
}

/// Scales the layer input's channels by the tagged output, shaped `(n, k, 1, 1)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalePrevOp;

impl TaggedOp for ScalePrevOp {
    const NAME: &'static str = "scale_prev";
    const VERSION: &'static str = "scale_prev_";

    fn forward(&mut self, input: &Tensor, tagged: &Tensor, output: &mut Tensor) -> Result<()> {
        check_scales(Self::NAME, input, tagged)?;
        output.set_size(input.shape());
        scale_channels(output, input, tagged, false);
        Ok(())
    }

    fn backward(&mut self, gradient_input: &Tensor, sub: &mut dyn Subnet, tag: TagId) -> Result<()> {
        let scales = sub.tagged_output(tag)?.clone();
        let (src, grad) = sub.output_and_gradient()?;
        checks::expect_same_shape(Self::NAME, grad, gradient_input)?;
        scale_channels(grad, gradient_input, &scales, true);
        let src = src.clone();
        accumulate_plane_dots(sub.tagged_gradient_input(tag)?, &src, gradient_input);
        Ok(())
    }
}

/// Bilinearly resamples the layer input to the tagged output's `nr × nc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResizeToTaggedOp;

impl TaggedOp for ResizeToTaggedOp {
    const NAME: &'static str = "resize_prev_to_tagged";
    const VERSION: &'static str = "resize_prev_to_tagged_";

    fn forward(&mut self, input: &Tensor, tagged: &Tensor, output: &mut Tensor) -> Result<()> {
        if input.num_samples() != tagged.num_samples() {
            return Err(LayerError::shape(
                Self::NAME,
                format!("input {} and tagged {} differ in samples", input.shape(), tagged.shape()),
            ));
        }
        output.set_size(TensorShape::new(input.num_samples(), input.k(), tagged.nr(), tagged.nc()));
        if input.nr() == tagged.nr() && input.nc() == tagged.nc() {
            output.host_mut().copy_from_slice(input.host());
            Ok(())
        } else {
            backend::resize_bilinear(output, input)
        }
    }

    fn backward(&mut self, gradient_input: &Tensor, sub: &mut dyn Subnet, _tag: TagId) -> Result<()> {
        let grad = sub.gradient_input()?;
        if grad.nr() == gradient_input.nr() && grad.nc() == gradient_input.nc() {
            grad.add_assign(gradient_input)
        } else {
            backend::resize_bilinear_gradient(grad, gradient_input)
        }
    }
}

pub type AddPrev = Tagged<Add>;
pub type MultPrev = Tagged<Mult>;
pub type Scale = Tagged<ScaleOp>;
pub type ScalePrev = Tagged<ScalePrevOp>;
pub type ResizePrevToTagged = Tagged<ResizeToTaggedOp>;

pub fn read_add_prev(input: &mut dyn Read) -> Result<AddPrev> {
    AddPrev::read_record(input)
}

pub fn read_mult_prev(input: &mut dyn Read) -> Result<MultPrev> {
    MultPrev::read_record(input)
}

pub fn read_scale(input: &mut dyn Read) -> Result<Scale> {
    Scale::read_record(input)
}

pub fn read_scale_prev(input: &mut dyn Read) -> Result<ScalePrev> {
    ScalePrev::read_record(input)
}

pub fn read_resize_prev_to_tagged(input: &mut dyn Read) -> Result<ResizePrevToTagged> {
    ResizePrevToTagged::read_record(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients, random_tensor, GradCheck};
    use crate::{Bindings, Layer, LayerError};
    use std::io::Cursor;

    const TAG: TagId = 1;

    #[test]
    fn add_prev_zero_pads_the_smaller_operand() -> Result<()> {
        let a = Tensor::filled(TensorShape::new(1, 1, 2, 2), 1.0);
        let b = Tensor::filled(TensorShape::new(1, 2, 2, 2), 2.0);
        let mut layer = AddPrev::new(TAG);
        let bindings = Bindings::new(a).with_tag(TAG, b);
        layer.setup(&bindings)?;
        let mut out = Tensor::new();
        layer.forward(&bindings, &mut out)?;
        assert_eq!(out.shape(), TensorShape::new(1, 2, 2, 2));
        assert_eq!(out.host(), &[3.0, 3.0, 3.0, 3.0, 2.0, 2.0, 2.0, 2.0]);
        Ok(())
    }

    #[test]
    fn add_and_mult_gradients_reach_both_sources() -> Result<()> {
        let shape = TensorShape::new(2, 2, 2, 3);
        let bindings = || Bindings::new(random_tensor(shape, 1)).with_tag(TAG, random_tensor(shape, 2));
        let report = check_gradients(&mut AddPrev::new(TAG), bindings(), GradCheck::default())?;
        assert!(report.passes(1e-3), "{report:?}");
        let report = check_gradients(&mut MultPrev::new(TAG), bindings(), GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        Ok(())
    }

    #[test]
    fn mult_prev_gradient_with_mismatched_extents() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(1, 2, 3, 3), 3))
            .with_tag(TAG, random_tensor(TensorShape::new(1, 3, 2, 3), 4));
        let report = check_gradients(&mut MultPrev::new(TAG), bindings, GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        Ok(())
    }

    #[test]
    fn scale_layers_weight_channels() -> Result<()> {
        let src = random_tensor(TensorShape::new(2, 3, 2, 2), 5);
        let scales = random_tensor(TensorShape::new(2, 3, 1, 1), 6);

        let mut scale = Scale::new(TAG);
        let bindings = Bindings::new(scales.clone()).with_tag(TAG, src.clone());
        scale.setup(&bindings)?;
        let mut out = Tensor::new();
        scale.forward(&bindings, &mut out)?;
        assert_eq!(out.at(1, 2, 1, 0), src.at(1, 2, 1, 0) * scales.at(1, 2, 0, 0));
        let report = check_gradients(&mut scale, bindings, GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");

        let bindings = Bindings::new(src).with_tag(TAG, scales);
        let report = check_gradients(&mut ScalePrev::new(TAG), bindings, GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        Ok(())
    }

    #[test]
    fn scale_rejects_spatial_scales() -> Result<()> {
        let mut scale = ScalePrev::new(TAG);
        let bindings = Bindings::new(random_tensor(TensorShape::new(1, 2, 3, 3), 1))
            .with_tag(TAG, random_tensor(TensorShape::new(1, 2, 3, 3), 2));
        scale.setup(&bindings)?;
        let err = scale.forward(&bindings, &mut Tensor::new()).unwrap_err();
        assert!(matches!(err, LayerError::Shape { .. }));
        Ok(())
    }

    #[test]
    fn resize_prev_to_tagged_follows_the_tagged_extent() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(1, 2, 3, 3), 1))
            .with_tag(TAG, Tensor::zeros(TensorShape::new(1, 5, 6, 4)));
        let mut layer = ResizePrevToTagged::new(TAG);
        layer.setup(&bindings)?;
        let mut out = Tensor::new();
        layer.forward(&bindings, &mut out)?;
        assert_eq!(out.shape(), TensorShape::new(1, 2, 6, 4));

        let report = check_gradients(&mut layer, bindings, GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        Ok(())
    }

    #[test]
    fn unbound_tag_fails_at_setup() {
        let bindings = Bindings::new(random_tensor(TensorShape::new(1, 1, 2, 2), 1));
        let err = AddPrev::new(4).setup(&bindings).unwrap_err();
        assert!(matches!(err, LayerError::Tag { tag: 4, .. }));
    }

    #[test]
    fn record_echoes_the_tag() -> Result<()> {
        let mut bytes = Vec::new();
        ScalePrev::new(3).serialize(&mut bytes)?;
        assert_eq!(read_scale_prev(&mut Cursor::new(&bytes))?.tag(), 3);
        let mut other = ScalePrev::new(2);
        assert!(matches!(
            other.deserialize(&mut Cursor::new(&bytes)),
            Err(LayerError::FieldMismatch { field: "tag", .. })
        ));
        assert!(read_add_prev(&mut Cursor::new(&bytes)).is_err());
        assert_eq!(AddPrev::new(3).to_string(), "add_prev3");
        Ok(())
    }
}
