//! Bilinear spatial resizing: by integer factor (`upsample`) or to a fixed
//! extent (`resize_to`).

use std::fmt;
use std::io::{Read, Write};

use crate::backend;
use crate::serialize::{self as ser, check_field};
use crate::{checks, DPoint, Layer, LayerState, Result, Subnet, Tensor, TensorShape};

#[derive(Debug, Clone)]
pub struct Upsample {
    scale_y: usize,
    scale_x: usize,
    params: Tensor,
    state: LayerState,
}

impl Upsample {
    const NAME: &'static str = "upsample";
    const VERSION: &'static str = "upsample_";

    pub fn new(scale_y: usize, scale_x: usize) -> Result<Self> {
        checks::expect_positive(Self::NAME, "scale_y", scale_y)?;
        checks::expect_positive(Self::NAME, "scale_x", scale_x)?;
        Ok(Self {
            scale_y,
            scale_x,
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        })
    }

    pub fn scale(&self) -> (usize, usize) {
        (self.scale_y, self.scale_x)
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, Self::NAME, &[Self::VERSION])?;
        let scale_y = ser::read_usize(input)?;
        let scale_x = ser::read_usize(input)?;
        let mut loaded = Self::new(scale_y, scale_x)?;
        loaded.state = LayerState::Ready;
        Ok(loaded)
    }
}

impl Layer for Upsample {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(Self::NAME, sub.output())?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(Self::NAME)?;
        let input = sub.output();
        let s = input.shape();
        output.set_size(TensorShape::new(
            s.num_samples,
            s.k,
            s.nr * self.scale_y,
            s.nc * self.scale_x,
        ));
        backend::resize_bilinear(output, input)
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(Self::NAME)?;
        checks::expect_gradient(Self::NAME, gradient_input, computed_output)?;
        backend::resize_bilinear_gradient(sub.gradient_input()?, gradient_input)
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn map_input_to_output(&self, p: DPoint) -> DPoint {
        DPoint::new(p.x * self.scale_x as f64, p.y * self.scale_y as f64)
    }

    fn map_output_to_input(&self, p: DPoint) -> DPoint {
        DPoint::new(p.x / self.scale_x as f64, p.y / self.scale_y as f64)
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, Self::VERSION)?;
        ser::write_usize(out, self.scale_y)?;
        ser::write_usize(out, self.scale_x)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(input)?;
        check_field(Self::NAME, "scale_y", self.scale_y, loaded.scale_y)?;
        check_field(Self::NAME, "scale_x", self.scale_x, loaded.scale_x)?;
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<upsample scale_y='{}' scale_x='{}'/>\n",
            self.scale_y, self.scale_x
        )
    }
}

impl fmt::Display for Upsample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "upsample\t (scale_y={}, scale_x={})",
            self.scale_y, self.scale_x
        )
    }
}

pub fn read_upsample(input: &mut dyn Read) -> Result<Upsample> {
    Upsample::read_record(input)
}

/// Resamples every plane to a fixed `nr × nc`.
///
/// The coordinate maps use the scale observed at the last `setup`.
#[derive(Debug, Clone)]
pub struct ResizeTo {
    nr: usize,
    nc: usize,
    scale_y: f64,
    scale_x: f64,
    params: Tensor,
    state: LayerState,
}

impl ResizeTo {
    const NAME: &'static str = "resize_to";
    const VERSION: &'static str = "resize_to_";

    pub fn new(nr: usize, nc: usize) -> Result<Self> {
        checks::expect_positive(Self::NAME, "nr", nr)?;
        checks::expect_positive(Self::NAME, "nc", nc)?;
        Ok(Self {
            nr,
            nc,
            scale_y: 1.0,
            scale_x: 1.0,
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        })
    }

    pub fn target(&self) -> (usize, usize) {
        (self.nr, self.nc)
    }

    fn read_record(input: &mut dyn Read) -> Result<Self> {
        ser::read_version(input, Self::NAME, &[Self::VERSION])?;
        let nr = ser::read_usize(input)?;
        let nc = ser::read_usize(input)?;
        let scale_y = ser::read_f64(input)?;
        let scale_x = ser::read_f64(input)?;
        let mut loaded = Self::new(nr, nc)?;
        loaded.scale_y = scale_y;
        loaded.scale_x = scale_x;
        loaded.state = LayerState::Ready;
        Ok(loaded)
    }
}

impl Layer for ResizeTo {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        let input = sub.output();
        checks::expect_non_empty(Self::NAME, input)?;
        self.scale_y = self.nr as f64 / input.nr() as f64;
        self.scale_x = self.nc as f64 / input.nc() as f64;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(Self::NAME)?;
        let input = sub.output();
        output.set_size(TensorShape::new(input.num_samples(), input.k(), self.nr, self.nc));
        backend::resize_bilinear(output, input)
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(Self::NAME)?;
        checks::expect_gradient(Self::NAME, gradient_input, computed_output)?;
        backend::resize_bilinear_gradient(sub.gradient_input()?, gradient_input)
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn map_input_to_output(&self, p: DPoint) -> DPoint {
        DPoint::new(p.x * self.scale_x, p.y * self.scale_y)
    }

    fn map_output_to_input(&self, p: DPoint) -> DPoint {
        DPoint::new(p.x / self.scale_x, p.y / self.scale_y)
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, Self::VERSION)?;
        ser::write_usize(out, self.nr)?;
        ser::write_usize(out, self.nc)?;
        ser::write_f64(out, self.scale_y)?;
        ser::write_f64(out, self.scale_x)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = Self::read_record(input)?;
        check_field(Self::NAME, "nr", self.nr, loaded.nr)?;
        check_field(Self::NAME, "nc", self.nc, loaded.nc)?;
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!("<resize_to nr='{}' nc='{}'/>\n", self.nr, self.nc)
    }
}

impl fmt::Display for ResizeTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resize_to (nr={}, nc={})", self.nr, self.nc)
    }
}

pub fn read_resize_to(input: &mut dyn Read) -> Result<ResizeTo> {
    ResizeTo::read_record(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_gradients, random_tensor, GradCheck};
    use crate::Bindings;

    #[test]
    fn upsample_multiplies_spatial_extent() -> Result<()> {
        let mut up = Upsample::new(2, 3)?;
        let bindings = Bindings::new(random_tensor(TensorShape::new(2, 3, 4, 5), 1));
        up.setup(&bindings)?;
        let mut out = Tensor::new();
        up.forward(&bindings, &mut out)?;
        assert_eq!(out.shape(), TensorShape::new(2, 3, 8, 15));
        // corner-aligned grid keeps the corners
        assert!((out.at(1, 2, 7, 14) - bindings.input().at(1, 2, 3, 4)).abs() < 1e-5);
        assert!((out.at(0, 0, 0, 0) - bindings.input().at(0, 0, 0, 0)).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn resize_to_shrinks_and_grows() -> Result<()> {
        for (nr, nc) in [(3, 2), (9, 11)] {
            let mut resize = ResizeTo::new(nr, nc)?;
            let bindings = Bindings::new(random_tensor(TensorShape::new(1, 2, 6, 6), 2));
            resize.setup(&bindings)?;
            let mut out = Tensor::new();
            resize.forward(&bindings, &mut out)?;
            assert_eq!(out.shape(), TensorShape::new(1, 2, nr, nc));
            let p = resize.map_output_to_input(resize.map_input_to_output(DPoint::new(2.0, 5.0)));
            assert!((p.x - 2.0).abs() < 1e-9 && (p.y - 5.0).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn gradients_match_finite_differences() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(1, 2, 3, 4), 5));
        let report = check_gradients(&mut Upsample::new(2, 2)?, bindings.clone(), GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        let report = check_gradients(&mut ResizeTo::new(5, 2)?, bindings, GradCheck::default())?;
        assert!(report.passes(1e-2), "{report:?}");
        Ok(())
    }

    #[test]
    fn zero_scale_is_rejected() {
        assert!(Upsample::new(0, 2).is_err());
        assert!(ResizeTo::new(4, 0).is_err());
    }
}
