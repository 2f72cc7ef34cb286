//! Swaps the row and column axes of every plane.

use std::fmt;
use std::io::{Read, Write};

use crate::serialize as ser;
use crate::{checks, DPoint, Layer, LayerState, Result, Subnet, Tensor, TensorShape};

const NAME: &str = "transpose";
const VERSION: &str = "transpose_";

#[derive(Debug, Clone, Default)]
pub struct Transpose {
    params: Tensor,
    state: LayerState,
}

impl Transpose {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `dst[p, c, r] (+)= src[p, r, c]` for every plane `p` of `src`.
fn transpose_planes(dst: &mut [f32], src: &[f32], shape: TensorShape, accumulate: bool) {
    let (nr, nc) = (shape.nr, shape.nc);
    let plane = nr * nc;
    for (d, s) in dst.chunks_mut(plane).zip(src.chunks(plane)) {
        for r in 0..nr {
            for c in 0..nc {
                let v = s[r * nc + c];
                if accumulate {
                    d[c * nr + r] += v;
                } else {
                    d[c * nr + r] = v;
                }
            }
        }
    }
}

impl Layer for Transpose {
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
        let input = sub.output();
        let s = input.shape();
        output.set_size(TensorShape::new(s.num_samples, s.k, s.nc, s.nr));
        transpose_planes(output.host_mut(), input.host(), s, false);
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
        transpose_planes(grad.host_mut(), gradient_input.host(), gradient_input.shape(), true);
        Ok(())
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn map_input_to_output(&self, p: DPoint) -> DPoint {
        DPoint::new(p.y, p.x)
    }

    fn map_output_to_input(&self, p: DPoint) -> DPoint {
        DPoint::new(p.y, p.x)
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, VERSION)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        *self = read_transpose(input)?;
        Ok(())
    }

    fn to_xml(&self) -> String {
        "<transpose/>\n".to_string()
    }
}

impl fmt::Display for Transpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transpose")
    }
}

pub fn read_transpose(input: &mut dyn Read) -> Result<Transpose> {
    ser::read_version(input, NAME, &[VERSION])?;
    Ok(Transpose {
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

    #[test]
    fn matches_candle_transpose() -> Result<()> {
        let input = random_tensor(TensorShape::new(2, 3, 4, 5), 6);
        let mut layer = Transpose::new();
        let bindings = Bindings::new(input.clone());
        layer.setup(&bindings)?;
        let mut out = Tensor::new();
        layer.forward(&bindings, &mut out)?;
        let reference = input.to_candle(&Device::Cpu)?.transpose(2, 3)?.contiguous()?;
        assert_eq!(out, Tensor::from_candle(&reference)?);
        Ok(())
    }

    #[test]
    fn gradient_is_transposed_back() -> Result<()> {
        let bindings = Bindings::new(random_tensor(TensorShape::new(1, 2, 3, 4), 2));
        let report = check_gradients(&mut Transpose::new(), bindings, GradCheck::default())?;
        assert!(report.passes(1e-3), "{report:?}");
        Ok(())
    }

    #[test]
    fn coordinate_maps_swap_axes() {
        let layer = Transpose::new();
        assert_eq!(layer.map_input_to_output(DPoint::new(1.0, 4.0)), DPoint::new(4.0, 1.0));
    }
}
