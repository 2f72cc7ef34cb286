//! Plane-wise matrix product against a tagged position.

use std::io::Read;

use candle_core::Device;
use layers::combinators::{Tagged, TaggedOp};
use layers::{LayerError, Result, Subnet, TagId, Tensor, TensorShape};

/// `out[n, k] = input[n, k] · tagged[n, k]`, each plane a matrix.
///
/// The input is `(n, k, M, I)` and the tagged output `(n, k, I, N)`; the
/// result is `(n, k, M, N)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultmOp;

pub type MultmPrev = Tagged<MultmOp>;

pub fn read_multm_prev(input: &mut dyn Read) -> Result<MultmPrev> {
    MultmPrev::read_record(input)
}

/// Batched `op(lhs) · op(rhs)` over `(n·k)` planes.
fn plane_matmul(lhs: &Tensor, trans_lhs: bool, rhs: &Tensor, trans_rhs: bool) -> Result<Tensor> {
    let device = Device::Cpu;
    let planes = |t: &Tensor, transposed: bool| -> Result<candle_core::Tensor> {
        let s = t.shape();
        let m = candle_core::Tensor::from_slice(t.host(), (s.num_samples * s.k, s.nr, s.nc), &device)?;
        Ok(if transposed { m.transpose(1, 2)?.contiguous()? } else { m })
    };
    let product = planes(lhs, trans_lhs)?.matmul(&planes(rhs, trans_rhs)?)?;
    let (_, rows, cols) = product.dims3()?;
    let s = lhs.shape();
    Tensor::from_vec(
        TensorShape::new(s.num_samples, s.k, rows, cols),
        product.flatten_all()?.to_vec1::<f32>()?,
    )
}

fn check_operands(input: &Tensor, tagged: &Tensor) -> Result<()> {
    let (a, b) = (input.shape(), tagged.shape());
    if a.num_samples != b.num_samples || a.k != b.k || a.nc != b.nr {
        return Err(LayerError::shape(
            MultmOp::NAME,
            format!("cannot multiply planes of {a} by planes of {b}"),
        ));
    }
    Ok(())
}

impl TaggedOp for MultmOp {
    const NAME: &'static str = "multm_prev";
    const VERSION: &'static str = "multm_prev_";

    fn forward(&mut self, input: &Tensor, tagged: &Tensor, output: &mut Tensor) -> Result<()> {
        check_operands(input, tagged)?;
        *output = plane_matmul(input, false, tagged, false)?;
        Ok(())
    }

    fn backward(&mut self, gradient_input: &Tensor, sub: &mut dyn Subnet, tag: TagId) -> Result<()> {
        let input = sub.output().clone();
        let tagged = sub.tagged_output(tag)?.clone();
        // dA = G · Bᵀ, dB = Aᵀ · G
        let grad_input = plane_matmul(gradient_input, false, &tagged, true)?;
        let grad_tagged = plane_matmul(&input, true, gradient_input, false)?;
        sub.gradient_input()?.add_assign(&grad_input)?;
        sub.tagged_gradient_input(tag)?.add_assign(&grad_tagged)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layers::gradcheck::{check_gradients, random_tensor, GradCheck};
    use layers::{Bindings, Layer};
    use std::io::Cursor;

    fn bindings() -> Bindings {
        Bindings::new(random_tensor(TensorShape::new(2, 2, 3, 4), 1))
            .with_tag(7, random_tensor(TensorShape::new(2, 2, 4, 5), 2))
    }

    #[test]
    fn matches_candle_batched_matmul() -> anyhow::Result<()> {
        let b = bindings();
        let mut layer = MultmPrev::new(7);
        layer.setup(&b)?;
        let mut out = Tensor::new();
        layer.forward(&b, &mut out)?;
        assert_eq!(out.shape(), TensorShape::new(2, 2, 3, 5));

        let device = Device::Cpu;
        let a = b.input().to_candle(&device)?;
        let t = b.tagged_output(7)?.to_candle(&device)?;
        let expected = Tensor::from_candle(&a.matmul(&t)?)?;
        assert!(out.max_abs_diff(&expected) < 1e-5);
        Ok(())
    }

    #[test]
    fn gradients_reach_both_operands() -> anyhow::Result<()> {
        let report = check_gradients(&mut MultmPrev::new(7), bindings(), GradCheck::default())?;
        assert!(report.passes(1e-3), "{report:?}");
        Ok(())
    }

    #[test]
    fn mismatched_inner_dimension_is_rejected() -> anyhow::Result<()> {
        let b = Bindings::new(Tensor::zeros(TensorShape::new(1, 1, 2, 3)))
            .with_tag(1, Tensor::zeros(TensorShape::new(1, 1, 2, 2)));
        let mut layer = MultmPrev::new(1);
        layer.setup(&b)?;
        let err = layer.forward(&b, &mut Tensor::new()).unwrap_err();
        assert!(matches!(err, LayerError::Shape { .. }));
        Ok(())
    }

    #[test]
    fn record_carries_the_tag() -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        MultmPrev::new(3).serialize(&mut bytes)?;
        let loaded = read_multm_prev(&mut Cursor::new(&bytes))?;
        assert_eq!(loaded.tag(), 3);
        assert_eq!(loaded.to_string(), "multm_prev3");
        assert_eq!(loaded.to_xml(), "<multm_prev tag='3'/>\n");
        Ok(())
    }
}
