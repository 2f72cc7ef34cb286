use super::*;
use layers::gradcheck::{check_gradients, random_tensor, GradCheck};
use layers::{Bindings, Layer, LayerError, TensorShape};
use std::io::Cursor;

fn run(tril: &mut Tril, input: Tensor) -> Result<Tensor> {
    let b = Bindings::new(input);
    tril.setup(&b)?;
    let mut out = Tensor::new();
    tril.forward(&b, &mut out)?;
    Ok(out)
}

#[test]
fn zero_fill_keeps_the_lower_triangle() -> Result<()> {
    let input = random_tensor(TensorShape::new(2, 3, 4, 5), 1);
    let out = run(&mut Tril::default(), input.clone())?;
    for n in 0..2 {
        for k in 0..3 {
            for r in 0..4 {
                for c in 0..5 {
                    let expected = if c <= r { input.at(n, k, r, c) } else { 0.0 };
                    assert_eq!(out.at(n, k, r, c), expected, "({n},{k},{r},{c})");
                }
            }
        }
    }
    Ok(())
}

#[test]
fn negative_diag_also_masks_the_diagonal() -> Result<()> {
    let input = Tensor::filled(TensorShape::new(1, 1, 3, 3), 2.0);
    let out = run(&mut Tril::new(-1, MaskFill::Zero), input)?;
    assert_eq!(
        out.host(),
        &[0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 2.0, 2.0, 0.0]
    );
    Ok(())
}

#[test]
fn extreme_diagonals_saturate() -> Result<()> {
    let input = Tensor::filled(TensorShape::new(1, 2, 3, 4), 3.0);
    let out = run(&mut Tril::new(i64::MAX, MaskFill::Zero), input.clone())?;
    assert_eq!(out, input);

    let out = run(&mut Tril::new(i64::MIN, MaskFill::Zero), input)?;
    assert!(out.host().iter().all(|v| *v == 0.0));

    let (keep, _) = triangular_masks(TensorShape::new(1, 1, 2, 2), i64::MAX - 1, MaskFill::Zero);
    assert_eq!(keep.host(), &[1.0; 4]);
    Ok(())
}

#[test]
fn causal_mask_fills_with_negative_infinity() -> Result<()> {
    let input = random_tensor(TensorShape::new(1, 2, 3, 3), 2);
    let out = run(&mut Tril::causal(), input.clone())?;
    assert_eq!(out.at(0, 1, 0, 1), f32::NEG_INFINITY);
    assert_eq!(out.at(0, 1, 1, 2), f32::NEG_INFINITY);
    assert_eq!(out.at(0, 1, 2, 1), input.at(0, 1, 2, 1));
    assert!(out.host().iter().all(|v| !v.is_nan()));
    Ok(())
}

#[test]
fn ratio_fill_and_positive_diag() -> Result<()> {
    let input = Tensor::zeros(TensorShape::new(1, 1, 2, 4));
    let mut tril = Tril::with_ratio(1, 1, 4)?;
    let out = run(&mut tril, input)?;
    assert_eq!(out.host(), &[0.0, 0.0, 0.25, 0.25, 0.0, 0.0, 0.0, 0.25]);
    assert!(Tril::with_ratio(0, 1, 0).is_err());
    Ok(())
}

#[test]
fn masks_follow_shape_changes() -> Result<()> {
    let mut tril = Tril::default();
    run(&mut tril, Tensor::filled(TensorShape::new(1, 1, 2, 2), 1.0))?;
    let b = Bindings::new(Tensor::filled(TensorShape::new(1, 1, 3, 3), 1.0));
    let mut out = Tensor::new();
    tril.forward(&b, &mut out)?;
    assert_eq!(out.shape(), TensorShape::new(1, 1, 3, 3));
    assert_eq!(out.sum(), 6.0);
    Ok(())
}

#[test]
fn gradient_is_masked_like_the_output() -> Result<()> {
    let bindings = Bindings::new(random_tensor(TensorShape::new(2, 2, 3, 3), 3));
    let report = check_gradients(&mut Tril::with_ratio(0, 1, 2)?, bindings, GradCheck::default())?;
    assert!(report.passes(1e-3), "{report:?}");
    Ok(())
}

#[test]
fn record_echoes_diag_and_fill() -> Result<()> {
    let mut bytes = Vec::new();
    Tril::causal().serialize(&mut bytes)?;
    let loaded = read_tril(&mut Cursor::new(&bytes))?;
    assert_eq!(loaded.fill(), MaskFill::NegInfinity);
    assert_eq!(loaded.to_string(), "tril (diag=0, diag_value=-inf)");

    let mut other = Tril::new(-1, MaskFill::NegInfinity);
    let err = other.deserialize(&mut Cursor::new(&bytes)).unwrap_err();
    assert!(matches!(err, LayerError::FieldMismatch { field: "diag", .. }));
    assert_eq!(other.diag(), -1);
    Ok(())
}

#[test]
fn builder_leaves_fill_empty_for_zero() {
    let (keep, additive) = triangular_masks(TensorShape::new(1, 1, 2, 2), 0, MaskFill::Zero);
    assert_eq!(keep.host(), &[1.0, 0.0, 1.0, 1.0]);
    assert!(additive.is_empty());
}
