//! Cross-layer checks of the shared setup/forward/backward/serialize contract.

use std::io::Cursor;

use layers::activations::Relu;
use layers::gradcheck::random_tensor;
use layers::linear::Fc;
use layers::norm::{BatchNorm, BatchNormOptions, NormMode};
use layers::spatial::{read_conv, Conv, ConvOptions};
use layers::{Bindings, Layer, LayerError, Tensor, TensorShape};

fn forward(layer: &mut dyn Layer, input: Tensor) -> anyhow::Result<(Bindings, Tensor)> {
    let bindings = Bindings::new(input);
    layer.setup(&bindings)?;
    let mut output = Tensor::new();
    layer.forward_train(&bindings, &mut output)?;
    Ok((bindings, output))
}

#[test]
fn conv_over_ones_produces_one_value_per_filter_and_pixel() -> anyhow::Result<()> {
    let mut conv = Conv::new(ConvOptions::new(4, 3, 3, 1, 1))?;
    let (_, output) = forward(&mut conv, Tensor::filled(TensorShape::new(1, 1, 5, 5), 1.0))?;
    assert_eq!(output.shape(), TensorShape::new(1, 4, 5, 5));
    assert_eq!(output.size(), 100);
    assert_eq!(conv.params().size(), 4 * 9 + 4);
    Ok(())
}

#[test]
fn strided_conv_follows_the_output_formula() -> anyhow::Result<()> {
    let mut conv = Conv::new(ConvOptions::new(2, 3, 3, 2, 2).with_padding(0, 0))?;
    let (_, output) = forward(&mut conv, random_tensor(TensorShape::new(2, 3, 9, 7), 1))?;
    // 1 + (in + 2·pad - k) / stride
    assert_eq!(output.shape(), TensorShape::new(2, 2, 4, 3));
    Ok(())
}

#[test]
fn mismatched_record_leaves_the_target_untouched() -> anyhow::Result<()> {
    let mut source = Conv::new(ConvOptions::new(3, 3, 3, 2, 2).with_padding(0, 0))?;
    forward(&mut source, random_tensor(TensorShape::new(1, 2, 5, 5), 2))?;
    let mut bytes = Vec::new();
    source.serialize(&mut bytes)?;

    // The stride is static configuration; the filter count is not.
    let mut target = Conv::new(ConvOptions::new(3, 3, 3, 1, 1).with_padding(0, 0))?;
    forward(&mut target, random_tensor(TensorShape::new(1, 2, 5, 5), 3))?;
    let before = target.params().clone();
    let err = target.deserialize(&mut Cursor::new(&bytes)).unwrap_err();
    assert!(
        matches!(err, LayerError::FieldMismatch { field: "stride_y", .. }),
        "{err}"
    );
    assert_eq!(target.params(), &before);
    assert_eq!(target.options().stride_y, 1);

    let mut wider = Conv::new(ConvOptions::new(5, 3, 3, 2, 2).with_padding(0, 0))?;
    wider.deserialize(&mut Cursor::new(&bytes))?;
    assert_eq!(wider.options().num_filters, 3);
    assert_eq!(wider.params(), source.params());

    let restored = read_conv(&mut Cursor::new(&bytes))?;
    assert_eq!(restored.params(), source.params());
    Ok(())
}

#[test]
fn batch_norm_decay_settles_at_one_over_window() -> anyhow::Result<()> {
    let mut bn = BatchNorm::new(BatchNormOptions::new(NormMode::Conv).with_window(4))?;
    let input = random_tensor(TensorShape::new(3, 2, 2, 2), 4);
    let bindings = Bindings::new(input);
    bn.setup(&bindings)?;
    let mut output = Tensor::new();

    let mut decays = Vec::new();
    for _ in 0..6 {
        decays.push(bn.next_decay());
        bn.forward_train(&bindings, &mut output)?;
    }
    let expected = [1.0, 0.5, 1.0 / 3.0, 0.25, 0.25, 0.25];
    for (got, want) in decays.iter().zip(expected) {
        assert!((got - want).abs() < 1e-12, "{decays:?}");
    }
    Ok(())
}

#[test]
fn gradients_flow_through_a_small_stack() -> anyhow::Result<()> {
    let mut conv = Conv::new(ConvOptions::new(4, 3, 3, 1, 1))?.with_seed(7);
    let mut bn = BatchNorm::conv()?;
    let mut relu = Relu::new();
    let mut fc = Fc::new(3)?.with_seed(8);

    let (conv_in, conv_out) = forward(&mut conv, random_tensor(TensorShape::new(2, 2, 4, 4), 5))?;
    let (bn_in, bn_out) = forward(&mut bn, conv_out)?;
    let (relu_in, relu_out) = forward(&mut relu, bn_out)?;
    let (fc_in, fc_out) = forward(&mut fc, relu_out)?;
    assert_eq!(fc_out.shape(), TensorShape::new(2, 3, 1, 1));

    let mut upstream = Tensor::filled(fc_out.shape(), 1.0);
    let stages: Vec<(&mut dyn Layer, Bindings)> = vec![
        (&mut fc, fc_in),
        (&mut relu, relu_in),
        (&mut bn, bn_in),
        (&mut conv, conv_in),
    ];
    let mut output = fc_out;
    for (layer, mut bindings) in stages {
        let mut params_grad = Tensor::zeros(layer.params().shape());
        layer.backward(&output, &upstream, &mut bindings, &mut params_grad)?;
        assert!(params_grad.host().iter().all(|v| v.is_finite()));
        assert_eq!(bindings.gradient().shape(), bindings.input().shape());
        upstream = bindings.gradient().clone();
        output = bindings.input().clone();
    }
    assert!(upstream.host().iter().any(|v| *v != 0.0));
    Ok(())
}

#[test]
fn every_layer_describes_itself() -> anyhow::Result<()> {
    let stack: Vec<Box<dyn Layer>> = vec![
        Box::new(Conv::new(ConvOptions::new(2, 3, 3, 1, 1))?),
        Box::new(BatchNorm::fc()?),
        Box::new(Relu::new()),
        Box::new(Fc::new(4)?),
    ];
    for layer in &stack {
        let summary = layer.to_string();
        assert!(summary.starts_with(layer.name()), "{summary}");
        assert!(layer.to_xml().starts_with('<'));
    }
    Ok(())
}
