//! Version-tag dispatch over every primitive the workspace provides.

use std::io::{Cursor, Read};

use attention::{read_multm_prev, read_tril};
use embedding::{read_embeddings, read_positional_encodings};
use layers::activations::{read_activation, read_prelu, read_relu, Nonlinearity};
use layers::combinators::{
    read_add_prev, read_concat, read_mult_prev, read_resize_prev_to_tagged, read_scale,
    read_scale_prev,
};
use layers::dropout::{read_dropout, read_multiply};
use layers::linear::{read_fc, read_linear};
use layers::norm::{
    read_affine, read_batch_norm, read_l2normalize, read_layer_norm, read_rms_norm,
};
use layers::serialize as ser;
use layers::softmax::{read_softmax, read_softmax_all};
use layers::spatial::{
    read_avg_pool, read_conv, read_conv_transpose, read_extract, read_flatten, read_max_pool,
    read_reorg, read_reshape_to, read_resize_to, read_slice, read_transpose, read_upsample,
};
use layers::{Layer, LayerError, Result};

fn boxed<L: Layer + 'static>(layer: L) -> Box<dyn Layer> {
    Box::new(layer)
}

/// Reads one layer record of any kind, dispatching on its version tag.
///
/// Tags of older format revisions are routed to the same reader as the
/// current one.
pub fn read_layer(input: &mut dyn Read) -> Result<Box<dyn Layer>> {
    let tag = ser::read_str(input)?;
    let mut prefix = Vec::with_capacity(tag.len() + 8);
    ser::write_str(&mut prefix, &tag)?;
    let mut record = Cursor::new(prefix).chain(input);
    let r: &mut dyn Read = &mut record;

    let layer = match tag.as_str() {
        "con_6" | "con_5" | "con_4" => boxed(read_conv(r)?),
        "cont_2" | "cont_1" => boxed(read_conv_transpose(r)?),
        "max_pool_2" => boxed(read_max_pool(r)?),
        "avg_pool_2" => boxed(read_avg_pool(r)?),
        "upsample_" => boxed(read_upsample(r)?),
        "resize_to_" => boxed(read_resize_to(r)?),
        "reshape_to_" => boxed(read_reshape_to(r)?),
        "flatten_" => boxed(read_flatten(r)?),
        "reorg_" => boxed(read_reorg(r)?),
        "transpose_" => boxed(read_transpose(r)?),
        "slice_" => boxed(read_slice(r)?),
        "extract_" => boxed(read_extract(r)?),
        "bn_con2" | "bn_fc2" => boxed(read_batch_norm(r)?),
        "affine_2" | "affine_" => boxed(read_affine(r)?),
        "layer_norm_" => boxed(read_layer_norm(r)?),
        "rms_norm_" => boxed(read_rms_norm(r)?),
        "l2normalize_" => boxed(read_l2normalize(r)?),
        "relu_2" | "relu_" => boxed(read_relu(r)?),
        "prelu_" => boxed(read_prelu(r)?),
        t if Nonlinearity::VERSIONS.contains(&t) => boxed(read_activation(r)?),
        "softmax_" => boxed(read_softmax(r)?),
        "softmax_all_" => boxed(read_softmax_all(r)?),
        "dropout_" => boxed(read_dropout(r)?),
        "multiply_" => boxed(read_multiply(r)?),
        "fc_3" | "fc_2" => boxed(read_fc(r)?),
        "linear_" => boxed(read_linear(r)?),
        "add_prev_" => boxed(read_add_prev(r)?),
        "mult_prev_" => boxed(read_mult_prev(r)?),
        "multm_prev_" => boxed(read_multm_prev(r)?),
        "scale_" => boxed(read_scale(r)?),
        "scale_prev_" => boxed(read_scale_prev(r)?),
        "resize_prev_to_tagged_" => boxed(read_resize_prev_to_tagged(r)?),
        "concat_" => boxed(read_concat(r)?),
        "tril_" => boxed(read_tril(r)?),
        "embeddings_" => boxed(read_embeddings(r)?),
        "positional_encodings_" => boxed(read_positional_encodings(r)?),
        _ => {
            return Err(LayerError::UnknownVersion {
                layer: "layer",
                found: tag,
            })
        }
    };
    Ok(layer)
}
