//! Embedding lookup feeding positional encodings, as at the bottom of a
//! sequence model.

use embedding::{encoding_plane, read_embeddings, read_positional_encodings, Embeddings, PositionalEncodings};
use layers::{Bindings, Layer, Tensor, TensorShape};

#[test]
fn token_ids_become_position_aware_vectors() -> anyhow::Result<()> {
    let ids = Tensor::from_vec(TensorShape::new(2, 1, 3, 1), vec![0.0, 1.0, 2.0, 2.0, 1.0, 0.0])?;
    let tokens = Bindings::new(ids);
    let mut emb = Embeddings::new(3, 4)?.with_seed(11);
    emb.setup(&tokens)?;
    let mut vectors = Tensor::new();
    emb.forward(&tokens, &mut vectors)?;
    assert_eq!(vectors.shape(), TensorShape::new(2, 1, 3, 4));

    let positioned_in = Bindings::new(vectors.clone());
    let mut pe = PositionalEncodings::new();
    pe.setup(&positioned_in)?;
    let mut out = Tensor::new();
    pe.forward(&positioned_in, &mut out)?;

    // Row 0 has θ = 0: sin 0 = 0 in even columns, cos 0 = 1 in odd ones.
    for c in 0..4 {
        let shift = if c % 2 == 0 { 0.0 } else { 1.0 };
        assert!((out.at(0, 0, 0, c) - vectors.at(0, 0, 0, c) - shift).abs() < 1e-6);
    }
    // Token 0 sits at row 0 of sample 0 and row 2 of sample 1.
    let plane = encoding_plane(3, 4)?;
    for c in 0..4 {
        let moved = out.at(1, 0, 2, c) - out.at(0, 0, 0, c);
        assert!((moved - (plane[2 * 4 + c] - plane[c])).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn records_round_trip_through_bytes() -> anyhow::Result<()> {
    let mut emb = Embeddings::new(8, 2)?.with_seed(3);
    emb.setup(&Bindings::new(Tensor::zeros(TensorShape::new(1, 1, 1, 1))))?;
    let mut bytes = Vec::new();
    emb.serialize(&mut bytes)?;
    PositionalEncodings::new().serialize(&mut bytes)?;

    let mut cursor = std::io::Cursor::new(bytes);
    let loaded = read_embeddings(&mut cursor)?;
    assert_eq!(loaded.embeddings(), emb.embeddings());
    assert!(loaded.scale_by_freq());
    read_positional_encodings(&mut cursor)?;
    Ok(())
}
