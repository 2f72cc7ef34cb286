//! Sequence-input layers: learned token embeddings and fixed sinusoidal
//! positional encodings, both following the `layers` contract.

pub mod positional;
pub mod token;

pub use positional::{encoding_plane, read_positional_encodings, PositionalEncodings};
pub use token::{read_embeddings, Embeddings};
