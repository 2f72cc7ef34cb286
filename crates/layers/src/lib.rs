//! Layer primitives sharing one computation contract.
//!
//! Every primitive in this crate implements [`Layer`]: a one-time `setup`
//! against the observed input, a `forward` pass writing into a caller-owned
//! output, a `backward` pass that *adds* into the caller's gradient
//! accumulator, a flat parameter buffer, a pair of spatial coordinate maps,
//! and a versioned binary record. Activations are 4-D tensors laid out as
//! `(num_samples, k, nr, nc)`.
//!
//! Families:
//! * spatial transforms in [`spatial`] (convolution, pooling, resizing, views),
//! * normalization in [`norm`],
//! * element-wise nonlinearities in [`activations`] and [`softmax`],
//! * regularization in [`dropout`],
//! * dense projections in [`linear`],
//! * cross-layer combinators in [`combinators`].

pub mod activations;
pub mod alias;
pub mod backend;
pub mod checks;
pub mod combinators;
pub mod dropout;
pub mod gradcheck;
pub mod layer;
pub mod linear;
pub mod norm;
pub mod rng;
pub mod serialize;
pub mod softmax;
pub mod spatial;
pub mod tensor;

use thiserror::Error;

pub use alias::{AliasTensor, AliasView, AliasViewMut};
pub use layer::{Bindings, DPoint, Layer, LayerState, Multipliers, Subnet, TagId};
pub use rng::TensorRng;
pub use tensor::{Tensor, TensorShape};

/// Errors raised while configuring, running, or (de)serializing a layer.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Static configuration rejected at construction time.
    #[error("invalid {layer} configuration: {message}")]
    Config { layer: &'static str, message: String },
    /// Observed tensor shapes disagree with what the layer requires.
    #[error("{layer}: {message}")]
    Shape { layer: &'static str, message: String },
    /// `forward`/`backward` called before `setup`.
    #[error("{layer} used before setup")]
    NotReady { layer: &'static str },
    /// An alias view would reach past the end of its buffer.
    #[error("alias of {extent} elements at offset {offset} exceeds buffer of {len} elements")]
    AliasBounds {
        offset: usize,
        extent: usize,
        len: usize,
    },
    /// A tag could not be resolved to a computed stack position.
    #[error("tag {tag}: {reason}")]
    Tag { tag: TagId, reason: String },
    /// A record carried a version tag the target does not accept.
    #[error("unexpected version '{found}' found while deserializing {layer}")]
    UnknownVersion { layer: &'static str, found: String },
    /// A static field on disk disagrees with the layer reading it back.
    #[error("wrong {field} found while deserializing {layer}: expected {expected}, found {found}")]
    FieldMismatch {
        layer: &'static str,
        field: &'static str,
        expected: String,
        found: String,
    },
    /// A record is structurally invalid (bad length, bad enum value).
    #[error("malformed record: {0}")]
    Malformed(String),
    /// Failure inside a candle kernel.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    /// Failure reading or writing a byte stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LayerError {
    pub fn config(layer: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            layer,
            message: message.into(),
        }
    }

    pub fn shape(layer: &'static str, message: impl Into<String>) -> Self {
        Self::Shape {
            layer,
            message: message.into(),
        }
    }

    pub fn tag(tag: TagId, reason: impl Into<String>) -> Self {
        Self::Tag {
            tag,
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the layer catalog.
pub type Result<T> = std::result::Result<T, LayerError>;
