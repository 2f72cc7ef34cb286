//! Attention-support layers built on the `layers` contract.
//!
//! [`Tril`] applies a lower-triangular keep mask with a configurable fill,
//! which with a `-inf` fill is the causal mask in front of a softmax.
//! [`MultmPrev`] multiplies each `nr × nc` plane of its input by the matching
//! plane of a tagged position, the building block of `Q·Kᵀ` and `A·V`.

pub mod masks;
pub mod multm;

pub use masks::{read_tril, triangular_masks, MaskFill, Tril};
pub use multm::{read_multm_prev, MultmOp, MultmPrev};
