//! Spatial transforms: output shape is a closed form of the input shape and
//! the static configuration, and backward is the exact adjoint.

pub mod cont;
pub mod conv;
pub mod pool;
pub mod reorg;
pub mod reshape;
pub mod resize;
pub mod slice;
pub mod transpose;

pub use cont::{read_conv_transpose, ConvTranspose};
pub use conv::{read_conv, Conv, ConvOptions};
pub use pool::{read_avg_pool, read_max_pool, Pool, PoolOptions};
pub use reorg::{read_reorg, Reorg};
pub use reshape::{read_flatten, read_reshape_to, Flatten, ReshapeTo};
pub use resize::{read_resize_to, read_upsample, ResizeTo, Upsample};
pub use slice::{read_extract, read_slice, Extract, Slice};
pub use transpose::{read_transpose, Transpose};
