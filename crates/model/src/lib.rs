pub mod catalog;
pub mod config;
pub mod net;

pub use catalog::read_layer;
pub use config::{ConfigError, LayerSpec, NetConfig};
pub use net::Net;
