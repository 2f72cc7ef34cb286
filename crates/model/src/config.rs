//! Declarative stack descriptions loaded from JSON or TOML.

use std::{fs, path::Path};

use attention::{MaskFill, MultmPrev, Tril};
use embedding::{Embeddings, PositionalEncodings};
use layers::activations::{Activation, Nonlinearity, Prelu, Relu};
use layers::combinators::{AddPrev, Concat, MultPrev, Scale, ScalePrev};
use layers::dropout::{Dropout, Multiply};
use layers::linear::{Fc, Linear};
use layers::norm::{BatchNorm, BatchNormOptions, L2Normalize, LayerNorm, RmsNorm};
use layers::softmax::{Softmax, SoftmaxAll, SoftmaxMode};
use layers::spatial::{Conv, ConvOptions, Flatten, Pool, PoolOptions};
use layers::{LayerError, TagId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::Net;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported configuration extension '{0}'")]
    Format(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    Layer(#[from] LayerError),
}

fn default_true() -> bool {
    true
}

fn default_drop_rate() -> f32 {
    layers::dropout::DEFAULT_DROP_RATE
}

fn default_multiply() -> f32 {
    Multiply::default().value()
}

fn default_prelu() -> f32 {
    Prelu::DEFAULT_INITIAL_VALUE
}

/// One entry of a stack, bottom first. `tag` entries name the output of the
/// entry just below them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Tag {
        id: TagId,
    },
    Con(ConvOptions),
    MaxPool(PoolOptions),
    AvgPool(PoolOptions),
    BatchNorm(BatchNormOptions),
    LayerNorm,
    RmsNorm,
    L2normalize,
    Fc {
        num_outputs: usize,
        #[serde(default = "default_true")]
        bias: bool,
    },
    Linear {
        num_outputs: usize,
        #[serde(default = "default_true")]
        bias: bool,
    },
    Relu,
    Prelu {
        #[serde(default = "default_prelu")]
        initial_value: f32,
    },
    LeakyRelu {
        alpha: Option<f32>,
    },
    Sig,
    Htan,
    Mish,
    Gelu,
    Silu,
    Elu {
        alpha: Option<f32>,
    },
    ClippedRelu {
        ceiling: Option<f32>,
    },
    Smelu {
        beta: Option<f32>,
    },
    Softmax {
        #[serde(default)]
        mode: SoftmaxMode,
    },
    SoftmaxAll,
    Dropout {
        #[serde(default = "default_drop_rate")]
        rate: f32,
    },
    Multiply {
        #[serde(default = "default_multiply")]
        value: f32,
    },
    Flatten,
    AddPrev {
        tag: TagId,
    },
    MultPrev {
        tag: TagId,
    },
    MultmPrev {
        tag: TagId,
    },
    Scale {
        tag: TagId,
    },
    ScalePrev {
        tag: TagId,
    },
    Concat {
        tags: Vec<TagId>,
    },
    Tril {
        #[serde(default)]
        diag: i64,
        #[serde(default)]
        fill: MaskFill,
    },
    Embeddings {
        num_embeddings: usize,
        embedding_dim: usize,
        #[serde(default = "default_true")]
        scale_by_freq: bool,
    },
    PositionalEncodings,
}

impl LayerSpec {
    /// Tags this entry reads, if it is a combinator.
    fn referenced_tags(&self) -> Vec<TagId> {
        match self {
            LayerSpec::AddPrev { tag }
            | LayerSpec::MultPrev { tag }
            | LayerSpec::MultmPrev { tag }
            | LayerSpec::Scale { tag }
            | LayerSpec::ScalePrev { tag } => vec![*tag],
            LayerSpec::Concat { tags } => tags.clone(),
            _ => Vec::new(),
        }
    }

    fn nonlinearity(&self) -> Option<Nonlinearity> {
        Some(match *self {
            LayerSpec::LeakyRelu { alpha } => Nonlinearity::LeakyRelu {
                alpha: alpha.unwrap_or(Nonlinearity::DEFAULT_LEAKY_ALPHA),
            },
            LayerSpec::Sig => Nonlinearity::Sigmoid,
            LayerSpec::Htan => Nonlinearity::Htan,
            LayerSpec::Mish => Nonlinearity::Mish,
            LayerSpec::Gelu => Nonlinearity::Gelu,
            LayerSpec::Silu => Nonlinearity::Silu,
            LayerSpec::Elu { alpha } => Nonlinearity::Elu {
                alpha: alpha.unwrap_or(Nonlinearity::DEFAULT_ELU_ALPHA),
            },
            LayerSpec::ClippedRelu { ceiling } => Nonlinearity::ClippedRelu {
                ceiling: ceiling.unwrap_or(Nonlinearity::DEFAULT_CEILING),
            },
            LayerSpec::Smelu { beta } => Nonlinearity::Smelu {
                beta: beta.unwrap_or(Nonlinearity::DEFAULT_SMELU_BETA),
            },
            _ => return None,
        })
    }

    /// Pushes the layer this entry describes onto `net`.
    fn apply(&self, net: &mut Net, seed: u64) -> Result<(), ConfigError> {
        if let Some(kind) = self.nonlinearity() {
            net.push(Box::new(Activation::new(kind)?));
            return Ok(());
        }
        match self {
            LayerSpec::Tag { id } => {
                net.tag(*id)?;
                return Ok(());
            }
            LayerSpec::Con(options) => net.push(Box::new(Conv::new(*options)?.with_seed(seed))),
            LayerSpec::MaxPool(options) => net.push(Box::new(Pool::max(*options)?)),
            LayerSpec::AvgPool(options) => net.push(Box::new(Pool::avg(*options)?)),
            LayerSpec::BatchNorm(options) => net.push(Box::new(BatchNorm::new(*options)?)),
            LayerSpec::LayerNorm => net.push(Box::new(LayerNorm::new())),
            LayerSpec::RmsNorm => net.push(Box::new(RmsNorm::new())),
            LayerSpec::L2normalize => net.push(Box::new(L2Normalize::default())),
            LayerSpec::Fc { num_outputs, bias } => {
                let mut fc = Fc::new(*num_outputs)?.with_seed(seed);
                if !bias {
                    fc.disable_bias();
                }
                net.push(Box::new(fc))
            }
            LayerSpec::Linear { num_outputs, bias } => {
                net.push(Box::new(Linear::new(*num_outputs, *bias)?.with_seed(seed)))
            }
            LayerSpec::Relu => net.push(Box::new(Relu::new())),
            LayerSpec::Prelu { initial_value } => net.push(Box::new(Prelu::new(*initial_value))),
            LayerSpec::Softmax { mode } => net.push(Box::new(Softmax::new(*mode))),
            LayerSpec::SoftmaxAll => net.push(Box::new(SoftmaxAll::new())),
            LayerSpec::Dropout { rate } => {
                net.push(Box::new(Dropout::new(*rate)?.with_seed(seed)))
            }
            LayerSpec::Multiply { value } => net.push(Box::new(Multiply::new(*value))),
            LayerSpec::Flatten => net.push(Box::new(Flatten::new())),
            LayerSpec::AddPrev { tag } => net.push(Box::new(AddPrev::new(*tag))),
            LayerSpec::MultPrev { tag } => net.push(Box::new(MultPrev::new(*tag))),
            LayerSpec::MultmPrev { tag } => net.push(Box::new(MultmPrev::new(*tag))),
            LayerSpec::Scale { tag } => net.push(Box::new(Scale::new(*tag))),
            LayerSpec::ScalePrev { tag } => net.push(Box::new(ScalePrev::new(*tag))),
            LayerSpec::Concat { tags } => net.push(Box::new(Concat::new(tags)?)),
            LayerSpec::Tril { diag, fill } => net.push(Box::new(Tril::new(*diag, *fill))),
            LayerSpec::Embeddings {
                num_embeddings,
                embedding_dim,
                scale_by_freq,
            } => {
                let mut emb = Embeddings::new(*num_embeddings, *embedding_dim)?.with_seed(seed);
                emb.set_scale_by_freq(*scale_by_freq);
                net.push(Box::new(emb))
            }
            LayerSpec::PositionalEncodings => net.push(Box::new(PositionalEncodings::new())),
            _ => return Ok(()),
        };
        Ok(())
    }
}

/// An ordered stack description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Base seed; entry `i` initializes with `seed + i`.
    #[serde(default)]
    pub seed: u64,
    pub layers: Vec<LayerSpec>,
}

impl NetConfig {
    /// Loads a config, picking the format from the file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: NetConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => return Err(ConfigError::Format(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Collects every violation instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut bound: Vec<TagId> = Vec::new();

        if self.layers.iter().all(|l| matches!(l, LayerSpec::Tag { .. })) {
            errors.push("layers must contain at least one layer".to_string());
        }

        for (i, spec) in self.layers.iter().enumerate() {
            match spec {
                LayerSpec::Tag { id } => {
                    if bound.contains(id) {
                        errors.push(format!("layers[{i}]: tag {id} is bound twice"));
                    }
                    bound.push(*id);
                }
                LayerSpec::Con(o) => {
                    if o.num_filters == 0 {
                        errors.push(format!("layers[{i}]: num_filters must be greater than 0"));
                    }
                    if o.stride_y == 0 || o.stride_x == 0 {
                        errors.push(format!("layers[{i}]: strides must be greater than 0"));
                    }
                    if (o.nr != 0 && o.padding_y >= o.nr) || (o.nc != 0 && o.padding_x >= o.nc) {
                        errors.push(format!("layers[{i}]: padding must be smaller than the filter"));
                    }
                }
                LayerSpec::MaxPool(o) | LayerSpec::AvgPool(o) => {
                    if o.stride_y == 0 || o.stride_x == 0 {
                        errors.push(format!("layers[{i}]: strides must be greater than 0"));
                    }
                }
                LayerSpec::BatchNorm(o) => {
                    if o.window == 0 {
                        errors.push(format!("layers[{i}]: window must be greater than 0"));
                    }
                    if o.eps <= 0.0 {
                        errors.push(format!("layers[{i}]: eps must be greater than 0"));
                    }
                }
                LayerSpec::Fc { num_outputs, .. } | LayerSpec::Linear { num_outputs, .. } => {
                    if *num_outputs == 0 {
                        errors.push(format!("layers[{i}]: num_outputs must be greater than 0"));
                    }
                }
                LayerSpec::Dropout { rate } => {
                    if !(0.0..=1.0).contains(rate) {
                        errors.push(format!("layers[{i}]: dropout rate must be in [0, 1]"));
                    }
                }
                LayerSpec::Concat { tags } => {
                    if !(2..=5).contains(&tags.len()) {
                        errors.push(format!("layers[{i}]: concat takes 2 to 5 tags"));
                    }
                }
                LayerSpec::Embeddings {
                    num_embeddings,
                    embedding_dim,
                    ..
                } => {
                    if *num_embeddings == 0 || *embedding_dim == 0 {
                        errors.push(format!(
                            "layers[{i}]: embedding dictionary and vectors must be non-empty"
                        ));
                    }
                }
                _ => {}
            }
            for tag in spec.referenced_tags() {
                if !bound.contains(&tag) {
                    errors.push(format!("layers[{i}]: tag {tag} is not bound below this layer"));
                }
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }
        Ok(())
    }

    /// Validates and instantiates the stack.
    pub fn build(&self) -> Result<Net, ConfigError> {
        self.validate()?;
        let mut net = Net::new();
        for (i, spec) in self.layers.iter().enumerate() {
            spec.apply(&mut net, self.seed.wrapping_add(i as u64))?;
        }
        log::info!("net: built {} layers from config", net.len());
        Ok(net)
    }
}
