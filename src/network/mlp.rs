//! Multi-layer perceptron builder.

use serde::{Deserialize, Serialize};
use tch::nn;

use super::dropout::{BernoulliDropout, ConcreteDropout, ConcreteDropoutConfig};
use super::seq::{seq, StochasticSeq};
use super::Activation;

/// Dropout placed after every hidden nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DropoutConfig {
    None,
    /// Fixed drop probability.
    Bernoulli { p: f64 },
    /// Learnable drop probability.
    Concrete(ConcreteDropoutConfig),
}

/// Architecture of an [`mlp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// Hidden layer widths.
    pub hidden: Vec<usize>,
    /// Hidden nonlinearity.
    pub activation: Activation,
    /// Nonlinearity applied to the final affine output.
    pub output_activation: Activation,
    pub dropout: DropoutConfig,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            hidden: vec![200, 200],
            activation: Activation::Relu,
            output_activation: Activation::Identity,
            dropout: DropoutConfig::None,
        }
    }
}

/// Builds `[Linear → activation → dropout]* → Linear → output_activation`.
///
/// Layers are registered as `l{i}` and concrete dropout logits as `drop{i}`
/// under `p`.
pub fn mlp(p: &nn::Path, input_dim: usize, output_dim: usize, config: &MlpConfig) -> StochasticSeq {
    let mut net = seq();
    let mut width = input_dim as i64;
    for (i, &units) in config.hidden.iter().enumerate() {
        net = net
            .add(nn::linear(
                p / format!("l{}", i),
                width,
                units as i64,
                Default::default(),
            ))
            .add(config.activation);
        net = match config.dropout {
            DropoutConfig::None => net,
            DropoutConfig::Bernoulli { p: rate } => net.add(BernoulliDropout::new(rate)),
            DropoutConfig::Concrete(cfg) => {
                net.add(ConcreteDropout::new(p / format!("drop{}", i), cfg))
            }
        };
        width = units as i64;
    }
    net.add(nn::linear(
        p / format!("l{}", config.hidden.len()),
        width,
        output_dim as i64,
        Default::default(),
    ))
    .add(config.output_activation)
}
