//! Neural policy with bounded, dropout-perturbed output.

use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};

use super::trait_::Controller;
use crate::error::{Error, Result};
use crate::experience::ParamSnapshot;
use crate::network::{mlp, Activation, DropoutConfig, MlpConfig, StochasticSeq};
use crate::rng::RandomSource;

/// Policy network hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Hidden layer widths.
    pub hidden: Vec<usize>,
    pub activation: Activation,
    /// Fixed drop probability of the hidden layers.
    pub dropout_p: f64,
    /// Adam learning rate.
    pub learning_rate: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            hidden: vec![200, 200],
            activation: Activation::Relu,
            dropout_p: 0.1,
            learning_rate: 1e-4,
        }
    }
}

/// State-feedback policy `u = max_u * tanh(net(x))`.
///
/// The fixed-rate dropout masks make the policy stochastic; one mask per row
/// is drawn when `resample` is true and reused otherwise.
pub struct Policy {
    vs: nn::VarStore,
    net: StochasticSeq,
    max_u: Tensor,
    state_dim: usize,
    action_dim: usize,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("net", &self.net)
            .field("state_dim", &self.state_dim)
            .field("action_dim", &self.action_dim)
            .finish()
    }
}

impl Policy {
    /// Creates a new policy.
    ///
    /// # Arguments
    ///
    /// * `config` - Network hyperparameters
    /// * `state_dim` - Observation width `D`
    /// * `max_u` - Symmetric action bound, one entry per action dimension
    /// * `device` - Device holding the parameters
    pub fn new(config: &PolicyConfig, state_dim: usize, max_u: &[f64], device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let action_dim = max_u.len();
        let network = MlpConfig {
            hidden: config.hidden.clone(),
            activation: config.activation,
            output_activation: Activation::Identity,
            dropout: DropoutConfig::Bernoulli {
                p: config.dropout_p,
            },
        };
        let bound: Vec<f32> = max_u.iter().map(|&m| m.abs() as f32).collect();
        let max_u = Tensor::from_slice(&bound).to_device(device);
        let scale = max_u.shallow_clone();
        let net = mlp(&(vs.root() / "policy"), state_dim, action_dim, &network)
            .add_fn(move |x| x.tanh() * &scale);
        Self {
            vs,
            net,
            max_u,
            state_dim,
            action_dim,
        }
    }

    /// Differentiable actions for a batch of states `[N, D]`, returns `[N, U]`.
    pub fn act(
        &mut self,
        state: &Tensor,
        rng: &mut RandomSource,
        resample: bool,
    ) -> Result<Tensor> {
        let width = state.size().last().copied().unwrap_or(0) as usize;
        if width != self.state_dim {
            return Err(Error::DimensionMismatch {
                what: "policy state",
                expected: self.state_dim,
                actual: width,
            });
        }
        Ok(self.net.forward(&state.to_kind(Kind::Float), rng, resample))
    }

    /// Copies every parameter out of the var store, sorted by name.
    pub fn parameter_snapshot(&self) -> Result<Vec<ParamSnapshot>> {
        let mut named: Vec<(String, Tensor)> = self.vs.variables().into_iter().collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
            .into_iter()
            .map(|(name, tensor)| {
                let values = Vec::<f32>::try_from(
                    &tensor.detach().to_kind(Kind::Float).to_device(Device::Cpu).view([-1]),
                )?;
                Ok(ParamSnapshot {
                    name,
                    shape: tensor.size(),
                    values,
                })
            })
            .collect()
    }

    /// Loads parameters previously captured by [`Self::parameter_snapshot`].
    pub fn restore_parameters(&mut self, snapshot: &[ParamSnapshot]) -> Result<()> {
        let mut variables = self.vs.variables();
        for param in snapshot {
            let Some(var) = variables.get_mut(&param.name) else {
                return Err(Error::InvalidConfig(format!(
                    "unknown policy parameter {}",
                    param.name
                )));
            };
            let value = Tensor::from_slice(&param.values)
                .reshape(param.shape.as_slice())
                .to_device(self.vs.device());
            if value.size() != var.size() {
                return Err(Error::InvalidConfig(format!(
                    "shape mismatch for policy parameter {}",
                    param.name
                )));
            }
            tch::no_grad(|| var.copy_(&value));
        }
        Ok(())
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    /// Action bound vector `max_u`.
    pub fn max_u(&self) -> &Tensor {
        &self.max_u
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Returns a reference to the variable store.
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Returns a mutable reference to the variable store for optimization.
    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

impl Controller for Policy {
    /// Detached action for the live environment. A new dropout mask is drawn
    /// at the start of each episode and kept for its remaining steps.
    fn control(&mut self, state: &[f64], t: usize, rng: &mut RandomSource) -> Result<Vec<f64>> {
        let device = self.device();
        let x = Tensor::from_slice(state)
            .to_kind(Kind::Float)
            .to_device(device)
            .unsqueeze(0);
        let action = tch::no_grad(|| self.act(&x, rng, t == 0))?;
        let action = action.detach().to_kind(Kind::Double).to_device(Device::Cpu).view([-1]);
        Ok(Vec::<f64>::try_from(&action)?)
    }

    fn name(&self) -> &str {
        "neural"
    }
}
