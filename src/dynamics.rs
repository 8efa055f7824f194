//! Probabilistic dynamics model `p(Δx, r | x, u)`.
//!
//! Inputs are normalized with statistics frozen at the last
//! [`DynamicsModel::set_dataset`] call; the network predicts a density over
//! normalized targets which is mapped back to raw scale before sampling.

use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};

use crate::density::{Distribution, OutputDensity};
use crate::error::{Error, Result};
use crate::network::{mlp, ConcreteDropoutConfig, DropoutConfig, MlpConfig, StochasticSeq};
use crate::rng::RandomSource;
use crate::training::regressor::Regressor;

/// Differentiable reward `r(x, u, x')` evaluated on batched tensors, returns `[N]`.
pub type RewardFn = Box<dyn Fn(&Tensor, &Tensor, &Tensor) -> Tensor>;

/// Standard deviations below this are replaced by 1 when normalizing.
const STD_FLOOR: f64 = 1e-6;

/// Dynamics model hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicsConfig {
    pub network: MlpConfig,
    /// Number of output mixture components (1 = diagonal Gaussian).
    pub components: usize,
    /// Predict the reward jointly with the state delta instead of using the
    /// environment's reward function.
    pub learn_reward: bool,
    /// Adam learning rate.
    pub learning_rate: f64,
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self {
            network: MlpConfig {
                hidden: vec![200, 200],
                dropout: DropoutConfig::Concrete(ConcreteDropoutConfig::default()),
                ..MlpConfig::default()
            },
            components: 1,
            learn_reward: true,
            learning_rate: 1e-4,
        }
    }
}

/// Per-column mean and standard deviation of inputs and targets.
#[derive(Debug)]
pub struct NormalizationStats {
    pub input_mean: Tensor,
    pub input_std: Tensor,
    pub target_mean: Tensor,
    pub target_std: Tensor,
}

impl NormalizationStats {
    fn from_data(inputs: &Tensor, targets: &Tensor) -> Self {
        let (input_mean, input_std) = column_moments(inputs);
        let (target_mean, target_std) = column_moments(targets);
        Self {
            input_mean,
            input_std,
            target_mean,
            target_std,
        }
    }

    fn normalize_inputs(&self, inputs: &Tensor) -> Tensor {
        (inputs - &self.input_mean) / &self.input_std
    }

    fn normalize_targets(&self, targets: &Tensor) -> Tensor {
        (targets - &self.target_mean) / &self.target_std
    }
}

fn column_moments(data: &Tensor) -> (Tensor, Tensor) {
    let data = data.detach();
    let mean = data.mean_dim([0].as_slice(), false, Kind::Float);
    let var = (&data - &mean)
        .square()
        .mean_dim([0].as_slice(), false, Kind::Float);
    let std = var.sqrt();
    let ones = std.ones_like();
    let std = std.where_self(&std.gt(STD_FLOOR), &ones);
    (mean, std)
}

/// Training tensors stored by [`DynamicsModel::set_dataset`], already normalized.
#[derive(Debug)]
struct TrainingSet {
    inputs: Tensor,
    targets: Tensor,
}

/// Dropout network + output density + optional known reward function.
pub struct DynamicsModel {
    vs: nn::VarStore,
    net: StochasticSeq,
    density: OutputDensity,
    state_dim: usize,
    action_dim: usize,
    reward_fn: Option<RewardFn>,
    stats: Option<NormalizationStats>,
    training: Option<TrainingSet>,
}

impl std::fmt::Debug for DynamicsModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicsModel")
            .field("density", &self.density)
            .field("state_dim", &self.state_dim)
            .field("action_dim", &self.action_dim)
            .field("learns_reward", &self.learns_reward())
            .field("dataset_set", &self.stats.is_some())
            .finish()
    }
}

impl DynamicsModel {
    /// Creates a dynamics model.
    ///
    /// When `reward_fn` is `None` the reward is learned as an extra output
    /// channel (`E = D + 1`), otherwise only the state delta is predicted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidComponentCount`] if `config.components < 1`,
    /// and [`Error::InvalidConfig`] if `config.learn_reward` disagrees with
    /// the presence of `reward_fn`.
    pub fn new(
        config: &DynamicsConfig,
        state_dim: usize,
        action_dim: usize,
        reward_fn: Option<RewardFn>,
        device: Device,
    ) -> Result<Self> {
        match (config.learn_reward, reward_fn.is_some()) {
            (true, true) => {
                return Err(Error::InvalidConfig(
                    "learn_reward is on but a reward function was given".into(),
                ))
            }
            (false, false) => {
                return Err(Error::InvalidConfig(
                    "learn_reward is off and no reward function was given".into(),
                ))
            }
            _ => {}
        }
        let output_dim = state_dim + usize::from(config.learn_reward);
        let density = OutputDensity::for_components(output_dim, config.components)?;
        let vs = nn::VarStore::new(device);
        let net = mlp(
            &(vs.root() / "dynamics"),
            state_dim + action_dim,
            density.raw_dim(),
            &config.network,
        );
        Ok(Self {
            vs,
            net,
            density,
            state_dim,
            action_dim,
            reward_fn,
            stats: None,
            training: None,
        })
    }

    /// Stores a training set and recomputes the normalization statistics.
    ///
    /// `inputs` is `[N, D + U]`, `targets` is `[N, E]`.
    pub fn set_dataset(&mut self, inputs: &Tensor, targets: &Tensor) -> Result<()> {
        let (n_in, in_dim) = inputs.size2()?;
        let (n_out, out_dim) = targets.size2()?;
        check_dim("dynamics inputs", self.input_dim(), in_dim as usize)?;
        check_dim("dynamics targets", self.density.output_dim(), out_dim as usize)?;
        check_dim("target rows", n_in as usize, n_out as usize)?;
        if n_in == 0 {
            return Err(Error::EmptyDataset);
        }

        let device = self.device();
        let inputs = inputs.to_kind(Kind::Float).to_device(device).detach();
        let targets = targets.to_kind(Kind::Float).to_device(device).detach();
        let stats = NormalizationStats::from_data(&inputs, &targets);
        self.training = Some(TrainingSet {
            inputs: stats.normalize_inputs(&inputs),
            targets: stats.normalize_targets(&targets),
        });
        self.stats = Some(stats);
        tracing::debug!(rows = n_in, "dynamics dataset updated");
        Ok(())
    }

    /// Predictive distribution over `(Δx, r?)` in raw scale.
    pub fn predict(
        &mut self,
        state: &Tensor,
        action: &Tensor,
        rng: &mut RandomSource,
        resample: bool,
    ) -> Result<Distribution> {
        let stats = self.stats.as_ref().ok_or(Error::DatasetNotSet)?;
        check_dim("state", self.state_dim, last_dim(state))?;
        check_dim("action", self.action_dim, last_dim(action))?;
        let inputs = Tensor::cat(&[state, action], -1).to_kind(Kind::Float);
        let normalized = stats.normalize_inputs(&inputs);
        let (loc, scale) = (
            stats.target_mean.shallow_clone(),
            stats.target_std.shallow_clone(),
        );
        let raw = self.net.forward(&normalized, rng, resample);
        Ok(self.density.distribution(&raw)?.rescale(&loc, &scale))
    }

    /// Samples one transition per row: returns `(next_state, reward)` with
    /// shapes `[N, D]` and `[N]`.
    pub fn step(
        &mut self,
        state: &Tensor,
        action: &Tensor,
        rng: &mut RandomSource,
        resample: bool,
    ) -> Result<(Tensor, Tensor)> {
        let sample = self.predict(state, action, rng, resample)?.sample(rng);
        let d = self.state_dim as i64;
        let next_state = state + sample.narrow(-1, 0, d);
        let reward = match &self.reward_fn {
            Some(reward_fn) => reward_fn(state, action, &next_state),
            None => sample.narrow(-1, d, 1).squeeze_dim(-1),
        };
        Ok((next_state, reward))
    }

    /// Holds every parameter fixed (used during policy search).
    pub fn freeze(&mut self) {
        self.vs.freeze();
    }

    /// Makes the parameters trainable again.
    pub fn unfreeze(&mut self) {
        self.vs.unfreeze();
    }

    /// Current drop probability of each dropout layer.
    pub fn drop_probabilities(&self) -> Vec<f64> {
        self.net.drop_probabilities()
    }

    pub fn learns_reward(&self) -> bool {
        self.reward_fn.is_none()
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    /// `D + U`.
    pub fn input_dim(&self) -> usize {
        self.state_dim + self.action_dim
    }

    pub fn density(&self) -> &OutputDensity {
        &self.density
    }

    pub fn normalization(&self) -> Option<&NormalizationStats> {
        self.stats.as_ref()
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

impl Regressor for DynamicsModel {
    fn training_set(&self) -> Result<(Tensor, Tensor)> {
        let set = self.training.as_ref().ok_or(Error::DatasetNotSet)?;
        Ok((set.inputs.shallow_clone(), set.targets.shallow_clone()))
    }

    fn forward_normalized(
        &mut self,
        inputs: &Tensor,
        rng: &mut RandomSource,
        resample: bool,
    ) -> Result<Distribution> {
        let raw = self.net.forward(inputs, rng, resample);
        self.density.distribution(&raw)
    }

    fn regularization(&self) -> Tensor {
        self.net.regularization()
    }
}

fn last_dim(t: &Tensor) -> usize {
    t.size().last().copied().unwrap_or(0) as usize
}

fn check_dim(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
