//! Monte-Carlo policy search through the learned dynamics.

use serde::{Deserialize, Serialize};
use tch::{nn, Tensor};

use super::rollout::{rollout, rollout_objective, RewardAggregation, RolloutOptions, Trajectory};
use crate::dynamics::DynamicsModel;
use crate::error::{Error, Result};
use crate::experience::ExperienceDataset;
use crate::policy::Policy;
use crate::rng::RandomSource;

/// Policy-search hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySearchConfig {
    /// Prediction horizon of every rollout.
    pub horizon: usize,
    /// Number of optimizer steps.
    pub n_iterations: usize,
    /// Replay the same random draws in every rollout.
    pub pegasus: bool,
    pub mm_states: bool,
    pub mm_rewards: bool,
    /// Gradient ascent on the expected return.
    pub maximize: bool,
    /// Maximum policy gradient norm; non-positive disables clipping.
    pub clip_grad: f64,
    pub discount: f64,
    pub aggregation: RewardAggregation,
    /// Re-sample the initial particles from the dataset every this many
    /// iterations; 0 keeps them fixed.
    pub resampling_period: usize,
    /// Relative noise added to re-sampled initial particles.
    pub init_state_noise: f64,
}

impl Default for PolicySearchConfig {
    fn default() -> Self {
        Self {
            horizon: 15,
            n_iterations: 1000,
            pegasus: true,
            mm_states: false,
            mm_rewards: false,
            maximize: true,
            clip_grad: 1.0,
            discount: 1.0,
            aggregation: RewardAggregation::Sum,
            resampling_period: 500,
            init_state_noise: 0.1,
        }
    }
}

impl PolicySearchConfig {
    /// Options of the rollouts run by [`mc_pilco`].
    pub fn rollout_options(&self) -> RolloutOptions {
        RolloutOptions {
            horizon: self.horizon,
            mm_states: self.mm_states,
            mm_rewards: self.mm_rewards,
            discount: self.discount,
        }
    }
}

/// Per-iteration progress reported by [`mc_pilco`].
#[derive(Debug)]
pub struct PolicySearchIteration {
    pub iteration: usize,
    /// Minimized quantity (the negated objective when maximizing).
    pub loss: f64,
    /// Expected aggregated return over particles.
    pub objective: f64,
    /// Detached rollout of this iteration.
    pub trajectory: Trajectory,
}

/// Optimizes `policy` by backpropagating simulated returns through the
/// frozen `dynamics` model.
///
/// # Arguments
///
/// * `initial_states` - Initial particles `[N, D]`
/// * `dynamics` - Fitted dynamics model, held fixed for the whole search
/// * `policy` - Policy to optimize
/// * `optimizer` - Optimizer built over the policy's var store
/// * `dataset` - Source of fresh initial particles when
///   `config.resampling_period > 0`
/// * `config` - Search hyperparameters
/// * `rng` - Random source for masks, noise and re-sampling
/// * `on_iteration` - Called after every optimizer step
///
/// # Returns
///
/// The objective of every iteration.
#[allow(clippy::too_many_arguments)]
pub fn mc_pilco(
    initial_states: &Tensor,
    dynamics: &mut DynamicsModel,
    policy: &mut Policy,
    optimizer: &mut nn::Optimizer,
    dataset: Option<&ExperienceDataset>,
    config: &PolicySearchConfig,
    rng: &mut RandomSource,
    on_iteration: impl FnMut(&PolicySearchIteration),
) -> Result<Vec<f64>> {
    if config.resampling_period > 0 && dataset.is_none() {
        return Err(Error::InvalidConfig(
            "resampling initial states requires a dataset".into(),
        ));
    }
    dynamics.freeze();
    let result = search(
        initial_states,
        dynamics,
        policy,
        optimizer,
        dataset,
        config,
        rng,
        on_iteration,
    );
    dynamics.unfreeze();
    result
}

#[allow(clippy::too_many_arguments)]
fn search(
    initial_states: &Tensor,
    dynamics: &mut DynamicsModel,
    policy: &mut Policy,
    optimizer: &mut nn::Optimizer,
    dataset: Option<&ExperienceDataset>,
    config: &PolicySearchConfig,
    rng: &mut RandomSource,
    mut on_iteration: impl FnMut(&PolicySearchIteration),
) -> Result<Vec<f64>> {
    let options = config.rollout_options();
    let n_particles = initial_states.size().first().copied().unwrap_or(0) as usize;
    let mut x0 = initial_states.detach();
    let mut pinned = rng.snapshot();
    let mut curve = Vec::with_capacity(config.n_iterations);

    for iteration in 0..config.n_iterations {
        if let Some(dataset) = dataset {
            let period = config.resampling_period;
            if period > 0 && iteration > 0 && iteration % period == 0 {
                x0 = dataset
                    .sample_initial_states(n_particles, 0, config.init_state_noise, rng)?
                    .to_device(dynamics.device());
                pinned = rng.snapshot();
                tracing::debug!(iteration, "initial particles re-sampled");
            }
        }
        if config.pegasus {
            rng.restore(&pinned);
        }

        let trajectory = rollout(&x0, dynamics, policy, &options, rng)?;
        let objective = rollout_objective(&trajectory, config.aggregation);
        let loss = if config.maximize {
            -&objective
        } else {
            objective.shallow_clone()
        };

        optimizer.zero_grad();
        loss.backward();
        if config.clip_grad > 0.0 {
            optimizer.clip_grad_norm(config.clip_grad);
        }
        optimizer.step();

        let progress = PolicySearchIteration {
            iteration,
            loss: f64::try_from(&loss)?,
            objective: f64::try_from(&objective)?,
            trajectory: trajectory.detach(),
        };
        if iteration % 100 == 0 {
            tracing::debug!(
                iteration,
                loss = progress.loss,
                objective = progress.objective,
                "policy search step"
            );
        }
        on_iteration(&progress);
        curve.push(progress.objective);
    }
    if let Some(last) = curve.last() {
        tracing::info!(iterations = curve.len(), objective = last, "policy search finished");
    }
    Ok(curve)
}
