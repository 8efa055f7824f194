//! Particle rollouts through the learned dynamics under the policy.

use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use crate::dynamics::DynamicsModel;
use crate::error::{Error, Result};
use crate::policy::Policy;
use crate::rng::RandomSource;

/// Diagonal jitter added to the empirical covariance before factorizing.
const COV_JITTER: f64 = 1e-6;

/// How the per-step rewards of a particle are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RewardAggregation {
    /// Discounted sum over steps.
    #[default]
    Sum,
    /// Discounted sum divided by the number of steps.
    Mean,
}

/// Parameters of a single rollout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RolloutOptions {
    /// Prediction horizon; 0 is run as one step.
    pub horizon: usize,
    /// Replace the particles by a Gaussian fit after every step.
    pub mm_states: bool,
    /// Replace the rewards by a Gaussian fit after every step.
    pub mm_rewards: bool,
    /// Per-step reward discount.
    pub discount: f64,
}

impl Default for RolloutOptions {
    fn default() -> Self {
        Self {
            horizon: 15,
            mm_states: false,
            mm_rewards: false,
            discount: 1.0,
        }
    }
}

/// Tensors of one rollout. Rows index time, then particle.
#[derive(Debug)]
pub struct Trajectory {
    /// `[H + 1, N, D]`, starting with the initial particles.
    pub states: Tensor,
    /// `[H, N, U]`.
    pub actions: Tensor,
    /// `[H, N]`, undiscounted.
    pub rewards: Tensor,
    /// Discounted reward accumulated by each particle, `[N]`.
    pub returns: Tensor,
}

impl Trajectory {
    /// Number of simulated steps.
    pub fn steps(&self) -> usize {
        self.rewards.size().first().copied().unwrap_or(0) as usize
    }

    /// Copy cut from the autograd graph.
    pub fn detach(&self) -> Self {
        Self {
            states: self.states.detach(),
            actions: self.actions.detach(),
            rewards: self.rewards.detach(),
            returns: self.returns.detach(),
        }
    }
}

/// Unrolls `max(horizon, 1)` steps from `initial_states` (`[N, D]`).
///
/// Policy and dynamics masks are drawn at step 0 and reused afterwards, so
/// each particle follows one sampled model and one sampled policy for the
/// whole horizon. Gradients flow from the returns back to the policy
/// parameters through every sampled transition.
pub fn rollout(
    initial_states: &Tensor,
    dynamics: &mut DynamicsModel,
    policy: &mut Policy,
    options: &RolloutOptions,
    rng: &mut RandomSource,
) -> Result<Trajectory> {
    let (n, _) = initial_states.size2()?;
    if n == 0 {
        return Err(Error::InvalidConfig("rollout needs at least one particle".into()));
    }
    let device = dynamics.device();
    let mut x = initial_states.to_kind(Kind::Float).to_device(device);
    let mut returns = Tensor::zeros([n], (Kind::Float, device));
    let mut weight = 1.0;

    let steps = options.horizon.max(1);
    let mut states = Vec::with_capacity(steps + 1);
    let mut actions = Vec::with_capacity(steps);
    let mut rewards = Vec::with_capacity(steps);
    states.push(x.shallow_clone());

    for t in 0..steps {
        let resample = t == 0;
        let u = policy.act(&x, rng, resample)?;
        let (mut next, mut r) = dynamics.step(&x, &u, rng, resample)?;
        if options.mm_states {
            next = moment_match_states(&next, rng)?;
        }
        if options.mm_rewards {
            r = moment_match_rewards(&r, rng);
        }
        returns = returns + &r * weight;
        weight *= options.discount;

        actions.push(u);
        rewards.push(r);
        states.push(next.shallow_clone());
        x = next;
    }

    Ok(Trajectory {
        states: Tensor::stack(&states, 0),
        actions: Tensor::stack(&actions, 0),
        rewards: Tensor::stack(&rewards, 0),
        returns,
    })
}

/// Scalar objective of a trajectory: the aggregated per-particle return
/// averaged over particles.
pub fn rollout_objective(trajectory: &Trajectory, aggregation: RewardAggregation) -> Tensor {
    let per_particle = match aggregation {
        RewardAggregation::Sum => trajectory.returns.shallow_clone(),
        RewardAggregation::Mean => &trajectory.returns / trajectory.steps().max(1) as f64,
    };
    per_particle.mean(Kind::Float)
}

/// Resamples `[N, D]` particles from the Gaussian with their empirical mean
/// and covariance: `mean + ε Lᵀ`, `L` the Cholesky factor.
pub fn moment_match_states(states: &Tensor, rng: &mut RandomSource) -> Result<Tensor> {
    let (n, d) = states.size2()?;
    let mean = states.mean_dim([0].as_slice(), true, Kind::Float);
    let centered = states - &mean;
    let dof = (n - 1).max(1) as f64;
    let eye = Tensor::eye(d, (Kind::Float, states.device()));
    let cov = centered.transpose(0, 1).matmul(&centered) / dof + eye * COV_JITTER;
    let chol = cov.f_linalg_cholesky(false)?;
    let eps = rng.normal(&[n, d], states.device());
    Ok(mean + eps.matmul(&chol.transpose(0, 1)))
}

/// Resamples `[N]` rewards from the Gaussian with their mean and standard
/// deviation.
pub fn moment_match_rewards(rewards: &Tensor, rng: &mut RandomSource) -> Tensor {
    let mean = rewards.mean(Kind::Float);
    let std = (rewards - &mean).square().mean(Kind::Float).sqrt();
    let eps = rng.normal(&rewards.size(), rewards.device());
    mean + std * eps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{DynamicsConfig, RewardFn};
    use crate::network::{DropoutConfig, MlpConfig};
    use crate::policy::PolicyConfig;
    use tch::Device;

    fn fitted_pair(learn_reward: bool) -> (DynamicsModel, Policy) {
        let config = DynamicsConfig {
            network: MlpConfig {
                hidden: vec![16],
                dropout: DropoutConfig::Concrete(Default::default()),
                ..MlpConfig::default()
            },
            learn_reward,
            ..DynamicsConfig::default()
        };
        let reward_fn: Option<RewardFn> = if learn_reward {
            None
        } else {
            Some(Box::new(|_x, _u, next| {
                -next.square().sum_dim_intlist([-1].as_slice(), false, Kind::Float)
            }))
        };
        let mut dynamics = DynamicsModel::new(&config, 2, 1, reward_fn, Device::Cpu).unwrap();
        let inputs = Tensor::randn([32, 3], (Kind::Float, Device::Cpu));
        let width = if learn_reward { 3 } else { 2 };
        let targets = Tensor::randn([32, width], (Kind::Float, Device::Cpu)) * 0.1;
        dynamics.set_dataset(&inputs, &targets).unwrap();
        let policy = Policy::new(
            &PolicyConfig {
                hidden: vec![16],
                ..PolicyConfig::default()
            },
            2,
            &[1.0],
            Device::Cpu,
        );
        (dynamics, policy)
    }

    #[test]
    fn returns_have_one_entry_per_particle() {
        let (mut dynamics, mut policy) = fitted_pair(true);
        let mut rng = RandomSource::new(0);
        let x0 = Tensor::zeros([7, 2], (Kind::Float, Device::Cpu));
        let options = RolloutOptions {
            horizon: 4,
            ..RolloutOptions::default()
        };
        let traj = rollout(&x0, &mut dynamics, &mut policy, &options, &mut rng).unwrap();
        assert_eq!(traj.returns.size(), &[7]);
        assert_eq!(traj.states.size(), &[5, 7, 2]);
        assert_eq!(traj.actions.size(), &[4, 7, 1]);
        assert_eq!(traj.rewards.size(), &[4, 7]);
        let summed = traj.rewards.sum_dim_intlist([0].as_slice(), false, Kind::Float);
        assert!(summed.allclose(&traj.returns, 1e-5, 1e-5, false));
    }

    /// Objective and per-particle returns of one rollout from `n` copies of
    /// the same start state.
    fn particle_returns(
        dynamics: &mut DynamicsModel,
        policy: &mut Policy,
        n: i64,
        seed: u64,
    ) -> (f64, Vec<f64>) {
        let mut rng = RandomSource::new(seed);
        let x0 = Tensor::ones([n, 2], (Kind::Float, Device::Cpu)) * 0.5;
        let options = RolloutOptions {
            horizon: 3,
            ..RolloutOptions::default()
        };
        let traj = tch::no_grad(|| rollout(&x0, dynamics, policy, &options, &mut rng)).unwrap();
        let objective = f64::try_from(&rollout_objective(&traj, RewardAggregation::Sum)).unwrap();
        let returns = Vec::<f64>::try_from(&traj.returns.to_kind(Kind::Double)).unwrap();
        (objective, returns)
    }

    fn mean_and_variance(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (mean, var)
    }

    #[test]
    fn particle_count_does_not_shift_expected_objective() {
        let (mut dynamics, mut policy) = fitted_pair(false);
        let mut collect = |n: i64, seeds: std::ops::Range<u64>| {
            let mut objectives = Vec::new();
            let mut returns = Vec::new();
            for seed in seeds {
                let (objective, particles) = particle_returns(&mut dynamics, &mut policy, n, seed);
                objectives.push(objective);
                returns.extend(particles);
            }
            (objectives, returns)
        };
        let (few_objectives, few) = collect(8, 0..64);
        let (many_objectives, many) = collect(512, 1000..1004);
        assert_eq!((few.len(), many.len()), (512, 2048));

        let (few_mean, few_var) = mean_and_variance(&few);
        let (many_mean, many_var) = mean_and_variance(&many);
        // each objective is the particle average of its returns
        let averaged = few_objectives.iter().sum::<f64>() / few_objectives.len() as f64;
        assert!((averaged - few_mean).abs() <= 1e-3 * (1.0 + few_mean.abs()));
        let averaged = many_objectives.iter().sum::<f64>() / many_objectives.len() as f64;
        assert!((averaged - many_mean).abs() <= 1e-3 * (1.0 + many_mean.abs()));

        let stderr = (few_var / few.len() as f64 + many_var / many.len() as f64).sqrt();
        assert!(
            (few_mean - many_mean).abs() <= 4.0 * stderr + 1e-6,
            "N=8: {few_mean}, N=512: {many_mean}, stderr {stderr}"
        );
    }

    #[test]
    fn horizon_zero_runs_one_step() {
        let (mut dynamics, mut policy) = fitted_pair(false);
        let mut rng = RandomSource::new(0);
        let x0 = Tensor::ones([3, 2], (Kind::Float, Device::Cpu));
        let options = RolloutOptions {
            horizon: 0,
            ..RolloutOptions::default()
        };
        let traj = rollout(&x0, &mut dynamics, &mut policy, &options, &mut rng).unwrap();
        assert_eq!(traj.steps(), 1);
        let mean = rollout_objective(&traj, RewardAggregation::Mean);
        assert!(f64::try_from(&mean).unwrap().is_finite());
    }

    #[test]
    fn discount_weights_later_rewards() {
        let (mut dynamics, mut policy) = fitted_pair(false);
        let mut rng = RandomSource::new(2);
        let x0 = Tensor::ones([4, 2], (Kind::Float, Device::Cpu));
        let options = RolloutOptions {
            horizon: 3,
            discount: 0.5,
            ..RolloutOptions::default()
        };
        let traj = rollout(&x0, &mut dynamics, &mut policy, &options, &mut rng).unwrap();
        let weights = Tensor::from_slice(&[1.0f32, 0.5, 0.25]).view([3, 1]);
        let expected =
            (&traj.rewards * weights).sum_dim_intlist([0].as_slice(), false, Kind::Float);
        assert!(expected.allclose(&traj.returns, 1e-5, 1e-5, false));
    }

    #[test]
    fn mean_aggregation_divides_by_steps() {
        let (mut dynamics, mut policy) = fitted_pair(true);
        let mut rng = RandomSource::new(3);
        let x0 = Tensor::zeros([5, 2], (Kind::Float, Device::Cpu));
        let options = RolloutOptions {
            horizon: 4,
            ..RolloutOptions::default()
        };
        let traj = rollout(&x0, &mut dynamics, &mut policy, &options, &mut rng).unwrap();
        let sum = f64::try_from(&rollout_objective(&traj, RewardAggregation::Sum)).unwrap();
        let mean = f64::try_from(&rollout_objective(&traj, RewardAggregation::Mean)).unwrap();
        assert!((sum / 4.0 - mean).abs() < 1e-5);
    }

    #[test]
    fn moment_matching_preserves_shape_and_location() {
        let mut rng = RandomSource::new(4);
        let states = Tensor::randn([2000, 2], (Kind::Float, Device::Cpu)) * 0.5 + 3.0;
        let matched = moment_match_states(&states, &mut rng).unwrap();
        assert_eq!(matched.size(), &[2000, 2]);
        let mean: Vec<f32> =
            Vec::try_from(&matched.mean_dim([0].as_slice(), false, Kind::Float)).unwrap();
        assert!(mean.iter().all(|m| (m - 3.0).abs() < 0.1));

        let rewards = Tensor::from_slice(&[1.0f32, 1.0, 1.0]);
        let matched = moment_match_rewards(&rewards, &mut rng);
        assert!(matched.allclose(&rewards, 1e-6, 1e-6, false));
    }

    #[test]
    fn moment_matched_rollout_is_differentiable() {
        let (mut dynamics, mut policy) = fitted_pair(false);
        dynamics.freeze();
        let mut rng = RandomSource::new(5);
        let x0 = Tensor::randn([16, 2], (Kind::Float, Device::Cpu));
        let options = RolloutOptions {
            horizon: 3,
            mm_states: true,
            mm_rewards: true,
            discount: 1.0,
        };
        let traj = rollout(&x0, &mut dynamics, &mut policy, &options, &mut rng).unwrap();
        rollout_objective(&traj, RewardAggregation::Sum).backward();
        let grads: f64 = policy
            .var_store()
            .trainable_variables()
            .iter()
            .map(|v| f64::try_from(&v.grad().abs().sum(Kind::Float)).unwrap())
            .sum();
        assert!(grads.is_finite() && grads > 0.0);
    }
}
