//! Single-integrator toy system `x' = x + dt·u`, reward `-‖x'‖²`.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tch::Kind;

use super::{Environment, StepResult};
use crate::dynamics::RewardFn;
use crate::error::{Error, Result};

/// Integrator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratorConfig {
    /// State (and action) width.
    pub dim: usize,
    /// Step length.
    pub dt: f64,
    /// Action bound per dimension.
    pub max_action: f64,
    /// Mean of the initial state, shared by every dimension.
    pub initial_state: f64,
    /// Standard deviation of the initial state.
    pub initial_std: f64,
    /// Episode ends once `‖x‖` exceeds this value.
    pub divergence_limit: f64,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            dim: 1,
            dt: 0.1,
            max_action: 1.0,
            initial_state: 1.0,
            initial_std: 0.05,
            divergence_limit: 1e3,
        }
    }
}

/// Deterministic integrator with a stochastic initial state.
#[derive(Debug)]
pub struct Integrator {
    config: IntegratorConfig,
    state: Vec<f64>,
    rng: StdRng,
}

impl Integrator {
    /// Creates the system with the given configuration and RNG seed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero width or a negative
    /// initial spread.
    pub fn new(config: IntegratorConfig, seed: u64) -> Result<Self> {
        if config.dim == 0 {
            return Err(Error::InvalidConfig("integrator dim must be positive".into()));
        }
        if config.initial_std.is_nan() || config.initial_std < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "integrator initial_std must be non-negative, got {}",
                config.initial_std
            )));
        }
        let state = vec![config.initial_state; config.dim];
        Ok(Self {
            config,
            state,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Current state.
    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }
}

impl Environment for Integrator {
    fn reset(&mut self) -> Result<Vec<f64>> {
        let normal = Normal::new(self.config.initial_state, self.config.initial_std)
            .map_err(|e| Error::Environment(e.to_string()))?;
        self.state = (0..self.config.dim)
            .map(|_| normal.sample(&mut self.rng))
            .collect();
        Ok(self.state.clone())
    }

    fn step(&mut self, action: &[f64]) -> Result<StepResult> {
        if action.len() != self.config.dim {
            return Err(Error::Environment(format!(
                "expected {} action values, got {}",
                self.config.dim,
                action.len()
            )));
        }
        let bound = self.config.max_action.abs();
        for (x, u) in self.state.iter_mut().zip(action) {
            *x += self.config.dt * u.clamp(-bound, bound);
        }
        let sq_norm: f64 = self.state.iter().map(|x| x * x).sum();
        Ok(StepResult {
            state: self.state.clone(),
            reward: -sq_norm,
            done: !sq_norm.is_finite() || sq_norm.sqrt() > self.config.divergence_limit,
        })
    }

    fn observation_dim(&self) -> usize {
        self.config.dim
    }

    fn action_dim(&self) -> usize {
        self.config.dim
    }

    fn max_action(&self) -> Vec<f64> {
        vec![self.config.max_action.abs(); self.config.dim]
    }

    fn reward_fn(&self) -> Option<RewardFn> {
        Some(Box::new(|_state, _action, next| {
            -next.square().sum_dim_intlist([-1].as_slice(), false, Kind::Float)
        }))
    }

    fn name(&self) -> &str {
        "Integrator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Tensor;

    #[test]
    fn step_integrates_action() {
        let mut env = Integrator::new(
            IntegratorConfig {
                dim: 2,
                initial_std: 0.0,
                ..IntegratorConfig::default()
            },
            0,
        )
        .unwrap();
        assert_eq!(env.reset().unwrap(), vec![1.0, 1.0]);
        let result = env.step(&[-1.0, 0.5]).unwrap();
        assert!((result.state[0] - 0.9).abs() < 1e-12);
        assert!((result.state[1] - 1.05).abs() < 1e-12);
        let expected = -(0.9f64.powi(2) + 1.05f64.powi(2));
        assert!((result.reward - expected).abs() < 1e-12);
        assert!(!result.done);
    }

    #[test]
    fn actions_are_clipped() {
        let mut env = Integrator::new(
            IntegratorConfig {
                initial_std: 0.0,
                ..IntegratorConfig::default()
            },
            0,
        )
        .unwrap();
        env.reset().unwrap();
        let result = env.step(&[100.0]).unwrap();
        assert!((result.state[0] - 1.1).abs() < 1e-12);
    }

    #[test]
    fn wrong_action_width_is_an_error() {
        let mut env = Integrator::new(IntegratorConfig::default(), 0).unwrap();
        env.reset().unwrap();
        assert!(matches!(env.step(&[0.0, 0.0]), Err(Error::Environment(_))));
    }

    #[test]
    fn reset_is_seeded() {
        let mut a = Integrator::new(IntegratorConfig::default(), 7).unwrap();
        let mut b = Integrator::new(IntegratorConfig::default(), 7).unwrap();
        assert_eq!(a.reset().unwrap(), b.reset().unwrap());
    }

    #[test]
    fn reward_fn_matches_step_reward() {
        let mut env = Integrator::new(
            IntegratorConfig {
                dim: 2,
                ..IntegratorConfig::default()
            },
            3,
        )
        .unwrap();
        let x = env.reset().unwrap();
        let result = env.step(&[0.3, -0.2]).unwrap();
        let reward_fn = env.reward_fn().unwrap();
        let to_t = |v: &[f64]| Tensor::from_slice(v).to_kind(Kind::Float).unsqueeze(0);
        let r = reward_fn(&to_t(&x), &to_t(&[0.3, -0.2]), &to_t(&result.state));
        assert_eq!(r.size(), &[1]);
        let r = f64::try_from(&r.get(0)).unwrap();
        assert!((r - result.reward).abs() < 1e-4);
    }

    #[test]
    fn rejects_zero_dim() {
        let config = IntegratorConfig {
            dim: 0,
            ..IntegratorConfig::default()
        };
        assert!(Integrator::new(config, 0).is_err());
    }
}
