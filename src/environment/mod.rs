//! Real-system interface used by the policy-iteration loop.

pub mod integrator;

use crate::dynamics::RewardFn;
use crate::error::Result;

pub use integrator::{Integrator, IntegratorConfig};

/// Result of a single environment step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Observation after the step.
    pub state: Vec<f64>,
    /// Reward for the transition.
    pub reward: f64,
    /// Whether the episode ended early.
    pub done: bool,
}

/// A system that can be reset and driven one action at a time.
///
/// # Lifecycle
///
/// 1. Call [`Environment::reset`] to start an episode.
/// 2. Call [`Environment::step`] with one action per step until `done` or
///    the caller's horizon is reached.
pub trait Environment {
    /// Starts a new episode and returns the initial observation.
    fn reset(&mut self) -> Result<Vec<f64>>;

    /// Applies `action` and advances the system by one step.
    fn step(&mut self, action: &[f64]) -> Result<StepResult>;

    /// Observation width `D`.
    fn observation_dim(&self) -> usize;

    /// Action width `U`.
    fn action_dim(&self) -> usize;

    /// Symmetric action bound, one entry per action dimension.
    fn max_action(&self) -> Vec<f64>;

    /// Differentiable reward `(state, action, next_state) -> [N]`, if the
    /// environment exposes one. `None` means the reward is learned.
    fn reward_fn(&self) -> Option<RewardFn> {
        None
    }

    /// Draws the current state. No-op unless the environment has a viewer.
    fn render(&mut self) {}

    /// Short name used in result file names and logs.
    fn name(&self) -> &str;
}
