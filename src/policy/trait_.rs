//! Controller trait for acting in a live environment.

use crate::error::Result;
use crate::rng::RandomSource;

/// Maps an observed state to an action, one step at a time.
///
/// Implementations return detached plain values; the differentiable path
/// used by policy search is [`crate::policy::Policy::act`].
pub trait Controller {
    /// Selects the action for `state` at timestep `t` of the episode.
    ///
    /// # Arguments
    ///
    /// * `state` - Current observation
    /// * `t` - Timestep within the episode (0 at reset)
    /// * `rng` - Random source for stochastic controllers
    fn control(&mut self, state: &[f64], t: usize, rng: &mut RandomSource) -> Result<Vec<f64>>;

    /// Returns a human-readable name for this controller.
    fn name(&self) -> &str;
}
