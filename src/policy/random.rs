//! Uniform random controller used to seed the experience dataset.

use super::trait_::Controller;
use crate::error::Result;
use crate::rng::RandomSource;

/// Uniformly random actions in `[-max_u, max_u]`, componentwise.
#[derive(Debug, Clone)]
pub struct RandomController {
    max_u: Vec<f64>,
}

impl RandomController {
    /// Creates a new random controller.
    ///
    /// # Arguments
    ///
    /// * `max_u` - Symmetric action bound per action dimension.
    pub fn new(max_u: Vec<f64>) -> Self {
        Self { max_u }
    }
}

impl Controller for RandomController {
    fn control(&mut self, _state: &[f64], _t: usize, rng: &mut RandomSource) -> Result<Vec<f64>> {
        Ok(self
            .max_u
            .iter()
            .map(|&m| rng.uniform_scalar(-m.abs(), m.abs()))
            .collect())
    }

    fn name(&self) -> &str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_controller_returns_action_dim() {
        let mut ctrl = RandomController::new(vec![1.0, 2.0]);
        let mut rng = RandomSource::new(0);
        let action = ctrl.control(&[0.0; 4], 0, &mut rng).unwrap();
        assert_eq!(action.len(), 2);
    }

    #[test]
    fn random_controller_actions_in_range() {
        let mut ctrl = RandomController::new(vec![0.5, 3.0]);
        let mut rng = RandomSource::new(1);
        for t in 0..100 {
            let a = ctrl.control(&[], t, &mut rng).unwrap();
            assert!(a[0].abs() <= 0.5);
            assert!(a[1].abs() <= 3.0);
        }
    }
}
