//! One recorded trajectory of real interaction.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Named parameter tensor copied out of a var store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSnapshot {
    pub name: String,
    pub shape: Vec<i64>,
    pub values: Vec<f32>,
}

/// `(state, action, reward)` triples of one trajectory, the state reached
/// after the last action, and the policy parameters that produced it
/// (empty for random exploration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    states: Vec<Vec<f64>>,
    actions: Vec<Vec<f64>>,
    rewards: Vec<f64>,
    final_state: Vec<f64>,
    policy_params: Vec<ParamSnapshot>,
}

impl Episode {
    /// Builds an episode, checking that the sequences line up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if the sequence lengths differ or
    /// a state/action has a different width than the first one, and
    /// [`Error::NonFinite`] for NaN or infinite entries, which could not be
    /// saved and loaded back.
    pub fn new(
        states: Vec<Vec<f64>>,
        actions: Vec<Vec<f64>>,
        rewards: Vec<f64>,
        final_state: Vec<f64>,
        policy_params: Vec<ParamSnapshot>,
    ) -> Result<Self> {
        let steps = states.len();
        if actions.len() != steps {
            return Err(Error::DimensionMismatch {
                what: "episode actions",
                expected: steps,
                actual: actions.len(),
            });
        }
        if rewards.len() != steps {
            return Err(Error::DimensionMismatch {
                what: "episode rewards",
                expected: steps,
                actual: rewards.len(),
            });
        }
        let state_dim = final_state.len();
        if let Some(bad) = states.iter().find(|s| s.len() != state_dim) {
            return Err(Error::DimensionMismatch {
                what: "episode state",
                expected: state_dim,
                actual: bad.len(),
            });
        }
        if let Some(first) = actions.first() {
            if let Some(bad) = actions.iter().find(|a| a.len() != first.len()) {
                return Err(Error::DimensionMismatch {
                    what: "episode action",
                    expected: first.len(),
                    actual: bad.len(),
                });
            }
        }
        let finite = |v: &[f64]| v.iter().all(|x| x.is_finite());
        for (what, rows) in [("state", &states), ("action", &actions)] {
            if let Some(step) = rows.iter().position(|row| !finite(row.as_slice())) {
                return Err(Error::NonFinite { what, step });
            }
        }
        if let Some(step) = rewards.iter().position(|r| !r.is_finite()) {
            return Err(Error::NonFinite {
                what: "reward",
                step,
            });
        }
        if !finite(&final_state) {
            return Err(Error::NonFinite {
                what: "final state",
                step: steps,
            });
        }
        Ok(Self {
            states,
            actions,
            rewards,
            final_state,
            policy_params,
        })
    }

    /// Attaches the parameters of the policy that produced the episode.
    pub fn with_policy_params(mut self, params: Vec<ParamSnapshot>) -> Self {
        self.policy_params = params;
        self
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[Vec<f64>] {
        &self.states
    }

    pub fn actions(&self) -> &[Vec<f64>] {
        &self.actions
    }

    pub fn rewards(&self) -> &[f64] {
        &self.rewards
    }

    pub fn final_state(&self) -> &[f64] {
        &self.final_state
    }

    pub fn policy_params(&self) -> &[ParamSnapshot] {
        &self.policy_params
    }

    pub fn state_dim(&self) -> usize {
        self.final_state.len()
    }

    /// Action width, `None` for an episode without steps.
    pub fn action_dim(&self) -> Option<usize> {
        self.actions.first().map(Vec::len)
    }

    /// State observed after the action at step `t`.
    pub fn next_state(&self, t: usize) -> Option<&[f64]> {
        if t + 1 < self.states.len() {
            Some(&self.states[t + 1])
        } else if t + 1 == self.states.len() {
            Some(&self.final_state)
        } else {
            None
        }
    }

    /// Undiscounted return.
    pub fn total_reward(&self) -> f64 {
        self.rewards.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode(steps: usize) -> Episode {
        let states: Vec<Vec<f64>> = (0..steps).map(|t| vec![t as f64, 0.0]).collect();
        let actions = vec![vec![1.0]; steps];
        let rewards = vec![-1.0; steps];
        Episode::new(states, actions, rewards, vec![steps as f64, 0.0], Vec::new()).unwrap()
    }

    #[test]
    fn next_state_walks_into_final_state() {
        let ep = episode(3);
        assert_eq!(ep.next_state(0), Some(&[1.0, 0.0][..]));
        assert_eq!(ep.next_state(2), Some(&[3.0, 0.0][..]));
        assert_eq!(ep.next_state(3), None);
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let err = Episode::new(vec![vec![0.0]], vec![], vec![0.0], vec![0.0], Vec::new());
        assert!(matches!(err, Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn ragged_states_rejected() {
        let err = Episode::new(
            vec![vec![0.0, 1.0], vec![0.0]],
            vec![vec![0.0]; 2],
            vec![0.0; 2],
            vec![0.0, 0.0],
            Vec::new(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn non_finite_values_rejected() {
        let err = Episode::new(
            vec![vec![0.0], vec![1.0]],
            vec![vec![0.5]; 2],
            vec![-1.0, f64::NAN],
            vec![2.0],
            Vec::new(),
        );
        assert!(matches!(err, Err(Error::NonFinite { what: "reward", step: 1 })));

        let err = Episode::new(
            vec![vec![f64::INFINITY]],
            vec![vec![0.5]],
            vec![-1.0],
            vec![2.0],
            Vec::new(),
        );
        assert!(matches!(err, Err(Error::NonFinite { what: "state", step: 0 })));

        let err = Episode::new(vec![vec![0.0]], vec![vec![0.5]], vec![0.0], vec![f64::NAN], vec![]);
        assert!(matches!(err, Err(Error::NonFinite { what: "final state", .. })));
    }

    #[test]
    fn total_reward_sums() {
        assert_eq!(episode(4).total_reward(), -4.0);
        assert_eq!(episode(4).action_dim(), Some(1));
    }
}
