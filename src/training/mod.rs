//! Training loops: model fitting, simulated policy search and the outer
//! policy-iteration cycle.

pub mod mc_pilco;
pub mod policy_iteration;
pub mod regressor;
pub mod rollout;

pub use mc_pilco::{mc_pilco, PolicySearchConfig, PolicySearchIteration};
pub use policy_iteration::{apply_controller, Phase, PolicyIteration};
pub use regressor::{train_regressor, Regressor, RegressorConfig, RegressorIteration};
pub use rollout::{rollout, rollout_objective, RewardAggregation, RolloutOptions, Trajectory};
