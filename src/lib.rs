//! mcpilco - Monte-Carlo probabilistic inference for learning control
//!
//! Model-based reinforcement learning with dropout-uncertainty networks:
//! a stochastic dynamics model is fitted to real experience, and a neural
//! policy is optimized by backpropagating returns through particle rollouts
//! of that model.

pub mod config;
pub mod density;
pub mod dynamics;
pub mod environment;
pub mod error;
pub mod experience;
pub mod losses;
pub mod monitor;
pub mod network;
pub mod policy;
pub mod rng;
pub mod training;

pub use config::MbrlConfig;
pub use density::{Distribution, OutputDensity};
pub use dynamics::{DynamicsConfig, DynamicsModel, RewardFn};
pub use environment::{Environment, StepResult};
pub use error::{Error, Result};
pub use experience::{Episode, ExperienceDataset};
pub use policy::{Controller, Policy, PolicyConfig, RandomController};
pub use rng::RandomSource;
pub use training::{mc_pilco, train_regressor, PolicyIteration};
