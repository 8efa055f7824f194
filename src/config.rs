//! Run configuration for the policy-iteration loop.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::dynamics::DynamicsConfig;
use crate::error::{Error, Result};
use crate::network::DropoutConfig;
use crate::policy::PolicyConfig;
use crate::training::{PolicySearchConfig, RegressorConfig};

/// Full configuration of an MC-PILCO run.
///
/// Defaults reproduce the reference cart-pole setup: 4 random episodes,
/// 60-step episodes, 15-step predictions with 100 particles, 2000 model and
/// 1000 policy optimizer steps per cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MbrlConfig {
    /// Seed of the random source and of torch.
    pub seed: u64,
    /// Episodes collected with random actions before learning starts.
    pub n_random: usize,
    /// Policy-search cycles after the random episodes.
    pub n_iterations: usize,
    /// Length of every real episode.
    pub control_horizon: usize,
    /// Number of particles for initial states and rollouts.
    pub n_particles: usize,
    /// Run on CUDA when available.
    pub use_cuda: bool,
    /// Directory of the experience archive; `None` disables saving.
    pub results_dir: Option<PathBuf>,
    /// Call [`crate::environment::Environment::render`] while collecting.
    pub render: bool,
    pub dynamics: DynamicsConfig,
    pub policy: PolicyConfig,
    pub regressor: RegressorConfig,
    pub policy_search: PolicySearchConfig,
}

impl Default for MbrlConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            n_random: 4,
            n_iterations: 100,
            control_horizon: 60,
            n_particles: 100,
            use_cuda: false,
            results_dir: None,
            render: false,
            dynamics: DynamicsConfig::default(),
            policy: PolicyConfig::default(),
            regressor: RegressorConfig::default(),
            policy_search: PolicySearchConfig::default(),
        }
    }
}

impl MbrlConfig {
    /// Reads a JSON configuration; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        config.validate()?;
        Ok(config)
    }

    /// Device selected by `use_cuda`.
    pub fn device(&self) -> Device {
        if self.use_cuda {
            Device::cuda_if_available()
        } else {
            Device::Cpu
        }
    }

    /// Rejects values the training loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(Error::InvalidConfig(msg)) };
        if self.n_random == 0 {
            return invalid("n_random must be at least 1".into());
        }
        if self.control_horizon == 0 {
            return invalid("control_horizon must be positive".into());
        }
        if self.n_particles == 0 || self.regressor.n_particles == 0 {
            return invalid("particle counts must be positive".into());
        }
        if self.regressor.batch_size == Some(0) {
            return invalid("regressor batch_size must be positive".into());
        }
        if self.dynamics.components == 0 {
            return Err(Error::InvalidComponentCount(0));
        }
        for (name, lr) in [
            ("dynamics", self.dynamics.learning_rate),
            ("policy", self.policy.learning_rate),
        ] {
            if !(lr.is_finite() && lr > 0.0) {
                return invalid(format!("{name} learning rate must be positive, got {lr}"));
            }
        }
        if !(0.0..1.0).contains(&self.policy.dropout_p) {
            return invalid(format!(
                "policy dropout_p must be in [0, 1), got {}",
                self.policy.dropout_p
            ));
        }
        match self.dynamics.network.dropout {
            DropoutConfig::Bernoulli { p } if !(0.0..1.0).contains(&p) => {
                return invalid(format!("dynamics dropout p must be in [0, 1), got {p}"));
            }
            DropoutConfig::Concrete(c)
                if !(c.init_p > 0.0 && c.init_p < 1.0 && c.temperature > 0.0) =>
            {
                return invalid(
                    "concrete dropout needs init_p in (0, 1) and a positive temperature".into(),
                );
            }
            _ => {}
        }
        let search = &self.policy_search;
        if !(search.discount > 0.0 && search.discount <= 1.0) {
            return invalid(format!("discount must be in (0, 1], got {}", search.discount));
        }
        if search.init_state_noise.is_nan() || search.init_state_noise < 0.0 {
            return invalid("init_state_noise must be non-negative".into());
        }
        if search.clip_grad.is_nan() {
            return invalid("clip_grad must be a number".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConcreteDropoutConfig;

    #[test]
    fn defaults_are_valid() {
        let config = MbrlConfig::default();
        config.validate().unwrap();
        assert_eq!(config.n_random, 4);
        assert_eq!(config.policy_search.horizon, 15);
        assert_eq!(config.regressor.n_iterations, 2000);
        assert_eq!(config.regressor.batch_size, Some(100));
        assert_eq!(config.policy_search.resampling_period, 500);
        assert_eq!(config.device(), Device::Cpu);
    }

    #[test]
    fn rejects_bad_values() {
        let config = MbrlConfig {
            n_particles: 0,
            ..MbrlConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = MbrlConfig::default();
        config.dynamics.components = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidComponentCount(0))));

        let mut config = MbrlConfig::default();
        config.policy_search.discount = 1.5;
        assert!(config.validate().is_err());

        let mut config = MbrlConfig::default();
        config.dynamics.network.dropout = DropoutConfig::Concrete(ConcreteDropoutConfig {
            temperature: 0.0,
            ..ConcreteDropoutConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"seed": 9, "n_iterations": 3}"#).unwrap();
        let config = MbrlConfig::from_json_file(&path).unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.n_iterations, 3);
        assert_eq!(config.control_horizon, 60);
    }

    #[test]
    fn json_round_trip() {
        let config = MbrlConfig {
            results_dir: Some(PathBuf::from("runs")),
            ..MbrlConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: MbrlConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
