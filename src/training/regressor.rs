//! Mini-batch maximum-likelihood fitting of stochastic regressors.

use serde::{Deserialize, Serialize};
use tch::{nn, Kind, Tensor};

use crate::density::Distribution;
use crate::error::{Error, Result};
use crate::losses::LogLikelihoodFn;
use crate::rng::RandomSource;

/// A model that can be fitted by [`train_regressor`].
///
/// The training set is stored in normalized scale and
/// [`Regressor::forward_normalized`] predicts in that same scale.
pub trait Regressor {
    /// Normalized `(inputs [N, I], targets [N, E])`.
    fn training_set(&self) -> Result<(Tensor, Tensor)>;

    /// Predictive distribution for normalized inputs.
    fn forward_normalized(
        &mut self,
        inputs: &Tensor,
        rng: &mut RandomSource,
        resample: bool,
    ) -> Result<Distribution>;

    /// Regularization of the learnable dropout rates and weights.
    fn regularization(&self) -> Tensor;
}

/// Hyperparameters for [`train_regressor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressorConfig {
    /// Number of optimizer steps.
    pub n_iterations: usize,
    /// Copies of each mini-batch, each with its own dropout masks.
    pub n_particles: usize,
    /// Rows per mini-batch; `None` uses the whole training set.
    pub batch_size: Option<usize>,
    /// Maximize the log-likelihood (otherwise minimize the supplied objective).
    pub maximize: bool,
}

impl Default for RegressorConfig {
    fn default() -> Self {
        Self {
            n_iterations: 2000,
            n_particles: 100,
            batch_size: Some(100),
            maximize: true,
        }
    }
}

/// Per-iteration progress reported by [`train_regressor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressorIteration {
    pub iteration: usize,
    /// Rows fed to the network: batch size times particles.
    pub rows: usize,
    /// Minimized quantity, regularization included.
    pub loss: f64,
    /// Mean objective over particles and batch rows.
    pub log_likelihood: f64,
}

/// Fits `model` to its stored training set.
///
/// Each iteration draws one mini-batch without replacement, replicates it
/// `n_particles` times so every copy sees fresh dropout masks, averages the
/// per-row objective and adds the model regularization scaled by `1/N`
/// before a single optimizer step.
///
/// # Returns
///
/// The loss of every iteration (learning curve).
pub fn train_regressor<R: Regressor + ?Sized>(
    model: &mut R,
    optimizer: &mut nn::Optimizer,
    config: &RegressorConfig,
    log_likelihood: LogLikelihoodFn,
    rng: &mut RandomSource,
    mut on_iteration: impl FnMut(&RegressorIteration),
) -> Result<Vec<f64>> {
    if config.n_particles == 0 {
        return Err(Error::InvalidConfig("n_particles must be positive".into()));
    }
    let (inputs, targets) = model.training_set()?;
    let n = inputs.size().first().copied().unwrap_or(0) as usize;
    if n == 0 {
        return Err(Error::EmptyDataset);
    }
    let batch = config.batch_size.map_or(n, |b| b.clamp(1, n));
    let device = inputs.device();
    let particles = config.n_particles as i64;

    let mut curve = Vec::with_capacity(config.n_iterations);
    for iteration in 0..config.n_iterations {
        let (x, y) = if batch == n {
            (inputs.shallow_clone(), targets.shallow_clone())
        } else {
            let rows: Vec<i64> = rng
                .permutation_prefix(batch, n)
                .into_iter()
                .map(|i| i as i64)
                .collect();
            let index = Tensor::from_slice(&rows).to_device(device);
            (
                inputs.index_select(0, &index),
                targets.index_select(0, &index),
            )
        };
        let x = x.repeat([particles, 1]);
        let y = y.repeat([particles, 1]);

        let dist = model.forward_normalized(&x, rng, true)?;
        let objective = log_likelihood(&dist, &y)?.mean(Kind::Float);
        // scaled by the dataset size, not the batch
        let reg = model.regularization() / n as f64;
        let loss = if config.maximize {
            -&objective + reg
        } else {
            &objective + reg
        };

        optimizer.zero_grad();
        loss.backward();
        optimizer.step();

        let progress = RegressorIteration {
            iteration,
            rows: batch * config.n_particles,
            loss: f64::try_from(&loss)?,
            log_likelihood: f64::try_from(&objective)?,
        };
        if iteration % 100 == 0 {
            tracing::debug!(
                iteration,
                loss = progress.loss,
                log_likelihood = progress.log_likelihood,
                "regressor step"
            );
        }
        on_iteration(&progress);
        curve.push(progress.loss);
    }
    if let Some(last) = curve.last() {
        tracing::info!(iterations = curve.len(), loss = last, "regressor trained");
    }
    Ok(curve)
}
