//! Output densities: turn a raw network output into a predictive distribution.
//!
//! Two parametrizations are supported:
//!
//! - [`OutputDensity::DiagGaussian`]: raw vector `[mean (E) | log-var (E)]`.
//! - [`OutputDensity::Mixture`]: raw vector
//!   `[means (C·E) | log-vars (C·E) | logits (C) | log-temperature (1)]`,
//!   i.e. `(2E + 1)·C + 1` units.
//!
//! Log-variances are clamped to `[LOG_VAR_MIN, LOG_VAR_MAX]` before they are
//! exponentiated, so log-likelihoods stay finite even when a prediction sits
//! exactly on its target.

use std::f64::consts::PI;

use tch::{Kind, Tensor};

use crate::error::{Error, Result};
use crate::rng::RandomSource;

/// Lower clamp of predicted log-variances.
pub const LOG_VAR_MIN: f64 = -12.0;
/// Upper clamp of predicted log-variances.
pub const LOG_VAR_MAX: f64 = 6.0;
/// Clamp range of the mixture log-temperature.
const LOG_TEMP_RANGE: f64 = 5.0;

/// Parametrization of a predictive distribution over `E` output channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDensity {
    /// Diagonal Gaussian over `dim` channels.
    DiagGaussian { dim: usize },
    /// Mixture of `components` diagonal Gaussians over `dim` channels.
    Mixture { dim: usize, components: usize },
}

impl OutputDensity {
    /// Diagonal Gaussian density over `dim` channels.
    pub fn diag_gaussian(dim: usize) -> Self {
        Self::DiagGaussian { dim }
    }

    /// Gaussian mixture density over `dim` channels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidComponentCount`] if `components < 1`.
    pub fn mixture(dim: usize, components: usize) -> Result<Self> {
        if components < 1 {
            return Err(Error::InvalidComponentCount(components));
        }
        Ok(Self::Mixture { dim, components })
    }

    /// Picks the single-Gaussian density for one component and the mixture
    /// density otherwise.
    pub fn for_components(dim: usize, components: usize) -> Result<Self> {
        match components {
            0 => Err(Error::InvalidComponentCount(0)),
            1 => Ok(Self::diag_gaussian(dim)),
            c => Self::mixture(dim, c),
        }
    }

    /// Number of output channels `E`.
    pub fn output_dim(&self) -> usize {
        match *self {
            Self::DiagGaussian { dim } | Self::Mixture { dim, .. } => dim,
        }
    }

    /// Number of raw network outputs this density consumes.
    pub fn raw_dim(&self) -> usize {
        match *self {
            Self::DiagGaussian { dim } => 2 * dim,
            Self::Mixture { dim, components } => (2 * dim + 1) * components + 1,
        }
    }

    /// Splits a raw `[B, raw_dim]` output into a distribution object.
    pub fn distribution(&self, raw: &Tensor) -> Result<Distribution> {
        let width = *raw.size().last().unwrap_or(&0) as usize;
        if width != self.raw_dim() {
            return Err(Error::DimensionMismatch {
                what: "raw density output",
                expected: self.raw_dim(),
                actual: width,
            });
        }
        let e = self.output_dim() as i64;
        match *self {
            Self::DiagGaussian { .. } => Ok(Distribution::Gaussian(DiagGaussian {
                mean: raw.narrow(-1, 0, e),
                log_var: raw.narrow(-1, e, e).clamp(LOG_VAR_MIN, LOG_VAR_MAX),
            })),
            Self::Mixture { components, .. } => {
                let c = components as i64;
                let batch = raw.size()[0];
                let means = raw.narrow(-1, 0, c * e).reshape([batch, c, e]);
                let log_vars = raw
                    .narrow(-1, c * e, c * e)
                    .reshape([batch, c, e])
                    .clamp(LOG_VAR_MIN, LOG_VAR_MAX);
                let logits = raw.narrow(-1, 2 * c * e, c);
                let log_temp = raw
                    .narrow(-1, 2 * c * e + c, 1)
                    .clamp(-LOG_TEMP_RANGE, LOG_TEMP_RANGE);
                let log_weights = (logits * (-log_temp).exp()).log_softmax(-1, Kind::Float);
                Ok(Distribution::Mixture(GaussianMixture {
                    means,
                    log_vars,
                    log_weights,
                }))
            }
        }
    }
}

/// Diagonal Gaussian with batched `[B, E]` parameters.
#[derive(Debug)]
pub struct DiagGaussian {
    pub mean: Tensor,
    pub log_var: Tensor,
}

impl DiagGaussian {
    /// Per-row log-density of `target`, shape `[B]`.
    pub fn log_likelihood(&self, target: &Tensor) -> Tensor {
        gaussian_log_density(target, &self.mean, &self.log_var)
    }

    /// Reparametrized sample `mean + std * eps`.
    pub fn sample(&self, rng: &mut RandomSource) -> Tensor {
        let eps = rng.normal(&self.mean.size(), self.mean.device());
        &self.mean + (&self.log_var * 0.5).exp() * eps
    }
}

/// Mixture of diagonal Gaussians: means/log-vars `[B, C, E]`, log-weights `[B, C]`.
#[derive(Debug)]
pub struct GaussianMixture {
    pub means: Tensor,
    pub log_vars: Tensor,
    pub log_weights: Tensor,
}

impl GaussianMixture {
    /// Number of mixture components.
    pub fn components(&self) -> i64 {
        self.log_weights.size()[1]
    }

    /// Per-row log-density of `target` via a stabilized log-sum-exp.
    pub fn log_likelihood(&self, target: &Tensor) -> Tensor {
        let per_component = gaussian_log_density(&target.unsqueeze(1), &self.means, &self.log_vars);
        (&self.log_weights + per_component).logsumexp([1].as_slice(), false)
    }

    /// Mixture mean `Σ_c w_c μ_c`.
    pub fn mean(&self) -> Tensor {
        (self.log_weights.exp().unsqueeze(-1) * &self.means).sum_dim_intlist(
            [1].as_slice(),
            false,
            Kind::Float,
        )
    }

    /// Samples a component per row, then a reparametrized draw inside it.
    pub fn sample(&self, rng: &mut RandomSource) -> Tensor {
        let device = self.means.device();
        let size = self.means.size();
        let (batch, dim) = (size[0], size[2]);
        let c = self.components();

        let u = rng.uniform(&[batch, 1], device);
        let cdf = self.log_weights.detach().exp().cumsum(1, Kind::Float);
        let index = cdf
            .lt_tensor(&u)
            .sum_dim_intlist([1].as_slice(), false, Kind::Int64)
            .clamp_max(c - 1);
        let selector = index.one_hot(c).to_kind(Kind::Float).unsqueeze(-1);

        let mean = (&selector * &self.means).sum_dim_intlist([1].as_slice(), false, Kind::Float);
        let log_var =
            (&selector * &self.log_vars).sum_dim_intlist([1].as_slice(), false, Kind::Float);
        let eps = rng.normal(&[batch, dim], device);
        mean + (log_var * 0.5).exp() * eps
    }
}

/// A predictive distribution produced by an [`OutputDensity`].
#[derive(Debug)]
pub enum Distribution {
    Gaussian(DiagGaussian),
    Mixture(GaussianMixture),
}

impl Distribution {
    /// Expected value, shape `[B, E]`.
    pub fn mean(&self) -> Tensor {
        match self {
            Self::Gaussian(g) => g.mean.shallow_clone(),
            Self::Mixture(m) => m.mean(),
        }
    }

    /// Reparametrized sample, shape `[B, E]`.
    pub fn sample(&self, rng: &mut RandomSource) -> Tensor {
        match self {
            Self::Gaussian(g) => g.sample(rng),
            Self::Mixture(m) => m.sample(rng),
        }
    }

    /// Per-row log-likelihood of `target`, shape `[B]`.
    pub fn log_likelihood(&self, target: &Tensor) -> Tensor {
        match self {
            Self::Gaussian(g) => g.log_likelihood(target),
            Self::Mixture(m) => m.log_likelihood(target),
        }
    }

    /// Maps a distribution over normalized targets back to raw scale:
    /// `y = loc + scale * z` for per-channel `loc`/`scale` of shape `[E]`.
    pub fn rescale(self, loc: &Tensor, scale: &Tensor) -> Self {
        let log_var_shift = scale.log() * 2.0;
        match self {
            Self::Gaussian(g) => Self::Gaussian(DiagGaussian {
                mean: g.mean * scale + loc,
                log_var: g.log_var + &log_var_shift,
            }),
            Self::Mixture(m) => Self::Mixture(GaussianMixture {
                means: m.means * scale + loc,
                log_vars: m.log_vars + &log_var_shift,
                log_weights: m.log_weights,
            }),
        }
    }
}

/// Log-density of a diagonal Gaussian summed over the last dimension.
fn gaussian_log_density(target: &Tensor, mean: &Tensor, log_var: &Tensor) -> Tensor {
    let sq = (target - mean).square() * (-log_var).exp();
    ((sq + log_var + (2.0 * PI).ln()) * -0.5).sum_dim_intlist([-1].as_slice(), false, Kind::Float)
}
