//! Log-likelihood objectives for the regressor trainer.
//!
//! Each function returns the per-row log-likelihood `[B]` of `targets`
//! under a predicted distribution and refuses densities of the wrong family.

use tch::Tensor;

use crate::density::{Distribution, OutputDensity};
use crate::error::{Error, Result};

/// Signature shared by the likelihood objectives.
pub type LogLikelihoodFn = fn(&Distribution, &Tensor) -> Result<Tensor>;

/// Log-likelihood of `targets` under a diagonal Gaussian prediction.
pub fn gaussian_log_likelihood(dist: &Distribution, targets: &Tensor) -> Result<Tensor> {
    match dist {
        Distribution::Gaussian(g) => Ok(g.log_likelihood(targets)),
        Distribution::Mixture(_) => Err(Error::DensityMismatch {
            expected: "diagonal Gaussian",
        }),
    }
}

/// Log-likelihood of `targets` under a Gaussian mixture prediction.
pub fn gaussian_mixture_log_likelihood(dist: &Distribution, targets: &Tensor) -> Result<Tensor> {
    match dist {
        Distribution::Mixture(m) => Ok(m.log_likelihood(targets)),
        Distribution::Gaussian(_) => Err(Error::DensityMismatch {
            expected: "Gaussian mixture",
        }),
    }
}

/// Returns the objective matching an output density.
pub fn log_likelihood_for(density: &OutputDensity) -> LogLikelihoodFn {
    match density {
        OutputDensity::DiagGaussian { .. } => gaussian_log_likelihood,
        OutputDensity::Mixture { .. } => gaussian_mixture_log_likelihood,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn gaussian_objective_rejects_mixture() {
        let density = OutputDensity::mixture(2, 2).unwrap();
        let raw = Tensor::zeros([3, density.raw_dim() as i64], (Kind::Float, Device::Cpu));
        let dist = density.distribution(&raw).unwrap();
        let targets = Tensor::zeros([3, 2], (Kind::Float, Device::Cpu));
        assert!(matches!(
            gaussian_log_likelihood(&dist, &targets),
            Err(Error::DensityMismatch { .. })
        ));
        assert!(gaussian_mixture_log_likelihood(&dist, &targets).is_ok());
    }

    #[test]
    fn objective_selection_follows_density() {
        let density = OutputDensity::diag_gaussian(2);
        let raw = Tensor::zeros([3, 4], (Kind::Float, Device::Cpu));
        let dist = density.distribution(&raw).unwrap();
        let targets = Tensor::zeros([3, 2], (Kind::Float, Device::Cpu));
        let ll = log_likelihood_for(&density)(&dist, &targets).unwrap();
        assert_eq!(ll.size(), &[3]);
    }
}
