//! Dropout stages that keep their sampled masks between calls.

use tch::{nn, Kind, Tensor};

use super::Stage;
use crate::rng::RandomSource;

/// Margin keeping a learnable drop probability away from 0 and 1.
pub const P_MIN: f64 = 1e-3;

/// Fixed-rate dropout: units are zeroed with probability `p` and survivors
/// rescaled by `1 / (1 - p)`.
///
/// Used by policies, where the sampled mask acts as structural exploration
/// noise rather than model uncertainty.
#[derive(Debug)]
pub struct BernoulliDropout {
    p: f64,
    mask: Option<Tensor>,
}

impl BernoulliDropout {
    /// Creates a fixed-rate dropout stage. `p` is clamped into `[0, 1 - P_MIN]`.
    pub fn new(p: f64) -> Self {
        Self {
            p: p.clamp(0.0, 1.0 - P_MIN),
            mask: None,
        }
    }

    fn resample(&mut self, size: &[i64], rng: &mut RandomSource, device: tch::Device) {
        let keep = rng.uniform(size, device).ge(self.p).to_kind(Kind::Float);
        self.mask = Some(keep / (1.0 - self.p));
    }
}

impl Stage for BernoulliDropout {
    fn forward(&mut self, xs: &Tensor, rng: &mut RandomSource, resample: bool) -> Tensor {
        if self.p == 0.0 {
            return xs.shallow_clone();
        }
        let size = xs.size();
        let stale = self.mask.as_ref().map_or(true, |m| m.size() != size);
        if resample || stale {
            self.resample(&size, rng, xs.device());
        }
        match &self.mask {
            Some(mask) => xs * mask,
            None => xs.shallow_clone(),
        }
    }

    fn drop_probability(&self) -> Option<f64> {
        Some(self.p)
    }
}

/// Configuration of a [`ConcreteDropout`] stage.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConcreteDropoutConfig {
    /// Initial drop probability.
    pub init_p: f64,
    /// Temperature of the relaxed Bernoulli; smaller is closer to hard masks.
    pub temperature: f64,
    /// Prior length-scale weight on the following layer's weights.
    pub weight_reg: f64,
    /// Weight of the entropy prior on the drop probability.
    pub dropout_reg: f64,
}

impl Default for ConcreteDropoutConfig {
    fn default() -> Self {
        Self {
            init_p: 0.1,
            temperature: 0.1,
            weight_reg: 1e-2,
            dropout_reg: 1e-2,
        }
    }
}

/// Concrete (relaxed Bernoulli) dropout with a learnable drop probability.
///
/// The probability is stored as an unconstrained logit in the var store and
/// mapped through `P_MIN + (1 - 2·P_MIN)·sigmoid(logit)`. The cached noise is
/// the uniform draw, not the mask, so a reused draw still yields gradients
/// with respect to `p`.
#[derive(Debug)]
pub struct ConcreteDropout {
    logit: Tensor,
    config: ConcreteDropoutConfig,
    noise: Option<Tensor>,
}

impl ConcreteDropout {
    /// Registers the drop-probability logit under `path`.
    pub fn new(path: nn::Path, config: ConcreteDropoutConfig) -> Self {
        let p0 = config.init_p.clamp(2.0 * P_MIN, 1.0 - 2.0 * P_MIN);
        let s = (p0 - P_MIN) / (1.0 - 2.0 * P_MIN);
        let logit0 = (s / (1.0 - s)).ln();
        let logit = path.var("logit_p", &[1], nn::Init::Const(logit0));
        Self {
            logit,
            config,
            noise: None,
        }
    }

    /// Differentiable drop probability (shape `[1]`).
    pub fn p(&self) -> Tensor {
        self.logit.sigmoid() * (1.0 - 2.0 * P_MIN) + P_MIN
    }
}

impl Stage for ConcreteDropout {
    fn forward(&mut self, xs: &Tensor, rng: &mut RandomSource, resample: bool) -> Tensor {
        let size = xs.size();
        let stale = self.noise.as_ref().map_or(true, |u| u.size() != size);
        if resample || stale {
            self.noise = Some(rng.uniform(&size, xs.device()));
        }
        let p = self.p();
        let u = match &self.noise {
            Some(u) => u.shallow_clone(),
            None => return xs.shallow_clone(),
        };
        let drop = ((p.log() - (1.0f64 - &p).log() + u.log() - (1.0f64 - &u).log())
            / self.config.temperature)
            .sigmoid();
        let retain = 1.0 - drop;
        xs * retain / (1.0 - p)
    }

    fn regularization(&self, next_weights: Option<&Tensor>) -> Option<Tensor> {
        let p = self.p();
        let entropy = &p * p.log() + (1.0 - &p) * (1.0f64 - &p).log();
        let units = next_weights.map_or(1, |w| w.size()[1]) as f64;
        let mut reg: Tensor = entropy * (self.config.dropout_reg * units);
        if let Some(w) = next_weights {
            let weight_term = w.square().sum(Kind::Float) * self.config.weight_reg / (1.0 - &p);
            reg = reg + weight_term;
        }
        Some(reg.sum(Kind::Float))
    }

    fn drop_probability(&self) -> Option<f64> {
        f64::try_from(&self.p().detach().view([-1]).get(0)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn ones(rows: i64, cols: i64) -> Tensor {
        Tensor::ones([rows, cols], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn bernoulli_mask_reused_without_resample() {
        let mut rng = RandomSource::new(1);
        let mut drop = BernoulliDropout::new(0.5);
        let a = drop.forward(&ones(8, 16), &mut rng, true);
        let b = drop.forward(&ones(8, 16), &mut rng, false);
        assert!(a.equal(&b));
        let c = drop.forward(&ones(8, 16), &mut rng, true);
        assert!(!a.equal(&c));
    }

    #[test]
    fn bernoulli_rescales_survivors() {
        let mut rng = RandomSource::new(2);
        let mut drop = BernoulliDropout::new(0.25);
        let out = drop.forward(&ones(4, 32), &mut rng, true);
        let max = f64::try_from(&out.max()).unwrap();
        let min = f64::try_from(&out.min()).unwrap();
        assert!((max - 1.0 / 0.75).abs() < 1e-5);
        assert_eq!(min, 0.0);
    }

    #[test]
    fn bernoulli_redraws_on_shape_change() {
        let mut rng = RandomSource::new(3);
        let mut drop = BernoulliDropout::new(0.1);
        drop.forward(&ones(4, 8), &mut rng, true);
        let out = drop.forward(&ones(6, 8), &mut rng, false);
        assert_eq!(out.size(), &[6, 8]);
    }

    #[test]
    fn concrete_initial_probability() {
        let vs = nn::VarStore::new(Device::Cpu);
        let drop = ConcreteDropout::new(vs.root() / "drop", ConcreteDropoutConfig::default());
        let p = drop.drop_probability().unwrap();
        assert!((p - 0.1).abs() < 1e-4);
    }

    #[test]
    fn concrete_probability_bounded_for_extreme_logits() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut drop = ConcreteDropout::new(vs.root() / "drop", ConcreteDropoutConfig::default());
        tch::no_grad(|| {
            drop.logit.copy_(&Tensor::from_slice(&[1e4f32]));
        });
        let hi = drop.drop_probability().unwrap();
        tch::no_grad(|| {
            drop.logit.copy_(&Tensor::from_slice(&[-1e4f32]));
        });
        let lo = drop.drop_probability().unwrap();
        assert!(hi < 1.0 && hi > 0.5);
        assert!(lo > 0.0 && lo < 0.5);
    }

    #[test]
    fn concrete_gradient_reaches_logit() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut drop = ConcreteDropout::new(vs.root() / "drop", ConcreteDropoutConfig::default());
        let mut rng = RandomSource::new(4);
        let out = drop.forward(&ones(16, 8), &mut rng, true);
        out.sum(Kind::Float).backward();
        let grad = f64::try_from(&drop.logit.grad().abs().sum(Kind::Float)).unwrap();
        assert!(grad > 0.0);
    }

    #[test]
    fn concrete_regularization_is_scalar() {
        let vs = nn::VarStore::new(Device::Cpu);
        let drop = ConcreteDropout::new(vs.root() / "drop", ConcreteDropoutConfig::default());
        let w = Tensor::ones([3, 5], (Kind::Float, Device::Cpu));
        let reg = drop.regularization(Some(&w)).unwrap();
        assert_eq!(reg.size(), Vec::<i64>::new());
        assert!(f64::try_from(&reg).unwrap().is_finite());
    }
}
