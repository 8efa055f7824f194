//! Uncertainty-aware feed-forward networks.
//!
//! A network is a [`StochasticSeq`] of typed stages (affine layers,
//! activations, dropout masks). Every stage implements [`Stage`], whose
//! `forward` takes the random source and a `resample` flag: with
//! `resample == false` the dropout stages reuse the masks drawn on the
//! previous call, which keeps a particle's sampled network fixed across the
//! steps of a rollout.

pub mod dropout;
pub mod mlp;
pub mod seq;

use std::fmt;

use tch::{nn, nn::Module, Tensor};

use crate::rng::RandomSource;

pub use dropout::{BernoulliDropout, ConcreteDropout, ConcreteDropoutConfig};
pub use mlp::{mlp, DropoutConfig, MlpConfig};
pub use seq::{seq, StochasticSeq};

/// One stage of a [`StochasticSeq`].
pub trait Stage: fmt::Debug {
    /// Applies the stage. Stochastic stages draw new noise when `resample`
    /// is true or when no noise of the right shape is cached.
    fn forward(&mut self, xs: &Tensor, rng: &mut RandomSource, resample: bool) -> Tensor;

    /// Weight matrix of an affine stage.
    fn weights(&self) -> Option<&Tensor> {
        None
    }

    /// Regularization term of a learnable stage; `next_weights` is the weight
    /// matrix of the affine stage that consumes this stage's output.
    fn regularization(&self, _next_weights: Option<&Tensor>) -> Option<Tensor> {
        None
    }

    /// Current drop probability of a dropout stage.
    fn drop_probability(&self) -> Option<f64> {
        None
    }
}

impl Stage for nn::Linear {
    fn forward(&mut self, xs: &Tensor, _rng: &mut RandomSource, _resample: bool) -> Tensor {
        Module::forward(self, xs)
    }

    fn weights(&self) -> Option<&Tensor> {
        Some(&self.ws)
    }
}

/// Elementwise nonlinearities selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Activation {
    Identity,
    #[default]
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    /// Applies the nonlinearity.
    pub fn apply(self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Identity => xs.shallow_clone(),
            Activation::Relu => xs.relu(),
            Activation::Tanh => xs.tanh(),
            Activation::Sigmoid => xs.sigmoid(),
        }
    }
}

impl Stage for Activation {
    fn forward(&mut self, xs: &Tensor, _rng: &mut RandomSource, _resample: bool) -> Tensor {
        self.apply(xs)
    }
}

/// Deterministic closure stage, see [`StochasticSeq::add_fn`].
pub struct FnStage(Box<dyn Fn(&Tensor) -> Tensor>);

impl FnStage {
    pub fn new(f: impl Fn(&Tensor) -> Tensor + 'static) -> Self {
        Self(Box::new(f))
    }
}

impl fmt::Debug for FnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnStage")
    }
}

impl Stage for FnStage {
    fn forward(&mut self, xs: &Tensor, _rng: &mut RandomSource, _resample: bool) -> Tensor {
        (self.0)(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn activation_identity_keeps_values() {
        let xs = Tensor::from_slice(&[-1.0f32, 0.5]);
        assert!(Activation::Identity.apply(&xs).equal(&xs));
        let relu = Activation::Relu.apply(&xs);
        assert_eq!(Vec::<f32>::try_from(&relu).unwrap(), vec![0.0, 0.5]);
    }

    #[test]
    fn linear_stage_exposes_weights() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut lin = nn::linear(vs.root() / "l1", 3, 2, Default::default());
        assert_eq!(Stage::weights(&lin).unwrap().size(), &[2, 3]);
        let mut rng = RandomSource::new(0);
        let x = Tensor::ones([4, 3], (Kind::Float, Device::Cpu));
        let out = Stage::forward(&mut lin, &x, &mut rng, true);
        assert_eq!(out.size(), &[4, 2]);
    }
}
