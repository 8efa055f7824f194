//! Ordered stage pipeline, built once and applied front to back.

use tch::{Kind, Tensor};

use super::{FnStage, Stage};
use crate::rng::RandomSource;

/// A sequence of [`Stage`]s, the stochastic counterpart of `tch::nn::Sequential`.
#[derive(Debug, Default)]
pub struct StochasticSeq {
    stages: Vec<Box<dyn Stage>>,
}

/// Creates an empty sequence.
pub fn seq() -> StochasticSeq {
    StochasticSeq::default()
}

impl StochasticSeq {
    /// Appends a stage.
    pub fn add<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Appends a deterministic closure.
    pub fn add_fn<F>(self, f: F) -> Self
    where
        F: Fn(&Tensor) -> Tensor + 'static,
    {
        self.add(FnStage::new(f))
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the sequence has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage in order.
    pub fn forward(&mut self, xs: &Tensor, rng: &mut RandomSource, resample: bool) -> Tensor {
        let mut out = xs.shallow_clone();
        for stage in self.stages.iter_mut() {
            out = stage.forward(&out, rng, resample);
        }
        out
    }

    /// Sum of the stage regularizers, zero if no stage is learnable.
    pub fn regularization(&self) -> Tensor {
        let mut total: Option<Tensor> = None;
        for (i, stage) in self.stages.iter().enumerate() {
            let next_weights = self.stages[i + 1..].iter().find_map(|s| s.weights());
            if let Some(reg) = stage.regularization(next_weights) {
                total = Some(match total {
                    Some(t) => t + reg,
                    None => reg,
                });
            }
        }
        total.unwrap_or_else(|| Tensor::from(0.0f32).to_kind(Kind::Float))
    }

    /// Drop probability of every dropout stage, in order.
    pub fn drop_probabilities(&self) -> Vec<f64> {
        self.stages
            .iter()
            .filter_map(|s| s.drop_probability())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Activation, BernoulliDropout};
    use tch::{nn, Device};

    #[test]
    fn stages_apply_in_order() {
        let mut net = seq()
            .add_fn(|x| x * 2.0)
            .add_fn(|x| x + 1.0)
            .add(Activation::Relu);
        let mut rng = RandomSource::new(0);
        let xs = Tensor::from_slice(&[-3.0f32, 1.0]);
        let out = net.forward(&xs, &mut rng, true);
        assert_eq!(Vec::<f32>::try_from(&out).unwrap(), vec![0.0, 3.0]);
        assert_eq!(net.len(), 3);
    }

    #[test]
    fn deterministic_sequence_has_zero_regularization() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = seq()
            .add(nn::linear(vs.root() / "l1", 2, 2, Default::default()))
            .add(BernoulliDropout::new(0.2));
        let reg = f64::try_from(&net.regularization()).unwrap();
        assert_eq!(reg, 0.0);
        assert_eq!(net.drop_probabilities(), vec![0.2]);
    }
}
