//! Explicit random source shared by every stochastic component.
//!
//! Masks, density samples, initial-state noise and moment-matching noise
//! are all drawn from a [`RandomSource`] that callers pass around. Taking a
//! [`RandomSource::snapshot`] and later calling [`RandomSource::restore`]
//! replays exactly the same draws, which is what pins the random numbers
//! across policy-search steps.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tch::{Device, Kind, Tensor};

/// Smallest value returned by [`RandomSource::uniform`], keeps `log(u)` finite.
const UNIFORM_EPS: f32 = 1e-7;

/// Seedable random-number context.
#[derive(Debug, Clone)]
pub struct RandomSource {
    rng: StdRng,
}

/// Saved generator state, see [`RandomSource::snapshot`].
#[derive(Debug, Clone)]
pub struct RngSnapshot(StdRng);

impl RandomSource {
    /// Creates a new random source with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Captures the current generator state.
    pub fn snapshot(&self) -> RngSnapshot {
        RngSnapshot(self.rng.clone())
    }

    /// Rewinds the generator to a previously captured state.
    pub fn restore(&mut self, snapshot: &RngSnapshot) {
        self.rng = snapshot.0.clone();
    }

    /// Draws a tensor of uniform samples in the open interval (0, 1).
    pub fn uniform(&mut self, shape: &[i64], device: Device) -> Tensor {
        let values: Vec<f32> = (0..numel(shape))
            .map(|_| self.rng.gen::<f32>().clamp(UNIFORM_EPS, 1.0 - UNIFORM_EPS))
            .collect();
        Tensor::from_slice(&values)
            .reshape(shape)
            .to_kind(Kind::Float)
            .to_device(device)
    }

    /// Draws a tensor of standard normal samples.
    pub fn normal(&mut self, shape: &[i64], device: Device) -> Tensor {
        let values: Vec<f32> = (0..numel(shape))
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Tensor::from_slice(&values)
            .reshape(shape)
            .to_kind(Kind::Float)
            .to_device(device)
    }

    /// Draws `n` indices uniformly from `0..upper` (with replacement).
    pub fn indices(&mut self, n: usize, upper: usize) -> Vec<usize> {
        (0..n).map(|_| self.rng.gen_range(0..upper)).collect()
    }

    /// Draws `n` distinct indices from `0..upper` in random order.
    ///
    /// Returns all of `0..upper` when `n >= upper`.
    pub fn permutation_prefix(&mut self, n: usize, upper: usize) -> Vec<usize> {
        rand::seq::index::sample(&mut self.rng, upper, n.min(upper)).into_vec()
    }

    /// Draws a scalar uniformly from `[low, high)`.
    pub fn uniform_scalar(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..high)
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::new(0)
    }
}

fn numel(shape: &[i64]) -> usize {
    shape.iter().map(|&d| d.max(0) as usize).product()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_shape_and_range() {
        let mut rng = RandomSource::new(7);
        let u = rng.uniform(&[4, 3], Device::Cpu);
        assert_eq!(u.size(), &[4, 3]);
        let min = f64::try_from(&u.min()).unwrap();
        let max = f64::try_from(&u.max()).unwrap();
        assert!(min > 0.0 && max < 1.0);
    }

    #[test]
    fn snapshot_restore_replays_draws() {
        let mut rng = RandomSource::new(3);
        let snap = rng.snapshot();
        let a = rng.normal(&[5, 2], Device::Cpu);
        rng.restore(&snap);
        let b = rng.normal(&[5, 2], Device::Cpu);
        assert!(a.equal(&b));
    }

    #[test]
    fn continuing_stream_differs() {
        let mut rng = RandomSource::new(3);
        let a = rng.normal(&[5, 2], Device::Cpu);
        let b = rng.normal(&[5, 2], Device::Cpu);
        assert!(!a.equal(&b));
    }

    #[test]
    fn permutation_prefix_is_distinct() {
        let mut rng = RandomSource::new(11);
        let mut idx = rng.permutation_prefix(5, 10);
        assert_eq!(idx.len(), 5);
        idx.sort_unstable();
        idx.dedup();
        assert_eq!(idx.len(), 5);
        assert_eq!(rng.permutation_prefix(20, 4).len(), 4);
    }
}
