//! Append-only store of real episodes.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use super::episode::Episode;
use crate::error::{Error, Result};
use crate::rng::RandomSource;

/// Ordered collection of [`Episode`]s with constant state/action widths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperienceDataset {
    episodes: Vec<Episode>,
}

impl ExperienceDataset {
    /// Creates an empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an episode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if its state or action width
    /// differs from the episodes already stored.
    pub fn append_episode(&mut self, episode: Episode) -> Result<()> {
        if let Some(first) = self.episodes.first() {
            if episode.state_dim() != first.state_dim() {
                return Err(Error::DimensionMismatch {
                    what: "episode state",
                    expected: first.state_dim(),
                    actual: episode.state_dim(),
                });
            }
            let expected_action = self.episodes.iter().find_map(Episode::action_dim);
            if let (Some(expected), Some(actual)) = (expected_action, episode.action_dim()) {
                if expected != actual {
                    return Err(Error::DimensionMismatch {
                        what: "episode action",
                        expected,
                        actual,
                    });
                }
            }
        }
        self.episodes.push(episode);
        Ok(())
    }

    pub fn episodes(&self) -> &[Episode] {
        &self.episodes
    }

    /// Number of episodes.
    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    /// Total number of recorded transitions.
    pub fn n_transitions(&self) -> usize {
        self.episodes.iter().map(Episode::len).sum()
    }

    pub fn state_dim(&self) -> Option<usize> {
        self.episodes.first().map(Episode::state_dim)
    }

    pub fn action_dim(&self) -> Option<usize> {
        self.episodes.iter().find_map(Episode::action_dim)
    }

    /// Regression pairs for the dynamics model.
    ///
    /// Inputs are `[x_t, u_t]`. Targets are `x_{t+1} - x_t` (or `x_{t+1}`
    /// when `deltas` is false), followed by `r_t` when `return_rewards`.
    pub fn dynmodel_dataset(&self, deltas: bool, return_rewards: bool) -> Result<(Tensor, Tensor)> {
        let (d, u) = match (self.state_dim(), self.action_dim()) {
            (Some(d), Some(u)) => (d, u),
            _ => return Err(Error::EmptyDataset),
        };
        let n = self.n_transitions();
        let target_dim = d + usize::from(return_rewards);
        let mut inputs = Vec::with_capacity(n * (d + u));
        let mut targets = Vec::with_capacity(n * target_dim);

        for episode in &self.episodes {
            for t in 0..episode.len() {
                let state = &episode.states()[t];
                let next = episode.next_state(t).unwrap_or(state);
                inputs.extend(state.iter().map(|&v| v as f32));
                inputs.extend(episode.actions()[t].iter().map(|&v| v as f32));
                if deltas {
                    targets.extend(next.iter().zip(state).map(|(a, b)| (a - b) as f32));
                } else {
                    targets.extend(next.iter().map(|&v| v as f32));
                }
                if return_rewards {
                    targets.push(episode.rewards()[t] as f32);
                }
            }
        }

        Ok((
            Tensor::from_slice(&inputs).reshape([n as i64, (d + u) as i64]),
            Tensor::from_slice(&targets).reshape([n as i64, target_dim as i64]),
        ))
    }

    /// Draws `n` states observed at `timestep`, uniformly over the episodes
    /// that reach it. Returns `[n, D]`.
    pub fn sample_states(
        &self,
        n: usize,
        timestep: usize,
        rng: &mut RandomSource,
    ) -> Result<Tensor> {
        let d = self.state_dim().ok_or(Error::EmptyDataset)?;
        let candidates: Vec<&[f64]> = self
            .episodes
            .iter()
            .filter_map(|ep| match timestep.cmp(&ep.len()) {
                std::cmp::Ordering::Less => Some(ep.states()[timestep].as_slice()),
                std::cmp::Ordering::Equal => Some(ep.final_state()),
                std::cmp::Ordering::Greater => None,
            })
            .collect();
        if candidates.is_empty() {
            return Err(Error::TimestepOutOfRange(timestep));
        }
        let values: Vec<f32> = rng
            .indices(n, candidates.len())
            .into_iter()
            .flat_map(|i| candidates[i].iter().map(|&v| v as f32))
            .collect();
        Ok(Tensor::from_slice(&values).reshape([n as i64, d as i64]))
    }

    /// [`Self::sample_states`] plus independent noise
    /// `noise_scale * std(batch) * ε`, detached.
    pub fn sample_initial_states(
        &self,
        n: usize,
        timestep: usize,
        noise_scale: f64,
        rng: &mut RandomSource,
    ) -> Result<Tensor> {
        let states = self.sample_states(n, timestep, rng)?;
        if noise_scale == 0.0 || n == 0 {
            return Ok(states);
        }
        let mean = states.mean_dim([0].as_slice(), true, Kind::Float);
        let std = (&states - &mean)
            .square()
            .mean_dim([0].as_slice(), true, Kind::Float)
            .sqrt();
        let eps = rng.normal(&states.size(), states.device());
        Ok((states + std * noise_scale * eps).detach())
    }

    /// Writes the whole dataset to `path`, replacing any previous file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        tracing::debug!(path = %path.display(), episodes = self.len(), "experience saved");
        Ok(())
    }

    /// Reads a dataset written by [`Self::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Archive path `dir/results_<env>_<YYYYmmddHHMMSS.ffffff>.json`.
    pub fn results_path<Tz>(
        dir: impl AsRef<Path>,
        env_name: &str,
        timestamp: &DateTime<Tz>,
    ) -> PathBuf
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        dir.as_ref().join(format!(
            "results_{}_{}.json",
            env_name,
            timestamp.format("%Y%m%d%H%M%S%.6f")
        ))
    }
}
