//! Outer loop: collect experience, fit the model, search the policy.

use std::path::{Path, PathBuf};

use tch::{nn, nn::OptimizerConfig, Tensor};

use super::mc_pilco::mc_pilco;
use super::regressor::train_regressor;
use crate::config::MbrlConfig;
use crate::dynamics::DynamicsModel;
use crate::environment::{Environment, StepResult};
use crate::error::{Error, Result};
use crate::experience::{Episode, ExperienceDataset};
use crate::losses::log_likelihood_for;
use crate::monitor::MetricsSink;
use crate::policy::{Controller, Policy, RandomController};
use crate::rng::RandomSource;

/// Per-iteration training scalars are flushed to the sink this often.
const FLUSH_EVERY: usize = 100;

/// Runs `controller` on `env` for up to `horizon` steps and records the
/// episode. Stops early when the environment reports `done`.
///
/// `callback` sees the environment after every step, e.g. to render it.
/// Nothing is returned unless the whole episode was collected.
pub fn apply_controller<E, C>(
    env: &mut E,
    controller: &mut C,
    horizon: usize,
    rng: &mut RandomSource,
    mut callback: impl FnMut(&mut E, &StepResult),
) -> Result<Episode>
where
    E: Environment + ?Sized,
    C: Controller + ?Sized,
{
    let mut state = env.reset()?;
    let mut states = Vec::with_capacity(horizon);
    let mut actions = Vec::with_capacity(horizon);
    let mut rewards = Vec::with_capacity(horizon);

    for t in 0..horizon {
        let action = controller.control(&state, t, rng)?;
        let result = env.step(&action)?;
        callback(env, &result);
        states.push(std::mem::replace(&mut state, result.state));
        actions.push(action);
        rewards.push(result.reward);
        if result.done {
            tracing::debug!(t, controller = controller.name(), "episode ended early");
            break;
        }
    }
    Episode::new(states, actions, rewards, state, Vec::new())
}

/// Forwards one training-loop scalar to `sink`. The first failure is kept
/// in `first_error` and later writes are skipped.
fn record_iteration(
    sink: &mut dyn MetricsSink,
    first_error: &mut Option<Error>,
    series: &str,
    value: f64,
    step: usize,
) {
    if first_error.is_some() {
        return;
    }
    let mut result = sink.add_scalar(series, value, step);
    if result.is_ok() && (step + 1) % FLUSH_EVERY == 0 {
        result = sink.flush();
    }
    if let Err(e) = result {
        *first_error = Some(e);
    }
}

/// Stage of the [`PolicyIteration`] cycle that runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Apply the current controller for one episode.
    Collect,
    /// Fit the dynamics model to all experience.
    TrainDynamics,
    /// Draw the particles policy search starts from.
    SampleInitialStates,
    /// Run [`mc_pilco`].
    OptimizePolicy,
    /// All cycles finished.
    Done,
}

/// MC-PILCO policy iteration on a real environment.
///
/// The first `n_random` episodes use uniform random actions. After that
/// every cycle fits the dynamics model, samples initial particles, optimizes
/// the policy in simulation and evaluates it with one real episode. Every
/// collected episode is appended to the dataset and, when `results_dir` is
/// set, the dataset file is rewritten.
pub struct PolicyIteration<E: Environment> {
    config: MbrlConfig,
    env: E,
    dynamics: DynamicsModel,
    policy: Policy,
    dynamics_opt: nn::Optimizer,
    policy_opt: nn::Optimizer,
    explorer: RandomController,
    dataset: ExperienceDataset,
    rng: RandomSource,
    sink: Box<dyn MetricsSink>,
    phase: Phase,
    cycle: usize,
    initial_states: Option<Tensor>,
    results_path: Option<PathBuf>,
    dynamics_curve: Vec<f64>,
    policy_curve: Vec<f64>,
}

impl<E: Environment> PolicyIteration<E> {
    /// Builds the models and optimizers for `env`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid configuration, or when
    /// the reward is not learned and the environment has no reward function.
    pub fn new(config: MbrlConfig, env: E, sink: Box<dyn MetricsSink>) -> Result<Self> {
        config.validate()?;
        tch::manual_seed(config.seed as i64);
        let device = config.device();

        let max_u = env.max_action();
        if max_u.len() != env.action_dim() {
            return Err(Error::DimensionMismatch {
                what: "action bound",
                expected: env.action_dim(),
                actual: max_u.len(),
            });
        }
        let reward_fn = if config.dynamics.learn_reward {
            None
        } else {
            Some(env.reward_fn().ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "{} has no reward function and learn_reward is off",
                    env.name()
                ))
            })?)
        };

        let mut dynamics = DynamicsModel::new(
            &config.dynamics,
            env.observation_dim(),
            env.action_dim(),
            reward_fn,
            device,
        )?;
        let mut policy = Policy::new(&config.policy, env.observation_dim(), &max_u, device);
        let dynamics_opt =
            nn::Adam::default().build(dynamics.var_store_mut(), config.dynamics.learning_rate)?;
        let policy_opt =
            nn::Adam::default().build(policy.var_store_mut(), config.policy.learning_rate)?;

        let results_path = config
            .results_dir
            .as_ref()
            .map(|dir| ExperienceDataset::results_path(dir, env.name(), &chrono::Local::now()));
        tracing::info!(
            env = env.name(),
            seed = config.seed,
            results = ?results_path,
            "policy iteration configured"
        );

        Ok(Self {
            rng: RandomSource::new(config.seed),
            explorer: RandomController::new(max_u),
            config,
            env,
            dynamics,
            policy,
            dynamics_opt,
            policy_opt,
            dataset: ExperienceDataset::new(),
            sink,
            phase: Phase::Collect,
            cycle: 0,
            initial_states: None,
            results_path,
            dynamics_curve: Vec::new(),
            policy_curve: Vec::new(),
        })
    }

    /// Runs every remaining phase, then flushes and closes the metrics sink.
    pub fn run(&mut self) -> Result<()> {
        while self.phase != Phase::Done {
            self.step()?;
        }
        self.sink.flush()?;
        self.sink.close()
    }

    /// Runs the current phase and returns the next one.
    pub fn step(&mut self) -> Result<Phase> {
        self.phase = match self.phase {
            Phase::Collect => self.collect()?,
            Phase::TrainDynamics => self.train_dynamics()?,
            Phase::SampleInitialStates => self.sample_initial_states()?,
            Phase::OptimizePolicy => self.optimize_policy()?,
            Phase::Done => Phase::Done,
        };
        Ok(self.phase)
    }

    fn collect(&mut self) -> Result<Phase> {
        let horizon = self.config.control_horizon;
        let render = self.config.render;
        let on_step = |env: &mut E, _: &StepResult| {
            if render {
                env.render();
            }
        };
        let exploring = self.dataset.len() < self.config.n_random;
        let episode = if exploring {
            apply_controller(&mut self.env, &mut self.explorer, horizon, &mut self.rng, on_step)?
        } else {
            let params = self.policy.parameter_snapshot()?;
            apply_controller(&mut self.env, &mut self.policy, horizon, &mut self.rng, on_step)?
                .with_policy_params(params)
        };

        let total = episode.total_reward();
        let steps = episode.len();
        self.dataset.append_episode(episode)?;
        if let Some(path) = &self.results_path {
            self.dataset.save(path)?;
        }
        self.sink.add_scalar("episode/return", total, self.cycle)?;
        tracing::info!(
            cycle = self.cycle,
            steps,
            total_reward = total,
            random = exploring,
            "episode collected"
        );

        self.cycle += 1;
        Ok(if self.cycle >= self.config.n_random + self.config.n_iterations {
            Phase::Done
        } else if self.dataset.len() >= self.config.n_random {
            Phase::TrainDynamics
        } else {
            Phase::Collect
        })
    }

    fn train_dynamics(&mut self) -> Result<Phase> {
        let (inputs, targets) = self
            .dataset
            .dynmodel_dataset(true, self.dynamics.learns_reward())?;
        self.dynamics.set_dataset(&inputs, &targets)?;
        let log_likelihood = log_likelihood_for(self.dynamics.density());
        let series = format!("dynamics/cycle_{}/loss", self.search_round());
        let sink = self.sink.as_mut();
        let mut sink_error = None;
        self.dynamics_curve = train_regressor(
            &mut self.dynamics,
            &mut self.dynamics_opt,
            &self.config.regressor,
            log_likelihood,
            &mut self.rng,
            |it| record_iteration(sink, &mut sink_error, &series, it.loss, it.iteration),
        )?;
        if let Some(e) = sink_error {
            return Err(e);
        }
        if let Some(&loss) = self.dynamics_curve.last() {
            self.sink.add_scalar("dynamics/loss", loss, self.cycle)?;
        }
        let probs = self.dynamics.drop_probabilities();
        if !probs.is_empty() {
            let mean_p = probs.iter().sum::<f64>() / probs.len() as f64;
            self.sink.add_scalar("dynamics/drop_probability", mean_p, self.cycle)?;
        }
        Ok(Phase::SampleInitialStates)
    }

    fn sample_initial_states(&mut self) -> Result<Phase> {
        let x0 = self.dataset.sample_initial_states(
            self.config.n_particles,
            0,
            self.config.policy_search.init_state_noise,
            &mut self.rng,
        )?;
        self.initial_states = Some(x0.to_device(self.dynamics.device()));
        Ok(Phase::OptimizePolicy)
    }

    fn optimize_policy(&mut self) -> Result<Phase> {
        let x0 = match self.initial_states.take() {
            Some(x0) => x0,
            None => {
                self.sample_initial_states()?;
                self.initial_states.take().ok_or(Error::EmptyDataset)?
            }
        };
        let series = format!("policy_search/cycle_{}/loss", self.search_round());
        let sink = self.sink.as_mut();
        let mut sink_error = None;
        self.policy_curve = mc_pilco(
            &x0,
            &mut self.dynamics,
            &mut self.policy,
            &mut self.policy_opt,
            Some(&self.dataset),
            &self.config.policy_search,
            &mut self.rng,
            |it| record_iteration(sink, &mut sink_error, &series, it.loss, it.iteration),
        )?;
        if let Some(e) = sink_error {
            return Err(e);
        }
        if let Some(&objective) = self.policy_curve.last() {
            self.sink.add_scalar("policy/objective", objective, self.cycle)?;
        }
        Ok(Phase::Collect)
    }

    /// Index of the current model-fit and policy-search round, counted
    /// from the first cycle after the random episodes.
    fn search_round(&self) -> usize {
        self.cycle.saturating_sub(self.config.n_random)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of episodes collected so far.
    pub fn cycle(&self) -> usize {
        self.cycle
    }

    pub fn dataset(&self) -> &ExperienceDataset {
        &self.dataset
    }

    pub fn dynamics(&self) -> &DynamicsModel {
        &self.dynamics
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// Dataset archive path, if saving is enabled.
    pub fn results_path(&self) -> Option<&Path> {
        self.results_path.as_deref()
    }

    /// Learning curve of the last dynamics fit.
    pub fn dynamics_curve(&self) -> &[f64] {
        &self.dynamics_curve
    }

    /// Objective curve of the last policy search.
    pub fn policy_curve(&self) -> &[f64] {
        &self.policy_curve
    }
}
