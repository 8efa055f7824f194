//! MC-PILCO on a one-dimensional integrator.
//!
//! Collects a few random episodes, then alternates dynamics fitting, policy
//! search and evaluation episodes. Metrics go to the log and to
//! `runs/metrics.csv`; the experience archive is written to `runs/`.
//!
//! Run:
//! ```sh
//! RUST_LOG=info cargo run --example integrator_mc_pilco
//! ```
//!
//! Pass a JSON file to override the configuration:
//! ```sh
//! cargo run --example integrator_mc_pilco -- config.json
//! ```

use std::path::PathBuf;

use mcpilco::environment::{Integrator, IntegratorConfig};
use mcpilco::monitor::{CsvSink, MultiSink, TracingSink};
use mcpilco::{MbrlConfig, PolicyIteration};
use tracing_subscriber::EnvFilter;

fn demo_config() -> MbrlConfig {
    let mut config = MbrlConfig {
        n_random: 2,
        n_iterations: 5,
        control_horizon: 30,
        n_particles: 50,
        results_dir: Some(PathBuf::from("runs")),
        ..MbrlConfig::default()
    };
    config.dynamics.network.hidden = vec![64, 64];
    config.dynamics.learning_rate = 1e-3;
    config.regressor.n_iterations = 500;
    config.policy.hidden = vec![64, 64];
    config.policy.learning_rate = 1e-3;
    config.policy_search.n_iterations = 200;
    config
}

fn main() -> mcpilco::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match std::env::args().nth(1) {
        Some(path) => MbrlConfig::from_json_file(path)?,
        None => demo_config(),
    };
    let metrics_path = config
        .results_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("runs"))
        .join("metrics.csv");

    let env = Integrator::new(IntegratorConfig::default(), config.seed)?;
    let sink = MultiSink::new()
        .with(TracingSink)
        .with(CsvSink::new(&metrics_path)?);
    let mut pi = PolicyIteration::new(config, env, Box::new(sink))?;
    pi.run()?;

    let returns: Vec<f64> = pi
        .dataset()
        .episodes()
        .iter()
        .map(|ep| ep.total_reward())
        .collect();
    println!("Episode returns: {:?}", returns);
    if let Some(path) = pi.results_path() {
        println!("Experience saved to {}", path.display());
    }
    println!("Metrics written to {}", metrics_path.display());
    Ok(())
}
