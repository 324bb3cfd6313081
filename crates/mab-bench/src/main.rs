use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use mab_bench::config::{PosteriorSection, RunConfig};
use mab_bench::logging::init_logging;
use mab_bench::runner::{ExperimentRunner, install_interrupt_handler};
use mab_core::bandit::{CheckpointTag, RunOutcome, StopToken};
use mab_core::posterior::PosteriorKind;
use mab_core::sampling::SamplingConfig;

/// Top-m arm identification with Boundary-Focused Thompson Sampling.
#[derive(Debug, Parser)]
#[command(
    name = "mab-bench",
    author,
    version,
    about = "Resumable Bayesian bandit experiments"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "runs/bandit.yaml")]
    config: PathBuf,

    /// Override the run identifier (substitutes {run_id} templates).
    #[arg(long, value_name = "RUN_ID")]
    run_id: Option<String>,

    /// Override the total number of timesteps.
    #[arg(long, value_name = "EPISODES")]
    episodes: Option<usize>,

    /// Override the reproducibility seed.
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Override the posterior model (T, TT or BGM) with its default hyperparameters.
    #[arg(long, value_name = "KIND")]
    posterior: Option<PosteriorKind>,

    /// Use BFTS with this top-m.
    #[arg(long, value_name = "M")]
    top_m: Option<usize>,

    /// Resume from a checkpoint: a timestep (`t_120` or `120`) or `end`.
    #[arg(short = 'c', long, value_name = "TAG")]
    checkpoint: Option<CheckpointTag>,

    /// Stop after this many hours (minutes with -m) and checkpoint.
    #[arg(short = 'l', long, value_name = "LIMIT")]
    time_limit: Option<f64>,

    /// Interpret the time limit in minutes.
    #[arg(short = 'm', long)]
    minutes: bool,

    /// Exit after validating the configuration (nothing is run).
    #[arg(long)]
    validate_only: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = RunConfig::from_path(&cli.config)?;

    if let Some(run_id) = cli.run_id {
        config.run_id = run_id;
    }

    if let Some(episodes) = cli.episodes {
        config.episodes = episodes;
    }

    if let Some(seed) = cli.seed {
        config.seed = seed;
    }

    if let Some(kind) = cli.posterior
        && kind != config.posterior.kind
    {
        config.posterior = PosteriorSection::of_kind(kind);
        config.initialise_arms = None;
    }

    if let Some(top_m) = cli.top_m {
        config.sampling = SamplingConfig::Bfts { top_m };
    }

    if let Some(limit) = cli.time_limit {
        config.time_limit = Some(limit);
    }

    if cli.minutes {
        config.limit_minutes = true;
    }

    config.validate()?;

    let run_id = config.run_id.clone();
    let episodes = config.episodes;
    let nr_arms = config.environment.num_arms();
    let save_dir = config.resolved_save_dir();
    let logging_guard = init_logging(&config.logging, &save_dir)?;
    let runner = ExperimentRunner::new(config)?;

    println!(
        "Loaded configuration '{run_id}': {} posterior, {nr_arms} arms, {episodes} episodes (save dir {})",
        runner.posterior().kind(),
        save_dir.display()
    );

    if cli.validate_only {
        println!("Validation-only mode: bandit run skipped.");
        return Ok(());
    }

    let stop = StopToken::new();
    install_interrupt_handler(&stop)?;

    let summary = runner
        .run(cli.checkpoint, stop)
        .with_context(|| format!("running experiment '{run_id}'"))?;

    if summary.outcome == RunOutcome::Interrupted {
        println!("Stopping early...");
    }
    println!(
        "Experiment took {:.3} seconds ({} → {} timesteps, {:?})",
        summary.elapsed_secs, summary.start_timestep, summary.timesteps, summary.outcome
    );
    println!("Pulls per arm: {:?}", summary.pulls_per_arm);
    if let Some(top_m) = summary.top_m.as_ref() {
        println!("Estimated top-{}: {:?}", top_m.len(), top_m);
    }
    println!("Checkpoint: {}", summary.checkpoint.display());
    println!("Step trace: {}", summary.steps_path.display());
    println!("Summary: {}", summary.summary_path.display());
    if let Some(guard) = logging_guard.as_ref() {
        println!("Telemetry log: {}", guard.telemetry_path.display());
    }

    Ok(())
}
