use std::path::{Path, PathBuf};

use mab_core::bandit::{CheckpointTag, RunOutcome, StopToken};
use mab_core::persist::{self, PersistError};
use mab_core::posterior::{PosteriorConfig, PosteriorError, Posteriors};
use mab_core::{Bandit, BanditError, Environment, PlayOptions, ValidationError};
use serde::Serialize;
use statrs::statistics::Statistics;
use thiserror::Error;
use tracing::{Level, event};

use crate::config::RunConfig;
use crate::environment::build_environment;

pub const SUMMARY_FILE: &str = "summary.json";

/// Runs one configured bandit experiment, optionally resuming from a checkpoint.
pub struct ExperimentRunner {
    config: RunConfig,
    posterior: PosteriorConfig,
    initialise_arms: usize,
    save_dir: PathBuf,
}

/// Summary details returned after a run and written to `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub posterior: String,
    pub sampling: String,
    pub outcome: RunOutcome,
    pub resumed_from: Option<CheckpointTag>,
    pub start_timestep: usize,
    pub timesteps: usize,
    pub elapsed_secs: f64,
    pub pulls_per_arm: Vec<usize>,
    pub mean_reward_per_arm: Vec<Option<f64>>,
    pub reward_std_dev_per_arm: Vec<Option<f64>>,
    pub posterior_means: Vec<f64>,
    pub top_m: Option<Vec<usize>>,
    pub checkpoint: PathBuf,
    pub steps_path: PathBuf,
    pub summary_path: PathBuf,
}

impl ExperimentRunner {
    /// Build a runner from a validated configuration.
    pub fn new(config: RunConfig) -> Result<Self, RunnerError> {
        let posterior = config.posterior.resolve()?;
        let initialise_arms = config.resolved_initialise_arms()?;
        config.sampling.validate(config.environment.num_arms())?;
        Ok(Self {
            save_dir: config.resolved_save_dir(),
            posterior,
            initialise_arms,
            config,
        })
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn posterior(&self) -> &PosteriorConfig {
        &self.posterior
    }

    pub fn initialise_arms(&self) -> usize {
        self.initialise_arms
    }

    /// Build the bandit, restore `resume` if given, and play until done, out of time, or
    /// stopped through `stop`.
    pub fn run(
        &self,
        resume: Option<CheckpointTag>,
        stop: StopToken,
    ) -> Result<RunSummary, RunnerError> {
        let env = build_environment(&self.config.environment, self.config.seed);
        self.run_with(env, resume, stop)
    }

    /// As [`ExperimentRunner::run`] with a caller-supplied environment.
    pub fn run_with<E: Environment>(
        &self,
        env: E,
        resume: Option<CheckpointTag>,
        stop: StopToken,
    ) -> Result<RunSummary, RunnerError> {
        let seed = self.config.seed;
        let nr_arms = env.num_actions();
        let posteriors = Posteriors::with_factory(nr_arms, seed, self.posterior.factory()?)?;
        let sampling = self.config.sampling.build(nr_arms, seed)?;
        let mut bandit = Bandit::new(
            env,
            posteriors,
            sampling,
            seed,
            self.save_dir.clone(),
            self.config.save_interval,
        )?
        .with_stop_token(stop);

        let timestep = match resume {
            Some(tag) => bandit.load(tag)?,
            None => 0,
        };

        event!(
            target: "mab_bench::runner",
            Level::INFO,
            run_id = %self.config.run_id,
            posterior = %self.posterior.kind(),
            nr_arms,
            timestep,
            episodes = self.config.episodes,
            "starting experiment"
        );

        let report = bandit.play_bandit(&PlayOptions {
            episodes: self.config.episodes,
            timestep,
            initialise_arms: self.initialise_arms,
            time_limit: self.config.time_limit,
            limit_min: self.config.limit_minutes,
        })?;

        let posteriors = bandit.posteriors();
        let rewards: Vec<&[f64]> = posteriors.iter().map(|p| p.rewards()).collect();
        let summary_path = self.save_dir.join(SUMMARY_FILE);
        let summary = RunSummary {
            run_id: self.config.run_id.clone(),
            posterior: self.posterior.kind().to_string(),
            sampling: bandit.sampling().name().to_string(),
            outcome: report.outcome,
            resumed_from: resume,
            start_timestep: report.start_timestep,
            timesteps: report.timestep,
            elapsed_secs: report.elapsed.as_secs_f64(),
            pulls_per_arm: posteriors.pulls_per_arm(),
            mean_reward_per_arm: rewards
                .iter()
                .map(|r| (!r.is_empty()).then(|| r.mean()))
                .collect(),
            reward_std_dev_per_arm: rewards
                .iter()
                .map(|r| (r.len() > 1).then(|| r.std_dev()))
                .collect(),
            posterior_means: posteriors.means_per_arm(report.timestep),
            top_m: bandit.sampling().top_m(posteriors, report.timestep),
            checkpoint: report.checkpoint.clone(),
            steps_path: bandit.steps_path(),
            summary_path: summary_path.clone(),
        };
        persist::write_json_atomic(&summary_path, &summary)?;
        Ok(summary)
    }
}

/// Route SIGINT to `stop`, so the run checkpoints and returns instead of dying.
pub fn install_interrupt_handler(stop: &StopToken) -> Result<(), RunnerError> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.flag())
        .map(|_| ())
        .map_err(|source| RunnerError::Signal { source })
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ValidationError),
    #[error("failed to build posteriors: {0}")]
    Posterior(#[from] PosteriorError),
    #[error("bandit run failed: {0}")]
    Bandit(#[from] BanditError),
    #[error("failed to persist run output: {0}")]
    Persist(#[from] PersistError),
    #[error("failed to install interrupt handler: {source}")]
    Signal {
        #[source]
        source: std::io::Error,
    },
}
