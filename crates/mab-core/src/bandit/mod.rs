//! The bandit control loop: arm selection, environment interaction, posterior updates
//! and checkpointing.

mod checkpoint;
mod stop;
mod trace;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{Level, event};

use crate::config::ValidationError;
use crate::env::{Environment, EnvironmentError};
use crate::persist::PersistError;
use crate::posterior::{PosteriorError, Posteriors};
use crate::sampling::{Sampling, SamplingError};

pub use checkpoint::{CHECKPOINTS_DIR, CheckpointTag, checkpoint_dir, checkpoints_root, list_checkpoints};
pub use stop::StopToken;
pub use trace::{Phase, StepRecord, read_steps};

use checkpoint::{BanditState, POSTERIORS_DIR, SAMPLING_FILE};
use trace::StepTrace;

pub const STEPS_FILE: &str = "steps.jsonl";

const SECONDS_PER_MINUTE: f64 = 60.0;
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Parameters of one `play_bandit` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayOptions {
    /// Total number of timesteps of the run, including resumed ones.
    pub episodes: usize,
    /// Timestep to start from, usually the one returned by [`Bandit::load`].
    pub timestep: usize,
    /// Round-robin pulls per arm before the strategy takes over.
    pub initialise_arms: usize,
    /// Wall-clock budget, in hours unless `limit_min` is set.
    pub time_limit: Option<f64>,
    pub limit_min: bool,
}

impl PlayOptions {
    pub fn new(episodes: usize) -> Self {
        Self {
            episodes,
            ..Self::default()
        }
    }

    pub fn time_budget(&self) -> Result<Option<Duration>, ValidationError> {
        let Some(limit) = self.time_limit else {
            return Ok(None);
        };
        let unit = if self.limit_min {
            SECONDS_PER_MINUTE
        } else {
            SECONDS_PER_HOUR
        };
        Duration::try_from_secs_f64(limit * unit)
            .map(Some)
            .map_err(|_| {
                ValidationError::invalid(
                    "time_limit",
                    format!("must be a finite, non-negative duration, got {limit}"),
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    TimeLimit,
    Interrupted,
}

/// What a `play_bandit` call did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub start_timestep: usize,
    pub timestep: usize,
    pub elapsed: Duration,
    /// Directory of the final `end` checkpoint.
    pub checkpoint: PathBuf,
}

impl RunReport {
    pub fn steps_played(&self) -> usize {
        self.timestep - self.start_timestep
    }
}

#[derive(Debug, Error)]
pub enum BanditError {
    #[error(transparent)]
    Config(#[from] ValidationError),
    #[error("posterior update failed: {0}")]
    Posterior(#[from] PosteriorError),
    #[error("arm selection failed: {0}")]
    Sampling(#[from] SamplingError),
    #[error("environment failed at timestep {t}: {source}")]
    Environment {
        t: usize,
        #[source]
        source: EnvironmentError,
    },
    #[error("checkpoint failed: {0}")]
    Persist(#[from] PersistError),
}

/// A resumable bandit run over an environment `E`.
pub struct Bandit<E: Environment> {
    env: E,
    posteriors: Posteriors,
    sampling: Box<dyn Sampling>,
    seed: u64,
    save_dir: PathBuf,
    save_interval: usize,
    timestep: usize,
    stop: StopToken,
}

impl<E: Environment> Bandit<E> {
    /// `save_interval == 0` disables periodic checkpoints; the `end` checkpoint is
    /// always written.
    pub fn new(
        env: E,
        posteriors: Posteriors,
        sampling: Box<dyn Sampling>,
        seed: u64,
        save_dir: impl Into<PathBuf>,
        save_interval: usize,
    ) -> Result<Self, BanditError> {
        if env.num_actions() != posteriors.len() {
            return Err(ValidationError::invalid(
                "environment",
                format!(
                    "environment exposes {} arms but {} posteriors were built",
                    env.num_actions(),
                    posteriors.len()
                ),
            )
            .into());
        }
        Ok(Self {
            env,
            posteriors,
            sampling,
            seed,
            save_dir: save_dir.into(),
            save_interval,
            timestep: 0,
            stop: StopToken::new(),
        })
    }

    pub fn with_stop_token(mut self, stop: StopToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn nr_arms(&self) -> usize {
        self.posteriors.len()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn timestep(&self) -> usize {
        self.timestep
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn steps_path(&self) -> PathBuf {
        self.save_dir.join(STEPS_FILE)
    }

    pub fn posteriors(&self) -> &Posteriors {
        &self.posteriors
    }

    pub fn sampling(&self) -> &dyn Sampling {
        self.sampling.as_ref()
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    /// Run until `options.episodes` timesteps have been played, the time budget runs
    /// out, or a stop is requested. An `end` checkpoint is written in every case.
    pub fn play_bandit(&mut self, options: &PlayOptions) -> Result<RunReport, BanditError> {
        let budget = options.time_budget()?;
        let started = Instant::now();
        let start_timestep = options.timestep;
        let init_steps = options.initialise_arms.saturating_mul(self.nr_arms());
        self.timestep = start_timestep;

        event!(
            target: "mab_core::bandit",
            Level::INFO,
            start_timestep,
            episodes = options.episodes,
            initialise_arms = options.initialise_arms,
            nr_arms = self.nr_arms(),
            sampling = self.sampling.name(),
            "starting bandit run"
        );

        let mut trace = StepTrace::open(&self.steps_path())?;
        let outcome = loop {
            if self.timestep >= options.episodes {
                break RunOutcome::Completed;
            }
            if self.stop.is_stop_requested() {
                break RunOutcome::Interrupted;
            }
            if let Some(budget) = budget
                && started.elapsed() >= budget
            {
                break RunOutcome::TimeLimit;
            }

            match self.step(init_steps, &mut trace, started) {
                Ok(()) => {}
                // A simulator killed by the same interrupt fails its step; drop the step.
                Err(BanditError::Environment { t, source }) if self.stop.is_stop_requested() => {
                    event!(
                        target: "mab_core::bandit",
                        Level::WARN,
                        t,
                        error = %source,
                        "environment step aborted by stop request; step dropped"
                    );
                    break RunOutcome::Interrupted;
                }
                Err(err) => return Err(err),
            }

            if self.save_interval > 0 && self.timestep % self.save_interval == 0 {
                trace.flush()?;
                self.save(CheckpointTag::Timestep(self.timestep))?;
            }
        };
        trace.flush()?;

        let checkpoint = self.save(CheckpointTag::End)?;
        let elapsed = started.elapsed();
        let outcome_label = match outcome {
            RunOutcome::Completed => "completed",
            RunOutcome::TimeLimit => "time limit reached",
            RunOutcome::Interrupted => "stopping early",
        };
        event!(
            target: "mab_core::bandit",
            Level::INFO,
            outcome = outcome_label,
            timestep = self.timestep,
            elapsed_secs = elapsed.as_secs_f64(),
            "bandit run finished"
        );

        Ok(RunReport {
            outcome,
            start_timestep,
            timestep: self.timestep,
            elapsed,
            checkpoint,
        })
    }

    fn step(
        &mut self,
        init_steps: usize,
        trace: &mut StepTrace,
        started: Instant,
    ) -> Result<(), BanditError> {
        let t = self.timestep;
        let (arm, phase) = if t < init_steps {
            (t % self.nr_arms(), Phase::Initialise)
        } else {
            let arm = self.sampling.sample_arm(&mut self.posteriors, t)?;
            (arm, Phase::Strategy)
        };

        let reward = self
            .env
            .step(arm, t)
            .map_err(|source| BanditError::Environment { t, source })?;
        self.posteriors.update_arm(arm, reward, t)?;

        let top_m = match phase {
            Phase::Strategy => self.sampling.current_ranking().map(<[usize]>::to_vec),
            Phase::Initialise => None,
        };
        event!(
            target: "mab_core::bandit",
            Level::INFO,
            t,
            arm,
            reward,
            phase = ?phase,
            top_m = ?top_m,
        );
        trace.record(&StepRecord {
            t,
            arm,
            reward,
            phase,
            top_m,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        })?;

        self.timestep += 1;
        Ok(())
    }

    /// Checkpoint the current state under `tag`; returns the checkpoint directory.
    pub fn save(&self, tag: CheckpointTag) -> Result<PathBuf, PersistError> {
        let state = BanditState {
            tag,
            timestep: self.timestep,
            seed: self.seed,
            nr_arms: self.nr_arms(),
            posterior_kind: self.posteriors.kind(),
            sampling: self.sampling.name().to_string(),
        };
        let dir = checkpoint::write(&self.save_dir, &state, &self.posteriors, self.sampling.as_ref())?;
        event!(
            target: "mab_core::bandit",
            Level::INFO,
            checkpoint = %tag,
            timestep = self.timestep,
            path = %dir.display(),
            "checkpoint saved"
        );
        Ok(dir)
    }

    /// Restore the checkpoint `tag` of this run; returns the timestep to resume from.
    pub fn load(&mut self, tag: CheckpointTag) -> Result<usize, PersistError> {
        let dir = checkpoint_dir(&self.save_dir, tag);
        self.load_from(&dir)
    }

    /// Restore a checkpoint directory, possibly from another run. Nothing changes
    /// unless posteriors, sampling and loop state all load. Steps recorded after the
    /// checkpoint are dropped from this run's trace.
    pub fn load_from(&mut self, dir: &Path) -> Result<usize, PersistError> {
        let state = checkpoint::read_state(dir)?;
        if state.nr_arms != self.nr_arms() {
            return Err(PersistError::ArmCountMismatch {
                path: dir.to_path_buf(),
                expected: self.nr_arms(),
                found: state.nr_arms,
            });
        }
        if state.sampling != self.sampling.name() {
            return Err(PersistError::KindMismatch {
                path: dir.to_path_buf(),
                expected: self.sampling.name().to_string(),
                found: state.sampling,
            });
        }

        let staged = self.posteriors.stage(&dir.join(POSTERIORS_DIR))?;
        self.sampling.load(&dir.join(SAMPLING_FILE))?;
        self.posteriors.commit(staged);
        self.timestep = state.timestep;
        self.seed = state.seed;
        if let Err(err) = trace::truncate_from(&self.steps_path(), state.timestep) {
            event!(
                target: "mab_core::bandit",
                Level::WARN,
                error = %err,
                "could not trim step trace to the restored timestep"
            );
        }

        event!(
            target: "mab_core::bandit",
            Level::INFO,
            checkpoint = %state.tag,
            timestep = state.timestep,
            "checkpoint restored"
        );
        Ok(state.timestep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posterior::{PosteriorConfig, PosteriorKind};
    use crate::sampling::SamplingConfig;
    use std::fs;
    use tempfile::tempdir;

    const NR_ARMS: usize = 4;

    /// Rewards depend only on the arm and the timestep.
    #[derive(Debug, Default)]
    struct ScriptedEnv {
        pulls: Vec<usize>,
        stop_after: Option<(usize, StopToken)>,
        /// On this pull, request a stop and fail as a killed simulator would.
        killed_on: Option<(usize, StopToken)>,
        /// Reward returned at one timestep instead of the scripted one.
        reward_at: Option<(usize, f64)>,
    }

    impl Environment for ScriptedEnv {
        fn num_actions(&self) -> usize {
            NR_ARMS
        }

        fn step(&mut self, arm: usize, t: usize) -> Result<f64, EnvironmentError> {
            if arm >= NR_ARMS {
                return Err(EnvironmentError::InvalidArm {
                    arm,
                    nr_arms: NR_ARMS,
                });
            }
            if let Some((pull, token)) = &self.killed_on
                && self.pulls.len() + 1 == *pull
            {
                token.request_stop();
                return Err(EnvironmentError::failed("exit status: signal: 2 (SIGINT)"));
            }
            self.pulls.push(arm);
            if let Some((limit, token)) = &self.stop_after
                && self.pulls.len() >= *limit
            {
                token.request_stop();
            }
            if let Some((at, reward)) = self.reward_at
                && at == t
            {
                return Ok(reward);
            }
            Ok(0.1 * (arm + 1) as f64 + 0.05 * (t as f64 * 0.37).sin())
        }
    }

    fn bandit_in(dir: &Path, env: ScriptedEnv, save_interval: usize) -> Bandit<ScriptedEnv> {
        bandit_of(PosteriorKind::StudentT, dir, env, save_interval)
    }

    fn bandit_of(
        kind: PosteriorKind,
        dir: &Path,
        env: ScriptedEnv,
        save_interval: usize,
    ) -> Bandit<ScriptedEnv> {
        let seed = 42;
        let factory = PosteriorConfig::defaults_for(kind)
            .factory()
            .expect("factory");
        let posteriors = Posteriors::with_factory(NR_ARMS, seed, factory).expect("posteriors");
        let sampling = SamplingConfig::Bfts { top_m: 2 }
            .build(NR_ARMS, seed)
            .expect("sampling");
        Bandit::new(env, posteriors, sampling, seed, dir, save_interval).expect("bandit")
    }

    fn rewards_per_arm(bandit: &Bandit<ScriptedEnv>) -> Vec<Vec<f64>> {
        bandit
            .posteriors()
            .iter()
            .map(|p| p.rewards().to_vec())
            .collect()
    }

    #[test]
    fn initialisation_pulls_every_arm_k_times_first() {
        let dir = tempdir().expect("temp dir");
        let mut bandit = bandit_in(dir.path(), ScriptedEnv::default(), 0);
        let options = PlayOptions {
            initialise_arms: 3,
            ..PlayOptions::new(20)
        };
        let report = bandit.play_bandit(&options).expect("play");
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.steps_played(), 20);

        let pulls = &bandit.env().pulls;
        for arm in 0..NR_ARMS {
            assert_eq!(pulls[..12].iter().filter(|a| **a == arm).count(), 3);
        }
        let steps = read_steps(&bandit.steps_path()).expect("steps");
        assert_eq!(steps.len(), 20);
        assert!(steps[..12].iter().all(|s| s.phase == Phase::Initialise && s.top_m.is_none()));
        assert!(steps[12..].iter().all(|s| s.phase == Phase::Strategy));
        assert!(steps[12..].iter().all(|s| s.top_m.as_ref().map(Vec::len) == Some(2)));
    }

    #[test]
    fn resumed_run_matches_uninterrupted_run() {
        let straight_dir = tempdir().expect("temp dir");
        let mut straight = bandit_in(straight_dir.path(), ScriptedEnv::default(), 5);
        let options = PlayOptions {
            initialise_arms: 1,
            ..PlayOptions::new(10)
        };
        straight.play_bandit(&options).expect("play");
        let checkpoint = checkpoint_dir(straight_dir.path(), CheckpointTag::Timestep(5));
        assert!(checkpoint.join("bandit.json").is_file());

        let resumed_dir = tempdir().expect("temp dir");
        let mut resumed = bandit_in(resumed_dir.path(), ScriptedEnv::default(), 5);
        let timestep = resumed.load_from(&checkpoint).expect("load");
        assert_eq!(timestep, 5);
        resumed
            .play_bandit(&PlayOptions {
                timestep,
                ..options.clone()
            })
            .expect("resume");

        assert_eq!(resumed.timestep(), 10);
        assert_eq!(rewards_per_arm(&resumed), rewards_per_arm(&straight));
        assert_eq!(resumed.posteriors().means_per_arm(10), straight.posteriors().means_per_arm(10));
        assert_eq!(&straight.env().pulls[5..], &resumed.env().pulls[..]);

        // Both RNG streams must continue identically.
        let more = PlayOptions {
            timestep: 10,
            ..PlayOptions::new(30)
        };
        straight.play_bandit(&more).expect("continue straight");
        resumed.play_bandit(&more).expect("continue resumed");
        assert_eq!(rewards_per_arm(&resumed), rewards_per_arm(&straight));
    }

    #[test]
    fn periodic_and_end_checkpoints_are_written() {
        let dir = tempdir().expect("temp dir");
        let mut bandit = bandit_in(dir.path(), ScriptedEnv::default(), 4);
        bandit
            .play_bandit(&PlayOptions {
                initialise_arms: 2,
                ..PlayOptions::new(10)
            })
            .expect("play");
        let tags = list_checkpoints(dir.path()).expect("list");
        assert_eq!(
            tags,
            vec![CheckpointTag::Timestep(4), CheckpointTag::Timestep(8), CheckpointTag::End]
        );
        let root = checkpoints_root(dir.path());
        let leftovers: Vec<_> = fs::read_dir(&root)
            .expect("read")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn end_checkpoint_resumes_where_run_stopped() {
        let dir = tempdir().expect("temp dir");
        let mut bandit = bandit_in(dir.path(), ScriptedEnv::default(), 0);
        bandit.play_bandit(&PlayOptions::new(7)).expect("play");

        let mut fresh = bandit_in(dir.path(), ScriptedEnv::default(), 0);
        let timestep = fresh.load("_end".parse().expect("tag")).expect("load");
        assert_eq!(timestep, 7);
        assert_eq!(fresh.posteriors().pulls_per_arm(), bandit.posteriors().pulls_per_arm());
    }

    #[test]
    fn stop_request_checkpoints_and_returns() {
        let dir = tempdir().expect("temp dir");
        let token = StopToken::new();
        let env = ScriptedEnv {
            stop_after: Some((3, token.clone())),
            ..ScriptedEnv::default()
        };
        let mut bandit = bandit_in(dir.path(), env, 0).with_stop_token(token);
        let report = bandit.play_bandit(&PlayOptions::new(100)).expect("play");
        assert_eq!(report.outcome, RunOutcome::Interrupted);
        assert_eq!(report.timestep, 3);
        assert_eq!(report.checkpoint, checkpoint_dir(dir.path(), CheckpointTag::End));

        let mut fresh = bandit_in(dir.path(), ScriptedEnv::default(), 0);
        assert_eq!(fresh.load(CheckpointTag::End).expect("load"), 3);
    }

    #[test]
    fn environment_killed_by_interrupt_still_checkpoints() {
        let dir = tempdir().expect("temp dir");
        let token = StopToken::new();
        let env = ScriptedEnv {
            killed_on: Some((6, token.clone())),
            ..ScriptedEnv::default()
        };
        let mut bandit = bandit_in(dir.path(), env, 0).with_stop_token(token);
        let report = bandit
            .play_bandit(&PlayOptions::new(100))
            .expect("interrupt is not an error");
        assert_eq!(report.outcome, RunOutcome::Interrupted);
        assert_eq!(report.timestep, 5);
        assert!(report.checkpoint.join("bandit.json").is_file());
        assert_eq!(read_steps(&bandit.steps_path()).expect("steps").len(), 5);

        let mut fresh = bandit_in(dir.path(), ScriptedEnv::default(), 0);
        assert_eq!(fresh.load(CheckpointTag::End).expect("load"), 5);
    }

    #[test]
    fn environment_failure_without_stop_request_propagates() {
        let dir = tempdir().expect("temp dir");
        let env = ScriptedEnv {
            // Token the bandit does not watch.
            killed_on: Some((6, StopToken::new())),
            ..ScriptedEnv::default()
        };
        let mut bandit = bandit_in(dir.path(), env, 0);
        let err = bandit
            .play_bandit(&PlayOptions::new(100))
            .expect_err("environment failure");
        assert!(matches!(err, BanditError::Environment { t: 5, .. }));
        assert!(!checkpoint_dir(dir.path(), CheckpointTag::End).exists());
    }

    #[test]
    fn mixture_fit_failure_stops_the_run() {
        let dir = tempdir().expect("temp dir");
        let env = ScriptedEnv {
            reward_at: Some((5, 1e200)),
            ..ScriptedEnv::default()
        };
        let mut bandit = bandit_of(PosteriorKind::GaussianMixture, dir.path(), env, 0);
        let err = bandit
            .play_bandit(&PlayOptions {
                initialise_arms: 2,
                ..PlayOptions::new(20)
            })
            .expect_err("fit failure");
        assert!(matches!(
            err,
            BanditError::Posterior(PosteriorError::Fit {
                kind: PosteriorKind::GaussianMixture,
                samples: 2,
                ..
            })
        ));
        assert_eq!(bandit.timestep(), 5);
        assert_eq!(bandit.posteriors().pulls_per_arm(), vec![2, 2, 1, 1]);
    }

    #[test]
    fn exhausted_time_budget_stops_before_first_step() {
        let dir = tempdir().expect("temp dir");
        let mut bandit = bandit_in(dir.path(), ScriptedEnv::default(), 0);
        let report = bandit
            .play_bandit(&PlayOptions {
                time_limit: Some(0.0),
                limit_min: true,
                ..PlayOptions::new(50)
            })
            .expect("play");
        assert_eq!(report.outcome, RunOutcome::TimeLimit);
        assert_eq!(report.steps_played(), 0);
        assert!(report.checkpoint.join("bandit.json").is_file());
    }

    #[test]
    fn time_budget_units() {
        let hours = PlayOptions {
            time_limit: Some(1.5),
            ..PlayOptions::default()
        };
        assert_eq!(hours.time_budget().expect("budget"), Some(Duration::from_secs(5400)));
        let minutes = PlayOptions {
            limit_min: true,
            ..hours.clone()
        };
        assert_eq!(minutes.time_budget().expect("budget"), Some(Duration::from_secs(90)));
        let negative = PlayOptions {
            time_limit: Some(-1.0),
            ..PlayOptions::default()
        };
        assert_eq!(negative.time_budget().expect_err("negative").field(), "time_limit");
        assert_eq!(PlayOptions::default().time_budget().expect("none"), None);
    }

    #[test]
    fn arm_count_mismatch_is_rejected() {
        let dir = tempdir().expect("temp dir");
        let factory = PosteriorConfig::default().factory().expect("factory");
        let posteriors = Posteriors::with_factory(3, 0, factory).expect("posteriors");
        let sampling = SamplingConfig::Thompson.build(3, 0).expect("sampling");
        let err = Bandit::new(ScriptedEnv::default(), posteriors, sampling, 0, dir.path(), 1)
            .err()
            .expect("mismatch");
        assert!(matches!(err, BanditError::Config(_)));
    }

    #[test]
    fn failed_load_leaves_state_untouched() {
        let dir = tempdir().expect("temp dir");
        let mut bandit = bandit_in(dir.path(), ScriptedEnv::default(), 0);
        bandit.play_bandit(&PlayOptions::new(6)).expect("play");
        let end = checkpoint_dir(dir.path(), CheckpointTag::End);
        fs::write(end.join("sampling.json"), "not json").expect("corrupt");

        let other_dir = tempdir().expect("temp dir");
        let mut other = bandit_in(other_dir.path(), ScriptedEnv::default(), 0);
        other.play_bandit(&PlayOptions::new(2)).expect("play");
        let before = rewards_per_arm(&other);
        assert!(other.load_from(&end).is_err());
        assert_eq!(other.timestep(), 2);
        assert_eq!(rewards_per_arm(&other), before);
        assert!(other.load(CheckpointTag::Timestep(99)).is_err());
    }
}
