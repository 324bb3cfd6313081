//! Arm-selection strategies over a [`Posteriors`] collection.
//!
//! - `bfts`: Boundary-Focused Thompson Sampling, sampling around the top-m boundary.
//! - `thompson`: standard Thompson Sampling (arg-max of the posterior draws).

mod bfts;
mod thompson;

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ValidationError;
use crate::persist::{self, PersistError};
use crate::posterior::Posteriors;

pub use bfts::Bfts;
pub use thompson::ThompsonSampling;

/// Chooses the next arm to pull.
pub trait Sampling: fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether [`Sampling::top_m`] produces a ranking.
    fn has_ranking(&self) -> bool;

    fn sample_arm(&mut self, posteriors: &mut Posteriors, t: usize) -> Result<usize, SamplingError>;

    /// Best current estimate of the top arms, by posterior mean.
    fn top_m(&self, posteriors: &Posteriors, t: usize) -> Option<Vec<usize>>;

    /// Arms ordered by their most recent draws, best first.
    fn sample_ordering(&self) -> Option<&[usize]>;

    /// Ranking recorded by the most recent `sample_arm`.
    fn current_ranking(&self) -> Option<&[usize]>;

    fn save(&self, path: &Path) -> Result<(), PersistError>;

    /// Restore the state saved at `path`; on error the current state is untouched.
    fn load(&mut self, path: &Path) -> Result<(), PersistError>;
}

/// Strategy choice as consumed from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplingConfig {
    Bfts { top_m: usize },
    Thompson,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig::Bfts { top_m: 3 }
    }
}

impl SamplingConfig {
    pub fn validate(&self, nr_arms: usize) -> Result<(), ValidationError> {
        match self {
            SamplingConfig::Bfts { top_m } => bfts::validate_top_m(*top_m, nr_arms),
            SamplingConfig::Thompson => Ok(()),
        }
    }

    pub fn build(&self, nr_arms: usize, seed: u64) -> Result<Box<dyn Sampling>, ValidationError> {
        match self {
            SamplingConfig::Bfts { top_m } => Ok(Box::new(Bfts::new(nr_arms, *top_m, seed)?)),
            SamplingConfig::Thompson => Ok(Box::new(ThompsonSampling::new(seed))),
        }
    }
}

#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("arm {arm} produced a non-finite draw ({value}) at timestep {t}")]
    NonFiniteSample { arm: usize, value: f64, t: usize },
    #[error("top_m = {m} requires 1 <= m < nr_arms, but there are {nr_arms} arms")]
    TopMOutOfRange { m: usize, nr_arms: usize },
}

/// Opaque state bundle shared by the strategies and persisted as one artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SamplingState {
    strategy: String,
    seed: u64,
    rng: ChaCha8Rng,
    m: usize,
    has_ranking: bool,
    sample_ordering: Option<Vec<usize>>,
    current_ranking: Option<Vec<usize>>,
}

impl SamplingState {
    fn new(strategy: &str, seed: u64, m: usize, has_ranking: bool) -> Self {
        Self {
            strategy: strategy.to_string(),
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            m,
            has_ranking,
            sample_ordering: None,
            current_ranking: None,
        }
    }

    fn save(&self, path: &Path) -> Result<(), PersistError> {
        persist::write_json_atomic(path, self)
    }

    /// Read a bundle and check it was written by the same strategy.
    fn read(path: &Path, strategy: &str) -> Result<Self, PersistError> {
        let state: SamplingState = persist::read_json(path)?;
        if state.strategy != strategy {
            return Err(PersistError::KindMismatch {
                path: path.to_path_buf(),
                expected: strategy.to_string(),
                found: state.strategy,
            });
        }
        Ok(state)
    }
}

/// Arm indices sorted by `values` descending. The sort is stable, so equal values keep
/// the lower arm index first.
pub fn rank_descending(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(Ordering::Equal)
    });
    order
}

fn check_draws(draws: &[f64], t: usize) -> Result<(), SamplingError> {
    match draws.iter().position(|v| !v.is_finite()) {
        Some(arm) => Err(SamplingError::NonFiniteSample {
            arm,
            value: draws[arm],
            t,
        }),
        None => Ok(()),
    }
}
