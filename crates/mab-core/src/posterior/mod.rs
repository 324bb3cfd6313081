//! Per-arm belief models over the reward distribution.
//!
//! This module is composed of:
//! - `student_t`: t-distribution posterior over the mean reward (`T`).
//! - `truncated_t`: the same posterior restricted to a bounded interval (`TT`).
//! - `gaussian_mixture`: variational Bayesian Gaussian mixture (`BGM`).
//! - `posteriors`: the per-arm aggregate the sampling strategies consume.

mod gaussian_mixture;
mod posteriors;
mod student_t;
mod truncated_t;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ValidationError;
use crate::persist::{self, PersistError};

pub use gaussian_mixture::{GaussianMixtureConfig, GaussianMixturePosterior, MixtureComponent};
pub use posteriors::{PosteriorFactory, Posteriors};
pub use student_t::{RunningMoments, StudentTParams, TDistributionConfig, TDistributionPosterior};
pub use truncated_t::{TruncatedTConfig, TruncatedTPosterior};

/// Belief model for a single arm.
///
/// Implementations own a private RNG so that draws are reproducible per arm and survive a
/// `save`/`load` round trip exactly.
pub trait Posterior: fmt::Debug {
    fn kind(&self) -> PosteriorKind;

    /// Record `reward` observed at timestep `t` and refit the model.
    ///
    /// The observation is recorded even when the refit fails; the error reports that the
    /// fitted parameters were left unchanged.
    fn update(&mut self, reward: f64, t: usize) -> Result<(), PosteriorError>;

    /// Draw one value from the current posterior.
    fn sample(&mut self, t: usize) -> f64;

    /// Point estimate of the arm's reward.
    fn mean(&self, t: usize) -> f64;

    /// Observations recorded so far, in arrival order.
    fn rewards(&self) -> &[f64];

    fn save(&self, path: &Path) -> Result<(), PersistError>;

    /// Replace the in-memory state with the one stored at `path`. On error the current
    /// state is untouched.
    fn load(&mut self, path: &Path) -> Result<(), PersistError>;
}

/// Supported posterior model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PosteriorKind {
    #[serde(rename = "T")]
    StudentT,
    #[serde(rename = "TT")]
    TruncatedT,
    #[serde(rename = "BGM")]
    GaussianMixture,
}

impl PosteriorKind {
    pub const ALL: [PosteriorKind; 3] = [
        PosteriorKind::StudentT,
        PosteriorKind::TruncatedT,
        PosteriorKind::GaussianMixture,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            PosteriorKind::StudentT => "T",
            PosteriorKind::TruncatedT => "TT",
            PosteriorKind::GaussianMixture => "BGM",
        }
    }

    /// Minimum number of observations before the model refits.
    pub const fn min_fit_samples(self) -> usize {
        match self {
            PosteriorKind::StudentT | PosteriorKind::TruncatedT => 2,
            PosteriorKind::GaussianMixture => gaussian_mixture::MIN_FIT_SAMPLES,
        }
    }
}

impl fmt::Display for PosteriorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PosteriorKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "T" => Ok(PosteriorKind::StudentT),
            "TT" => Ok(PosteriorKind::TruncatedT),
            "BGM" => Ok(PosteriorKind::GaussianMixture),
            other => Err(ValidationError::invalid(
                "posterior.kind",
                format!("unsupported posterior type '{other}' (expected T, TT or BGM)"),
            )),
        }
    }
}

/// Model choice plus hyperparameters, as consumed from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PosteriorConfig {
    #[serde(rename = "T")]
    StudentT(TDistributionConfig),
    #[serde(rename = "TT")]
    TruncatedT(TruncatedTConfig),
    #[serde(rename = "BGM")]
    GaussianMixture(GaussianMixtureConfig),
}

impl Default for PosteriorConfig {
    fn default() -> Self {
        PosteriorConfig::StudentT(TDistributionConfig::default())
    }
}

impl PosteriorConfig {
    /// Default hyperparameters used by the experiment runner for each model family.
    pub fn defaults_for(kind: PosteriorKind) -> Self {
        match kind {
            PosteriorKind::StudentT => PosteriorConfig::StudentT(TDistributionConfig::default()),
            PosteriorKind::TruncatedT => PosteriorConfig::TruncatedT(TruncatedTConfig::default()),
            PosteriorKind::GaussianMixture => {
                PosteriorConfig::GaussianMixture(GaussianMixtureConfig {
                    k: 10,
                    ..GaussianMixtureConfig::default()
                })
            }
        }
    }

    pub fn kind(&self) -> PosteriorKind {
        match self {
            PosteriorConfig::StudentT(_) => PosteriorKind::StudentT,
            PosteriorConfig::TruncatedT(_) => PosteriorKind::TruncatedT,
            PosteriorConfig::GaussianMixture(_) => PosteriorKind::GaussianMixture,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            PosteriorConfig::StudentT(cfg) => cfg.validate(),
            PosteriorConfig::TruncatedT(cfg) => cfg.validate(),
            PosteriorConfig::GaussianMixture(cfg) => cfg.validate(),
        }
    }

    /// Pulls per arm before strategy-driven selection, so every arm can be fitted.
    pub fn default_initialise_arms(&self) -> usize {
        match self.kind() {
            PosteriorKind::StudentT | PosteriorKind::TruncatedT => 2,
            PosteriorKind::GaussianMixture => 1,
        }
    }

    /// Build a validated per-arm constructor for this model.
    pub fn factory(&self) -> Result<PosteriorFactory, ValidationError> {
        self.validate()?;
        let factory: PosteriorFactory = match self.clone() {
            PosteriorConfig::StudentT(cfg) => {
                Box::new(move |seed: u64| -> Box<dyn Posterior> {
                    Box::new(TDistributionPosterior::new(seed, cfg))
                })
            }
            PosteriorConfig::TruncatedT(cfg) => {
                Box::new(move |seed: u64| -> Box<dyn Posterior> {
                    Box::new(TruncatedTPosterior::new(seed, cfg))
                })
            }
            PosteriorConfig::GaussianMixture(cfg) => {
                Box::new(move |seed: u64| -> Box<dyn Posterior> {
                    Box::new(GaussianMixturePosterior::new(seed, cfg.clone()))
                })
            }
        };
        Ok(factory)
    }
}

#[derive(Debug, Error)]
pub enum PosteriorError {
    #[error("arm {arm} is outside [0, {nr_arms})")]
    ArmOutOfRange { arm: usize, nr_arms: usize },
    #[error("non-finite reward {reward} at timestep {t}")]
    NonFiniteReward { reward: f64, t: usize },
    #[error("{kind} refit failed after {samples} observations: {reason}")]
    Fit {
        kind: PosteriorKind,
        samples: usize,
        reason: String,
    },
    #[error("invalid posterior configuration: {0}")]
    Config(#[from] ValidationError),
}

pub(crate) fn check_reward(reward: f64, t: usize) -> Result<(), PosteriorError> {
    if reward.is_finite() {
        Ok(())
    } else {
        Err(PosteriorError::NonFiniteReward { reward, t })
    }
}

#[derive(Serialize)]
struct SavedPosterior<'a, S: Serialize> {
    kind: PosteriorKind,
    state: &'a S,
}

#[derive(Deserialize)]
struct LoadedPosterior<S> {
    kind: PosteriorKind,
    state: S,
}

pub(crate) fn save_state<S: Serialize>(
    path: &Path,
    kind: PosteriorKind,
    state: &S,
) -> Result<(), PersistError> {
    persist::write_json_atomic(path, &SavedPosterior { kind, state })
}

pub(crate) fn load_state<S: serde::de::DeserializeOwned>(
    path: &Path,
    expected: PosteriorKind,
) -> Result<S, PersistError> {
    let loaded: LoadedPosterior<serde_json::Value> = persist::read_json(path)?;
    if loaded.kind != expected {
        return Err(PersistError::KindMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            found: loaded.kind.to_string(),
        });
    }
    serde_json::from_value(loaded.state).map_err(|source| PersistError::Format {
        path: path.to_path_buf(),
        source,
    })
}
