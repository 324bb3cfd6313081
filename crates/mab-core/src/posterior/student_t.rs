//! t-distribution posterior over an arm's mean reward.
//!
//! Under the Jeffreys prior for a Gaussian with unknown mean and variance, the marginal
//! posterior of the mean after `n >= 2` observations is a Student-t with `n - 1` degrees of
//! freedom, location `x̄` and scale `s / √n`.

use std::path::Path;

use rand::SeedableRng;
use rand::distributions::Distribution;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::StudentsT;

use super::{Posterior, PosteriorError, PosteriorKind, check_reward, load_state, save_state};
use crate::config::{ValidationError, require_finite, require_positive};
use crate::persist::PersistError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TDistributionConfig {
    /// Location used until two observations are available.
    pub prior_location: f64,
    /// Scale used until two observations are available.
    pub prior_scale: f64,
}

impl Default for TDistributionConfig {
    fn default() -> Self {
        Self {
            prior_location: 0.0,
            prior_scale: 1.0,
        }
    }
}

impl TDistributionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_finite("posterior.prior_location", self.prior_location)?;
        require_positive("posterior.prior_scale", self.prior_scale)?;
        Ok(())
    }
}

/// Streaming mean/variance accumulator (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMoments {
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningMoments {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Unbiased sample variance; `None` below two observations.
    pub fn sample_variance(&self) -> Option<f64> {
        (self.count >= 2).then(|| (self.m2 / (self.count - 1) as f64).max(0.0))
    }
}

/// Parameters of a location-scale Student-t.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StudentTParams {
    pub location: f64,
    pub scale: f64,
    pub dof: f64,
}

impl StudentTParams {
    pub(crate) fn from_moments(moments: &RunningMoments, config: &TDistributionConfig) -> Self {
        match (moments.count(), moments.sample_variance()) {
            (0, _) => Self {
                location: config.prior_location,
                scale: config.prior_scale,
                dof: 1.0,
            },
            (n, Some(variance)) => Self {
                location: moments.mean(),
                scale: (variance / n as f64).sqrt(),
                dof: (n - 1) as f64,
            },
            (_, None) => Self {
                location: moments.mean(),
                scale: config.prior_scale,
                dof: 1.0,
            },
        }
    }

    /// `None` when the spread has collapsed and the posterior is a point mass.
    pub(crate) fn distribution(&self) -> Option<StudentsT> {
        if !(self.scale > 0.0) || !self.scale.is_finite() {
            return None;
        }
        StudentsT::new(self.location, self.scale, self.dof).ok()
    }

    pub(crate) fn draw<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self.distribution() {
            Some(dist) => dist.sample(rng),
            None => self.location,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TDistributionPosterior {
    seed: u64,
    config: TDistributionConfig,
    rewards: Vec<f64>,
    moments: RunningMoments,
    rng: ChaCha8Rng,
}

impl TDistributionPosterior {
    pub fn new(seed: u64, config: TDistributionConfig) -> Self {
        Self {
            seed,
            config,
            rewards: Vec::new(),
            moments: RunningMoments::default(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn params(&self) -> StudentTParams {
        StudentTParams::from_moments(&self.moments, &self.config)
    }
}

impl Posterior for TDistributionPosterior {
    fn kind(&self) -> PosteriorKind {
        PosteriorKind::StudentT
    }

    fn update(&mut self, reward: f64, t: usize) -> Result<(), PosteriorError> {
        check_reward(reward, t)?;
        self.rewards.push(reward);
        self.moments.push(reward);
        Ok(())
    }

    fn sample(&mut self, _t: usize) -> f64 {
        let params = self.params();
        params.draw(&mut self.rng)
    }

    fn mean(&self, _t: usize) -> f64 {
        self.params().location
    }

    fn rewards(&self) -> &[f64] {
        &self.rewards
    }

    fn save(&self, path: &Path) -> Result<(), PersistError> {
        save_state(path, self.kind(), self)
    }

    fn load(&mut self, path: &Path) -> Result<(), PersistError> {
        let loaded: TDistributionPosterior = load_state(path, self.kind())?;
        if loaded.moments.count() != loaded.rewards.len() {
            return Err(PersistError::invalid(
                path,
                "sufficient statistics do not match the recorded rewards",
            ));
        }
        loaded
            .config
            .validate()
            .map_err(|err| PersistError::invalid(path, err.to_string()))?;
        *self = loaded;
        Ok(())
    }
}
