//! t-distribution posterior restricted to a bounded interval `[a, b]`.

use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use super::student_t::{RunningMoments, StudentTParams, TDistributionConfig};
use super::{Posterior, PosteriorError, PosteriorKind, check_reward, load_state, save_state};
use crate::config::{ValidationError, require_finite};
use crate::persist::PersistError;

/// Smallest probability mass inside the bounds that is still sampled by inversion.
const MIN_INTERVAL_MASS: f64 = 1e-12;
const BISECTION_STEPS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncatedTConfig {
    pub prior_location: f64,
    pub prior_scale: f64,
    /// Lower bound.
    pub a: f64,
    /// Upper bound.
    pub b: f64,
}

impl Default for TruncatedTConfig {
    fn default() -> Self {
        let base = TDistributionConfig::default();
        Self {
            prior_location: base.prior_location,
            prior_scale: base.prior_scale,
            a: 0.0,
            b: 0.1,
        }
    }
}

impl TruncatedTConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.base().validate()?;
        require_finite("posterior.a", self.a)?;
        require_finite("posterior.b", self.b)?;
        if self.a >= self.b {
            return Err(ValidationError::invalid(
                "posterior.b",
                format!("upper bound {} must exceed lower bound {}", self.b, self.a),
            ));
        }
        Ok(())
    }

    fn base(&self) -> TDistributionConfig {
        TDistributionConfig {
            prior_location: self.prior_location,
            prior_scale: self.prior_scale,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncatedTPosterior {
    seed: u64,
    config: TruncatedTConfig,
    rewards: Vec<f64>,
    moments: RunningMoments,
    rng: ChaCha8Rng,
}

impl TruncatedTPosterior {
    pub fn new(seed: u64, config: TruncatedTConfig) -> Self {
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

    pub fn bounds(&self) -> (f64, f64) {
        (self.config.a, self.config.b)
    }

    pub fn params(&self) -> StudentTParams {
        StudentTParams::from_moments(&self.moments, &self.config.base())
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.config.a, self.config.b)
    }
}

/// Invert the CDF of `dist` on `[a, b]` for a cumulative probability `target`.
fn invert_cdf(dist: &StudentsT, target: f64, a: f64, b: f64) -> f64 {
    let (mut lo, mut hi) = (a, b);
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if mid <= lo || mid >= hi {
            break;
        }
        if dist.cdf(mid) < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

impl Posterior for TruncatedTPosterior {
    fn kind(&self) -> PosteriorKind {
        PosteriorKind::TruncatedT
    }

    fn update(&mut self, reward: f64, t: usize) -> Result<(), PosteriorError> {
        check_reward(reward, t)?;
        self.rewards.push(reward);
        self.moments.push(reward);
        Ok(())
    }

    fn sample(&mut self, _t: usize) -> f64 {
        let params = self.params();
        let Some(dist) = params.distribution() else {
            return self.clamp(params.location);
        };
        let (a, b) = self.bounds();
        let lower = dist.cdf(a);
        let upper = dist.cdf(b);
        if !(upper - lower > MIN_INTERVAL_MASS) {
            return self.clamp(params.location);
        }
        let u: f64 = self.rng.r#gen();
        invert_cdf(&dist, lower + u * (upper - lower), a, b)
    }

    fn mean(&self, _t: usize) -> f64 {
        self.clamp(self.params().location)
    }

    fn rewards(&self) -> &[f64] {
        &self.rewards
    }

    fn save(&self, path: &Path) -> Result<(), PersistError> {
        save_state(path, self.kind(), self)
    }

    fn load(&mut self, path: &Path) -> Result<(), PersistError> {
        let loaded: TruncatedTPosterior = load_state(path, self.kind())?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn posterior_with(seed: u64, config: TruncatedTConfig, rewards: &[f64]) -> TruncatedTPosterior {
        let mut posterior = TruncatedTPosterior::new(seed, config);
        for (t, reward) in rewards.iter().enumerate() {
            posterior.update(*reward, t).expect("update");
        }
        posterior
    }

    #[test]
    fn draws_stay_within_bounds() {
        let config = TruncatedTConfig::default();
        let mut posterior = posterior_with(8, config, &[0.02, 0.09, 0.05, 0.2, -0.1]);
        for t in 0..500 {
            let draw = posterior.sample(t);
            assert!((0.0..=0.1).contains(&draw), "draw {draw} escaped bounds");
        }
    }

    #[test]
    fn prior_draws_are_bounded() {
        let config = TruncatedTConfig {
            a: -0.5,
            b: 0.5,
            ..TruncatedTConfig::default()
        };
        let mut posterior = posterior_with(2, config, &[]);
        for t in 0..100 {
            let draw = posterior.sample(t);
            assert!((-0.5..=0.5).contains(&draw));
        }
    }

    #[test]
    fn mass_outside_interval_returns_clamped_location() {
        let config = TruncatedTConfig {
            a: 0.0,
            b: 0.1,
            ..TruncatedTConfig::default()
        };
        let rewards: Vec<f64> = (0..50).map(|i| 1_000.0 + (i % 3) as f64 * 0.01).collect();
        let mut posterior = posterior_with(4, config, &rewards);
        assert_eq!(posterior.sample(0), 0.1);
        assert_eq!(posterior.mean(0), 0.1);
    }

    #[test]
    fn inversion_matches_cdf() {
        let dist = StudentsT::new(0.0, 1.0, 5.0).expect("valid t");
        // The t CDF is flat to f64 precision right at the median.
        let x = invert_cdf(&dist, 0.5, -10.0, 10.0);
        assert!(x.abs() < 1e-6);
        assert!((dist.cdf(x) - 0.5).abs() < 1e-12);
        let y = invert_cdf(&dist, dist.cdf(1.25), -10.0, 10.0);
        assert!((y - 1.25).abs() < 1e-6);
        assert!((dist.cdf(y) - dist.cdf(1.25)).abs() < 1e-12);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let config = TruncatedTConfig {
            a: 0.2,
            b: 0.1,
            ..TruncatedTConfig::default()
        };
        let err = config.validate().expect_err("a >= b");
        assert_eq!(err.field(), "posterior.b");
    }

    #[test]
    fn save_load_resumes_rng_stream() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("arm.json");
        let mut original = posterior_with(5, TruncatedTConfig::default(), &[0.01, 0.04, 0.07]);
        original.sample(0);
        original.save(&path).expect("save");

        let mut restored = TruncatedTPosterior::new(99, TruncatedTConfig::default());
        restored.load(&path).expect("load");
        assert_eq!(restored.seed(), 5);
        for t in 1..10 {
            assert_eq!(restored.sample(t), original.sample(t));
        }
    }
}
