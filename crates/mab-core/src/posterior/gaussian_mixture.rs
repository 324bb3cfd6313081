//! Bayesian Gaussian mixture posterior over an arm's rewards.
//!
//! One-dimensional variational mixture with a symmetric Dirichlet prior on the weights and
//! Normal-Gamma priors on each component's mean and precision. Refits are warm-started from
//! the previous solution; the first fit starts from random responsibilities drawn from the
//! arm's RNG.
//!
//! The weight prior is a finite symmetric Dirichlet, not a stick-breaking Dirichlet
//! process. With the default concentration `1 / k` surplus components still collapse to
//! near-zero weight, which is all the predictive draws rely on.

use std::f64::consts::PI;
use std::path::Path;

use rand::distributions::Distribution;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use statrs::function::gamma::digamma;
use tracing::{Level, event};

use super::{Posterior, PosteriorError, PosteriorKind, check_reward, load_state, save_state};
use crate::config::{ValidationError, require_finite, require_positive};
use crate::persist::PersistError;

/// A mixture cannot be fitted on fewer observations.
pub(crate) const MIN_FIT_SAMPLES: usize = 2;

/// Degrees-of-freedom prior of the component precisions (number of features).
const DOF_PRIOR: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianMixtureConfig {
    /// Number of mixture components.
    pub k: usize,
    /// Convergence threshold on the change of the per-sample evidence bound.
    pub tol: f64,
    pub max_iter: usize,
    /// Added to every component variance.
    pub reg_covar: f64,
    /// Dirichlet concentration; `None` means `1 / k`.
    pub weight_concentration_prior: Option<f64>,
    pub mean_precision_prior: f64,
    /// Predictive mean before the first fit.
    pub prior_mean: f64,
    /// Predictive standard deviation before the first fit.
    pub prior_scale: f64,
}

impl Default for GaussianMixtureConfig {
    fn default() -> Self {
        Self {
            k: 2,
            tol: 1e-3,
            max_iter: 100,
            reg_covar: 1e-6,
            weight_concentration_prior: None,
            mean_precision_prior: 1.0,
            prior_mean: 0.0,
            prior_scale: 1.0,
        }
    }
}

impl GaussianMixtureConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.k == 0 {
            return Err(ValidationError::invalid(
                "posterior.k",
                "mixture needs at least one component",
            ));
        }
        if self.max_iter == 0 {
            return Err(ValidationError::invalid(
                "posterior.max_iter",
                "at least one iteration is required",
            ));
        }
        require_positive("posterior.tol", self.tol)?;
        require_positive("posterior.reg_covar", self.reg_covar)?;
        if let Some(alpha) = self.weight_concentration_prior {
            require_positive("posterior.weight_concentration_prior", alpha)?;
        }
        require_positive("posterior.mean_precision_prior", self.mean_precision_prior)?;
        require_finite("posterior.prior_mean", self.prior_mean)?;
        require_positive("posterior.prior_scale", self.prior_scale)?;
        Ok(())
    }

    fn weight_concentration(&self) -> f64 {
        self.weight_concentration_prior.unwrap_or(1.0 / self.k as f64)
    }
}

/// Variational posterior of one mixture component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixtureComponent {
    /// Dirichlet parameter of the component weight.
    pub weight_concentration: f64,
    /// Precision scaling of the component mean.
    pub mean_precision: f64,
    pub mean: f64,
    /// Gamma shape of the component precision.
    pub shape: f64,
    /// Gamma rate of the component precision.
    pub rate: f64,
}

impl MixtureComponent {
    pub fn variance(&self) -> f64 {
        self.rate / self.shape
    }

    fn is_finite(&self) -> bool {
        [
            self.weight_concentration,
            self.mean_precision,
            self.mean,
            self.shape,
            self.rate,
        ]
        .iter()
        .all(|v| v.is_finite())
            && self.rate > 0.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Priors {
    weight_concentration: f64,
    mean_precision: f64,
    mean: f64,
    shape: f64,
    rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianMixturePosterior {
    seed: u64,
    config: GaussianMixtureConfig,
    rewards: Vec<f64>,
    /// Empty until the first successful fit.
    components: Vec<MixtureComponent>,
    fits: usize,
    converged: bool,
    rng: ChaCha8Rng,
}

impl GaussianMixturePosterior {
    pub fn new(seed: u64, config: GaussianMixtureConfig) -> Self {
        Self {
            seed,
            config,
            rewards: Vec::new(),
            components: Vec::new(),
            fits: 0,
            converged: false,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn is_fitted(&self) -> bool {
        !self.components.is_empty()
    }

    /// Number of successful refits.
    pub fn fits(&self) -> usize {
        self.fits
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn components(&self) -> &[MixtureComponent] {
        &self.components
    }

    /// Expected mixture weights under the variational Dirichlet.
    pub fn weights(&self) -> Vec<f64> {
        let total: f64 = self
            .components
            .iter()
            .map(|c| c.weight_concentration)
            .sum();
        self.components
            .iter()
            .map(|c| c.weight_concentration / total)
            .collect()
    }

    fn priors(&self) -> Priors {
        let n = self.rewards.len() as f64;
        let mean = self.rewards.iter().sum::<f64>() / n;
        let variance = self
            .rewards
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0).max(1.0);
        Priors {
            weight_concentration: self.config.weight_concentration(),
            mean_precision: self.config.mean_precision_prior,
            mean,
            shape: 0.5 * DOF_PRIOR,
            rate: 0.5 * (variance + self.config.reg_covar),
        }
    }

    fn random_responsibilities(&mut self) -> Vec<Vec<f64>> {
        let k = self.config.k;
        let mut resp = Vec::with_capacity(self.rewards.len());
        for _ in 0..self.rewards.len() {
            let mut row: Vec<f64> = (0..k).map(|_| self.rng.r#gen::<f64>()).collect();
            let total: f64 = row.iter().sum();
            if total > 0.0 {
                row.iter_mut().for_each(|r| *r /= total);
            } else {
                row.iter_mut().for_each(|r| *r = 1.0 / k as f64);
            }
            resp.push(row);
        }
        resp
    }

    fn fit(&mut self) -> Result<(), String> {
        let priors = self.priors();
        let mut resp = if self.components.len() == self.config.k {
            expectation(&self.rewards, &self.components).0
        } else {
            self.random_responsibilities()
        };

        let mut components = Vec::new();
        let mut previous_bound = f64::NEG_INFINITY;
        let mut converged = false;
        let mut iterations = 0;
        for _ in 0..self.config.max_iter {
            iterations += 1;
            components = maximisation(&self.rewards, &resp, &priors, self.config.reg_covar);
            if let Some(bad) = components.iter().position(|c| !c.is_finite()) {
                return Err(format!(
                    "component {bad} degenerated at iteration {iterations}"
                ));
            }
            let (next_resp, bound) = expectation(&self.rewards, &components);
            if !bound.is_finite() {
                return Err(format!(
                    "evidence bound became non-finite at iteration {iterations}"
                ));
            }
            resp = next_resp;
            if (bound - previous_bound).abs() < self.config.tol {
                converged = true;
                break;
            }
            previous_bound = bound;
        }

        if !converged {
            event!(
                target: "mab_core::posterior",
                Level::WARN,
                seed = self.seed,
                samples = self.rewards.len(),
                max_iter = self.config.max_iter,
                "mixture fit did not converge; keeping last iterate"
            );
        }

        self.components = components;
        self.converged = converged;
        self.fits += 1;
        Ok(())
    }
}

/// M-step: closed-form variational updates from responsibilities.
fn maximisation(
    rewards: &[f64],
    resp: &[Vec<f64>],
    priors: &Priors,
    reg_covar: f64,
) -> Vec<MixtureComponent> {
    let k = resp.first().map(Vec::len).unwrap_or(0);
    (0..k)
        .map(|j| {
            let nk = resp.iter().map(|row| row[j]).sum::<f64>() + 10.0 * f64::EPSILON;
            let xbar = rewards
                .iter()
                .zip(resp)
                .map(|(x, row)| row[j] * x)
                .sum::<f64>()
                / nk;
            let spread = rewards
                .iter()
                .zip(resp)
                .map(|(x, row)| row[j] * (x - xbar).powi(2))
                .sum::<f64>()
                / nk
                + reg_covar;

            let mean_precision = priors.mean_precision + nk;
            let shrink = priors.mean_precision * nk / mean_precision;
            MixtureComponent {
                weight_concentration: priors.weight_concentration + nk,
                mean_precision,
                mean: (priors.mean_precision * priors.mean + nk * xbar) / mean_precision,
                shape: priors.shape + 0.5 * nk,
                rate: priors.rate + 0.5 * (nk * spread + shrink * (xbar - priors.mean).powi(2)),
            }
        })
        .collect()
}

/// E-step: responsibilities and the mean log normaliser used as convergence criterion.
fn expectation(rewards: &[f64], components: &[MixtureComponent]) -> (Vec<Vec<f64>>, f64) {
    let total_concentration: f64 = components.iter().map(|c| c.weight_concentration).sum();
    let digamma_total = digamma(total_concentration);
    let terms: Vec<(f64, f64, f64)> = components
        .iter()
        .map(|c| {
            let log_weight = digamma(c.weight_concentration) - digamma_total;
            let log_precision = digamma(c.shape) - c.rate.ln();
            (
                log_weight + 0.5 * log_precision - 0.5 * (2.0 * PI).ln(),
                c.shape / c.rate,
                1.0 / c.mean_precision,
            )
        })
        .collect();

    let mut bound = 0.0;
    let mut resp = Vec::with_capacity(rewards.len());
    for &x in rewards {
        let log_rho: Vec<f64> = components
            .iter()
            .zip(&terms)
            .map(|(c, (offset, precision, mean_var))| {
                offset - 0.5 * (mean_var + precision * (x - c.mean).powi(2))
            })
            .collect();
        let max = log_rho.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let norm = max + log_rho.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
        bound += norm;
        resp.push(log_rho.iter().map(|v| (v - norm).exp()).collect());
    }
    (resp, bound / rewards.len().max(1) as f64)
}

fn draw_normal<R: Rng + ?Sized>(mean: f64, std_dev: f64, rng: &mut R) -> f64 {
    match Normal::new(mean, std_dev) {
        Ok(dist) if std_dev > 0.0 => dist.sample(rng),
        _ => mean,
    }
}

impl Posterior for GaussianMixturePosterior {
    fn kind(&self) -> PosteriorKind {
        PosteriorKind::GaussianMixture
    }

    fn update(&mut self, reward: f64, t: usize) -> Result<(), PosteriorError> {
        check_reward(reward, t)?;
        self.rewards.push(reward);
        if self.rewards.len() < MIN_FIT_SAMPLES {
            event!(
                target: "mab_core::posterior",
                Level::DEBUG,
                seed = self.seed,
                t,
                samples = self.rewards.len(),
                "skipping mixture refit below minimum sample size"
            );
            return Ok(());
        }
        self.fit().map_err(|reason| PosteriorError::Fit {
            kind: PosteriorKind::GaussianMixture,
            samples: self.rewards.len(),
            reason,
        })
    }

    fn sample(&mut self, _t: usize) -> f64 {
        if !self.is_fitted() {
            let (mean, scale) = (self.config.prior_mean, self.config.prior_scale);
            return draw_normal(mean, scale, &mut self.rng);
        }
        let weights = self.weights();
        let roll: f64 = self.rng.r#gen();
        let mut cumulative = 0.0;
        let mut chosen = self.components.len() - 1;
        for (index, weight) in weights.iter().enumerate() {
            cumulative += weight;
            if roll < cumulative {
                chosen = index;
                break;
            }
        }
        let component = self.components[chosen];
        draw_normal(component.mean, component.variance().sqrt(), &mut self.rng)
    }

    fn mean(&self, _t: usize) -> f64 {
        if !self.is_fitted() {
            return self.config.prior_mean;
        }
        self.weights()
            .iter()
            .zip(&self.components)
            .map(|(w, c)| w * c.mean)
            .sum()
    }

    fn rewards(&self) -> &[f64] {
        &self.rewards
    }

    fn save(&self, path: &Path) -> Result<(), PersistError> {
        save_state(path, self.kind(), self)
    }

    fn load(&mut self, path: &Path) -> Result<(), PersistError> {
        let loaded: GaussianMixturePosterior = load_state(path, self.kind())?;
        loaded
            .config
            .validate()
            .map_err(|err| PersistError::invalid(path, err.to_string()))?;
        if !loaded.components.is_empty() && loaded.components.len() != loaded.config.k {
            return Err(PersistError::invalid(
                path,
                format!(
                    "{} fitted components for k = {}",
                    loaded.components.len(),
                    loaded.config.k
                ),
            ));
        }
        *self = loaded;
        Ok(())
    }
}
