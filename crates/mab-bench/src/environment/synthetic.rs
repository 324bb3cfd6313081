use mab_core::{Environment, EnvironmentError};
use rand::distributions::Distribution;
use rand::{SeedableRng, rngs::StdRng};
use statrs::distribution::Normal;

const TIMESTEP_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Gaussian arms whose reward at timestep `t` depends only on the seed and `t`, so a
/// resumed run observes the same rewards as an uninterrupted one.
#[derive(Debug, Clone)]
pub struct SyntheticEnvironment {
    means: Vec<f64>,
    std_dev: f64,
    seed: u64,
}

impl SyntheticEnvironment {
    pub fn new(means: Vec<f64>, std_dev: f64, seed: u64) -> Self {
        Self {
            means,
            std_dev,
            seed,
        }
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    fn rng_for(&self, t: usize) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ (t as u64).wrapping_add(1).wrapping_mul(TIMESTEP_MIX))
    }
}

impl Environment for SyntheticEnvironment {
    fn num_actions(&self) -> usize {
        self.means.len()
    }

    fn step(&mut self, arm: usize, t: usize) -> Result<f64, EnvironmentError> {
        let mean = *self.means.get(arm).ok_or(EnvironmentError::InvalidArm {
            arm,
            nr_arms: self.means.len(),
        })?;
        if self.std_dev == 0.0 {
            return Ok(mean);
        }
        let noise = Normal::new(mean, self.std_dev)
            .map_err(|err| EnvironmentError::failed(format!("invalid reward distribution: {err}")))?;
        Ok(noise.sample(&mut self.rng_for(t)))
    }
}
