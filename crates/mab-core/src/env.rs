//! Boundary to the external simulator that turns an arm into a reward.

use thiserror::Error;

/// An environment the bandit pulls arms against.
///
/// `step` is a blocking call and may run a full simulation. Reward sign and scale are
/// defined by the environment.
pub trait Environment {
    /// Number of arms the environment exposes.
    fn num_actions(&self) -> usize;

    /// Pull `arm` at timestep `t` and return the observed reward.
    fn step(&mut self, arm: usize, t: usize) -> Result<f64, EnvironmentError>;
}

impl<E: Environment + ?Sized> Environment for &mut E {
    fn num_actions(&self) -> usize {
        (**self).num_actions()
    }

    fn step(&mut self, arm: usize, t: usize) -> Result<f64, EnvironmentError> {
        (**self).step(arm, t)
    }
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn num_actions(&self) -> usize {
        (**self).num_actions()
    }

    fn step(&mut self, arm: usize, t: usize) -> Result<f64, EnvironmentError> {
        (**self).step(arm, t)
    }
}

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("arm {arm} is outside [0, {nr_arms})")]
    InvalidArm { arm: usize, nr_arms: usize },
    #[error("environment returned a non-finite reward for arm {arm}: {reward}")]
    NonFiniteReward { arm: usize, reward: f64 },
    #[error("environment step failed: {0}")]
    Failed(String),
}

impl EnvironmentError {
    pub fn failed(message: impl Into<String>) -> Self {
        EnvironmentError::Failed(message.into())
    }
}
