use std::path::Path;

use tracing::{Level, event};

use super::{Sampling, SamplingError, SamplingState, check_draws, rank_descending};
use crate::persist::PersistError;
use crate::posterior::Posteriors;

const NAME: &str = "thompson";

/// Standard Thompson Sampling: pull the arm with the largest posterior draw.
///
/// Does not track a top-m ranking.
#[derive(Debug, Clone)]
pub struct ThompsonSampling {
    state: SamplingState,
}

impl ThompsonSampling {
    pub fn new(seed: u64) -> Self {
        Self {
            state: SamplingState::new(NAME, seed, 0, false),
        }
    }
}

impl Sampling for ThompsonSampling {
    fn name(&self) -> &'static str {
        NAME
    }

    fn has_ranking(&self) -> bool {
        self.state.has_ranking
    }

    fn sample_arm(&mut self, posteriors: &mut Posteriors, t: usize) -> Result<usize, SamplingError> {
        let draws = posteriors.sample_all(t);
        check_draws(&draws, t)?;
        let order = rank_descending(&draws);
        let arm = order[0];
        event!(target: "mab_core::sampling", Level::DEBUG, t, arm, draw = draws[arm]);
        self.state.sample_ordering = Some(order);
        Ok(arm)
    }

    fn top_m(&self, _posteriors: &Posteriors, _t: usize) -> Option<Vec<usize>> {
        None
    }

    fn sample_ordering(&self) -> Option<&[usize]> {
        self.state.sample_ordering.as_deref()
    }

    fn current_ranking(&self) -> Option<&[usize]> {
        None
    }

    fn save(&self, path: &Path) -> Result<(), PersistError> {
        self.state.save(path)
    }

    fn load(&mut self, path: &Path) -> Result<(), PersistError> {
        self.state = SamplingState::read(path, NAME)?;
        Ok(())
    }
}
