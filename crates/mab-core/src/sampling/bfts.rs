use std::path::Path;

use rand::Rng;
use tracing::{Level, event};

use super::{Sampling, SamplingError, SamplingState, check_draws, rank_descending};
use crate::config::ValidationError;
use crate::persist::PersistError;
use crate::posterior::Posteriors;

const NAME: &str = "bfts";

pub(super) fn validate_top_m(m: usize, nr_arms: usize) -> Result<(), ValidationError> {
    if m < 1 || m >= nr_arms {
        return Err(ValidationError::invalid(
            "sampling.top_m",
            format!("must satisfy 1 <= top_m < nr_arms ({nr_arms}), got {m}"),
        ));
    }
    Ok(())
}

/// Boundary-Focused Thompson Sampling.
///
/// Every arm's posterior is sampled once per step and the arms are ranked by their draws.
/// The pulled arm is picked uniformly between the two ranks straddling the top-`m`
/// boundary (0-indexed positions `m - 1` and `m`).
#[derive(Debug, Clone)]
pub struct Bfts {
    nr_arms: usize,
    state: SamplingState,
}

impl Bfts {
    pub fn new(nr_arms: usize, top_m: usize, seed: u64) -> Result<Self, ValidationError> {
        validate_top_m(top_m, nr_arms)?;
        Ok(Self {
            nr_arms,
            state: SamplingState::new(NAME, seed, top_m, true),
        })
    }

    pub fn m(&self) -> usize {
        self.state.m
    }

    pub fn seed(&self) -> u64 {
        self.state.seed
    }
}

impl Sampling for Bfts {
    fn name(&self) -> &'static str {
        NAME
    }

    fn has_ranking(&self) -> bool {
        self.state.has_ranking
    }

    fn sample_arm(&mut self, posteriors: &mut Posteriors, t: usize) -> Result<usize, SamplingError> {
        let m = self.state.m;
        if m < 1 || m >= posteriors.len() {
            return Err(SamplingError::TopMOutOfRange {
                m,
                nr_arms: posteriors.len(),
            });
        }

        let draws = posteriors.sample_all(t);
        check_draws(&draws, t)?;
        let order = rank_descending(&draws);
        let offset: usize = self.state.rng.gen_range(0..=1);
        let arm = order[m - 1 + offset];

        let ranking = self.top_m(posteriors, t);
        event!(
            target: "mab_core::sampling",
            Level::DEBUG,
            t,
            arm,
            boundary = ?&order[m - 1..=m],
            top_m = ?ranking,
        );
        self.state.sample_ordering = Some(order);
        self.state.current_ranking = ranking;
        Ok(arm)
    }

    fn top_m(&self, posteriors: &Posteriors, t: usize) -> Option<Vec<usize>> {
        let mut order = rank_descending(&posteriors.means_per_arm(t));
        order.truncate(self.state.m);
        Some(order)
    }

    fn sample_ordering(&self) -> Option<&[usize]> {
        self.state.sample_ordering.as_deref()
    }

    fn current_ranking(&self) -> Option<&[usize]> {
        self.state.current_ranking.as_deref()
    }

    fn save(&self, path: &Path) -> Result<(), PersistError> {
        self.state.save(path)
    }

    fn load(&mut self, path: &Path) -> Result<(), PersistError> {
        let state = SamplingState::read(path, NAME)?;
        validate_top_m(state.m, self.nr_arms)
            .map_err(|err| PersistError::invalid(path, err.to_string()))?;
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posterior::fixed::FixedPosterior;
    use crate::posterior::{PosteriorConfig, Posteriors};
    use tempfile::tempdir;

    const SEED: u64 = 42;

    fn fixed_posteriors(draws: &[f64], means: &[f64]) -> Posteriors {
        let draws = draws.to_vec();
        let means = means.to_vec();
        Posteriors::new(draws.len(), SEED, move |seed| {
            let arm = (seed - SEED) as usize;
            Box::new(FixedPosterior::new(draws[arm], means[arm]))
        })
        .expect("posteriors")
    }

    fn t_posteriors(nr_arms: usize, seed: u64) -> Posteriors {
        let factory = PosteriorConfig::default().factory().expect("factory");
        Posteriors::with_factory(nr_arms, seed, factory).expect("posteriors")
    }

    #[test]
    fn selects_one_of_the_two_boundary_arms() {
        let theta = [0.1, 0.9, 0.5, 0.3];
        let mut posteriors = fixed_posteriors(&theta, &[0.2, 0.8, 0.4, 0.1]);
        let mut bfts = Bfts::new(4, 2, SEED).expect("bfts");

        let mut counts = [0usize; 4];
        for t in 0..1000 {
            counts[bfts.sample_arm(&mut posteriors, t).expect("sample")] += 1;
        }
        assert_eq!(counts[0], 0);
        assert_eq!(counts[1], 0);
        assert_eq!(counts[2] + counts[3], 1000);
        assert!((400..600).contains(&counts[2]), "counts {counts:?}");
        assert_eq!(bfts.sample_ordering(), Some(&[1, 2, 3, 0][..]));
    }

    #[test]
    fn top_m_uses_posterior_means() {
        let posteriors = fixed_posteriors(&[0.1, 0.9, 0.5, 0.3], &[0.2, 0.8, 0.4, 0.1]);
        let bfts = Bfts::new(4, 2, SEED).expect("bfts");
        assert_eq!(bfts.top_m(&posteriors, 0), Some(vec![1, 2]));
        assert_eq!(bfts.top_m(&posteriors, 0), Some(vec![1, 2]));
    }

    #[test]
    fn top_m_ties_are_deterministic() {
        let posteriors = fixed_posteriors(&[0.0; 5], &[0.5, 0.5, 0.9, 0.5, 0.1]);
        let bfts = Bfts::new(5, 3, SEED).expect("bfts");
        assert_eq!(bfts.top_m(&posteriors, 0), Some(vec![2, 0, 1]));
    }

    #[test]
    fn boundary_property_holds_for_random_posteriors() {
        for (nr_arms, m) in [(2, 1), (5, 1), (5, 4), (8, 3)] {
            let mut posteriors = t_posteriors(nr_arms, 7);
            for t in 0..(3 * nr_arms) {
                posteriors
                    .update_arm(t % nr_arms, (t as f64 * 0.37).cos(), t)
                    .expect("update");
            }
            let mut bfts = Bfts::new(nr_arms, m, 3).expect("bfts");
            for t in 0..200 {
                let arm = bfts.sample_arm(&mut posteriors, t).expect("sample");
                let order = bfts.sample_ordering().expect("ordering");
                assert!(arm == order[m - 1] || arm == order[m]);
                let ranking = bfts.current_ranking().expect("ranking");
                assert_eq!(ranking.len(), m);
            }
        }
    }

    #[test]
    fn rejects_out_of_range_top_m() {
        for (nr_arms, m) in [(4, 0), (4, 4), (4, 9), (1, 1)] {
            let err = Bfts::new(nr_arms, m, 0).expect_err("invalid top_m");
            assert_eq!(err.field(), "sampling.top_m");
        }
    }

    #[test]
    fn non_finite_draw_is_an_error() {
        let mut posteriors = fixed_posteriors(&[0.1, f64::NAN, 0.3], &[0.0; 3]);
        let mut bfts = Bfts::new(3, 1, SEED).expect("bfts");
        let err = bfts.sample_arm(&mut posteriors, 4).expect_err("nan draw");
        assert!(matches!(err, SamplingError::NonFiniteSample { arm: 1, t: 4, .. }));
        assert!(bfts.sample_ordering().is_none());
    }

    #[test]
    fn save_load_resumes_selection_stream() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("sampling.json");
        let theta = [0.1, 0.9, 0.5, 0.3];
        let mut posteriors = fixed_posteriors(&theta, &[0.0; 4]);
        let mut original = Bfts::new(4, 2, SEED).expect("bfts");
        for t in 0..5 {
            original.sample_arm(&mut posteriors, t).expect("sample");
        }
        original.save(&path).expect("save");

        let mut restored = Bfts::new(4, 1, 0).expect("bfts");
        restored.load(&path).expect("load");
        assert_eq!(restored.m(), 2);
        assert_eq!(restored.seed(), SEED);
        assert_eq!(restored.sample_ordering(), original.sample_ordering());
        for t in 5..50 {
            assert_eq!(
                restored.sample_arm(&mut posteriors, t).expect("sample"),
                original.sample_arm(&mut posteriors, t).expect("sample")
            );
        }
    }

    #[test]
    fn load_rejects_other_strategy_state() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("sampling.json");
        crate::sampling::ThompsonSampling::new(1)
            .save(&path)
            .expect("save");
        let mut bfts = Bfts::new(4, 2, SEED).expect("bfts");
        let err = bfts.load(&path).expect_err("wrong strategy");
        assert!(matches!(err, PersistError::KindMismatch { .. }));
        assert_eq!(bfts.m(), 2);
    }
}
