//! One posterior per arm, addressed by arm index.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Posterior, PosteriorError, PosteriorKind};
use crate::config::ValidationError;
use crate::persist::{self, PersistError};

/// Builds the posterior for one arm from its seed.
pub type PosteriorFactory = Box<dyn Fn(u64) -> Box<dyn Posterior>>;

const METADATA_FILE: &str = "posteriors.json";

#[derive(Debug, Serialize, Deserialize)]
struct PosteriorsMetadata {
    seed: u64,
    nr_arms: usize,
    kind: PosteriorKind,
}

/// Fully loaded posteriors waiting to replace the live ones.
pub(crate) struct StagedPosteriors {
    seed: u64,
    posteriors: Vec<Box<dyn Posterior>>,
}

pub struct Posteriors {
    seed: u64,
    posteriors: Vec<Box<dyn Posterior>>,
    factory: PosteriorFactory,
}

impl fmt::Debug for Posteriors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Posteriors")
            .field("seed", &self.seed)
            .field("posteriors", &self.posteriors)
            .finish_non_exhaustive()
    }
}

impl Posteriors {
    /// Create `nr_arms` posteriors; arm `i` is seeded with `seed + i`.
    pub fn new<F>(nr_arms: usize, seed: u64, factory: F) -> Result<Self, PosteriorError>
    where
        F: Fn(u64) -> Box<dyn Posterior> + 'static,
    {
        Self::with_factory(nr_arms, seed, Box::new(factory))
    }

    pub fn with_factory(
        nr_arms: usize,
        seed: u64,
        factory: PosteriorFactory,
    ) -> Result<Self, PosteriorError> {
        if nr_arms == 0 {
            return Err(ValidationError::invalid("nr_arms", "at least one arm is required").into());
        }
        let posteriors = (0..nr_arms)
            .map(|arm| factory(arm_seed(seed, arm)))
            .collect();
        Ok(Self {
            seed,
            posteriors,
            factory,
        })
    }

    pub fn len(&self) -> usize {
        self.posteriors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posteriors.is_empty()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn kind(&self) -> PosteriorKind {
        self.posteriors[0].kind()
    }

    pub fn get(&self, arm: usize) -> Option<&dyn Posterior> {
        self.posteriors.get(arm).map(|p| p.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Posterior> + '_ {
        self.posteriors.iter().map(|p| p.as_ref())
    }

    pub fn update_arm(&mut self, arm: usize, reward: f64, t: usize) -> Result<(), PosteriorError> {
        let nr_arms = self.len();
        let posterior = self
            .posteriors
            .get_mut(arm)
            .ok_or(PosteriorError::ArmOutOfRange { arm, nr_arms })?;
        posterior.update(reward, t)
    }

    /// One draw per arm, in arm order.
    pub fn sample_all(&mut self, t: usize) -> Vec<f64> {
        self.posteriors.iter_mut().map(|p| p.sample(t)).collect()
    }

    pub fn means_per_arm(&self, t: usize) -> Vec<f64> {
        self.posteriors.iter().map(|p| p.mean(t)).collect()
    }

    pub fn pulls_per_arm(&self) -> Vec<usize> {
        self.posteriors.iter().map(|p| p.rewards().len()).collect()
    }

    pub fn arm_path(dir: &Path, arm: usize) -> PathBuf {
        dir.join(format!("arm_{arm:04}.json"))
    }

    /// Write one artifact per arm plus the aggregate metadata into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), PersistError> {
        fs::create_dir_all(dir).map_err(|source| PersistError::io(dir, source))?;
        for (arm, posterior) in self.posteriors.iter().enumerate() {
            posterior.save(&Self::arm_path(dir, arm))?;
        }
        let metadata = PosteriorsMetadata {
            seed: self.seed,
            nr_arms: self.len(),
            kind: self.kind(),
        };
        persist::write_json_atomic(&dir.join(METADATA_FILE), &metadata)
    }

    /// Restore every arm from `dir`; nothing changes unless all arms load.
    pub fn load(&mut self, dir: &Path) -> Result<(), PersistError> {
        let staged = self.stage(dir)?;
        self.commit(staged);
        Ok(())
    }

    pub(crate) fn stage(&self, dir: &Path) -> Result<StagedPosteriors, PersistError> {
        let metadata_path = dir.join(METADATA_FILE);
        let metadata: PosteriorsMetadata = persist::read_json(&metadata_path)?;
        if metadata.nr_arms != self.len() {
            return Err(PersistError::ArmCountMismatch {
                path: metadata_path,
                expected: self.len(),
                found: metadata.nr_arms,
            });
        }
        if metadata.kind != self.kind() {
            return Err(PersistError::KindMismatch {
                path: metadata_path,
                expected: self.kind().to_string(),
                found: metadata.kind.to_string(),
            });
        }

        let mut posteriors = Vec::with_capacity(metadata.nr_arms);
        for arm in 0..metadata.nr_arms {
            let mut posterior = (self.factory)(arm_seed(metadata.seed, arm));
            posterior.load(&Self::arm_path(dir, arm))?;
            posteriors.push(posterior);
        }
        Ok(StagedPosteriors {
            seed: metadata.seed,
            posteriors,
        })
    }

    pub(crate) fn commit(&mut self, staged: StagedPosteriors) {
        self.seed = staged.seed;
        self.posteriors = staged.posteriors;
    }
}

fn arm_seed(seed: u64, arm: usize) -> u64 {
    seed.wrapping_add(arm as u64)
}
