//! On-disk checkpoint layout.
//!
//! ```text
//! <save_dir>/checkpoints/<tag>/
//!     bandit.json
//!     sampling.json
//!     posteriors/posteriors.json
//!     posteriors/arm_0000.json ...
//! ```
//!
//! A checkpoint is assembled under `<tag>.partial` and only renamed over `<tag>` once
//! every artifact is written.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ValidationError;
use crate::persist::{self, PersistError};
use crate::posterior::{PosteriorKind, Posteriors};
use crate::sampling::Sampling;

pub const CHECKPOINTS_DIR: &str = "checkpoints";
pub(crate) const BANDIT_FILE: &str = "bandit.json";
pub(crate) const SAMPLING_FILE: &str = "sampling.json";
pub(crate) const POSTERIORS_DIR: &str = "posteriors";

const STAGING_SUFFIX: &str = ".partial";
const RETIRED_SUFFIX: &str = ".old";

/// Identifies a checkpoint: a completed timestep count or the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CheckpointTag {
    Timestep(usize),
    End,
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointTag::Timestep(t) => write!(f, "t_{t}"),
            CheckpointTag::End => f.write_str("end"),
        }
    }
}

impl FromStr for CheckpointTag {
    type Err = ValidationError;

    /// Accepts `t_<n>`, a bare `<n>`, `end` or `_end`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim();
        if value.eq_ignore_ascii_case("end") || value.eq_ignore_ascii_case("_end") {
            return Ok(CheckpointTag::End);
        }
        let digits = value.strip_prefix("t_").unwrap_or(value);
        digits.parse().map(CheckpointTag::Timestep).map_err(|_| {
            ValidationError::invalid(
                "checkpoint",
                format!("expected `t_<timestep>`, `<timestep>` or `end`, got `{raw}`"),
            )
        })
    }
}

impl TryFrom<String> for CheckpointTag {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CheckpointTag> for String {
    fn from(tag: CheckpointTag) -> Self {
        tag.to_string()
    }
}

/// Loop-level state stored next to the posteriors and the sampling bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct BanditState {
    pub tag: CheckpointTag,
    pub timestep: usize,
    pub seed: u64,
    pub nr_arms: usize,
    pub posterior_kind: PosteriorKind,
    pub sampling: String,
}

pub fn checkpoints_root(save_dir: &Path) -> PathBuf {
    save_dir.join(CHECKPOINTS_DIR)
}

pub fn checkpoint_dir(save_dir: &Path, tag: CheckpointTag) -> PathBuf {
    checkpoints_root(save_dir).join(tag.to_string())
}

/// Completed checkpoints under `save_dir`, timesteps ascending then `end`.
pub fn list_checkpoints(save_dir: &Path) -> Result<Vec<CheckpointTag>, PersistError> {
    let root = checkpoints_root(save_dir);
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(&root).map_err(|source| PersistError::io(&root, source))?;
    let mut tags = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PersistError::io(&root, source))?;
        if !entry.path().join(BANDIT_FILE).is_file() {
            continue;
        }
        if let Some(tag) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<CheckpointTag>().ok())
        {
            tags.push(tag);
        }
    }
    tags.sort();
    Ok(tags)
}

pub(crate) fn write(
    save_dir: &Path,
    state: &BanditState,
    posteriors: &Posteriors,
    sampling: &dyn Sampling,
) -> Result<PathBuf, PersistError> {
    let target = checkpoint_dir(save_dir, state.tag);
    let staging = with_suffix(&target, STAGING_SUFFIX);
    remove_if_present(&staging)?;

    posteriors.save(&staging.join(POSTERIORS_DIR))?;
    sampling.save(&staging.join(SAMPLING_FILE))?;
    persist::write_json_atomic(&staging.join(BANDIT_FILE), state)?;

    if target.exists() {
        let retired = with_suffix(&target, RETIRED_SUFFIX);
        remove_if_present(&retired)?;
        fs::rename(&target, &retired).map_err(|source| PersistError::io(&target, source))?;
        fs::rename(&staging, &target).map_err(|source| PersistError::io(&staging, source))?;
        remove_if_present(&retired)?;
    } else {
        fs::rename(&staging, &target).map_err(|source| PersistError::io(&staging, source))?;
    }
    Ok(target)
}

pub(crate) fn read_state(dir: &Path) -> Result<BanditState, PersistError> {
    persist::read_json(&dir.join(BANDIT_FILE))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn remove_if_present(dir: &Path) -> Result<(), PersistError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|source| PersistError::io(dir, source))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_every_tag_form() {
        assert_eq!("t_5".parse::<CheckpointTag>().expect("t_5"), CheckpointTag::Timestep(5));
        assert_eq!("120".parse::<CheckpointTag>().expect("120"), CheckpointTag::Timestep(120));
        assert_eq!(" end ".parse::<CheckpointTag>().expect("end"), CheckpointTag::End);
        assert_eq!("_end".parse::<CheckpointTag>().expect("_end"), CheckpointTag::End);
        let err = "t_x".parse::<CheckpointTag>().expect_err("bad tag");
        assert_eq!(err.field(), "checkpoint");
    }

    #[test]
    fn display_round_trips_through_parse() {
        for tag in [CheckpointTag::Timestep(0), CheckpointTag::Timestep(42), CheckpointTag::End] {
            assert_eq!(tag.to_string().parse::<CheckpointTag>().expect("parse"), tag);
        }
    }

    #[test]
    fn tags_sort_timesteps_before_end() {
        let mut tags = vec![
            CheckpointTag::End,
            CheckpointTag::Timestep(20),
            CheckpointTag::Timestep(3),
        ];
        tags.sort();
        assert_eq!(
            tags,
            vec![CheckpointTag::Timestep(3), CheckpointTag::Timestep(20), CheckpointTag::End]
        );
    }

    #[test]
    fn tag_serialises_as_string() {
        let json = serde_json::to_string(&CheckpointTag::Timestep(7)).expect("serialise");
        assert_eq!(json, "\"t_7\"");
        let tag: CheckpointTag = serde_json::from_str("\"end\"").expect("deserialise");
        assert_eq!(tag, CheckpointTag::End);
    }

    #[test]
    fn listing_skips_staging_and_incomplete_directories() {
        let dir = tempdir().expect("temp dir");
        let root = checkpoints_root(dir.path());
        for name in ["t_5", "end", "t_10.partial", "t_15"] {
            fs::create_dir_all(root.join(name)).expect("mkdir");
        }
        for name in ["t_5", "end", "t_10.partial"] {
            fs::write(root.join(name).join(BANDIT_FILE), "{}").expect("write");
        }
        let tags = list_checkpoints(dir.path()).expect("list");
        assert_eq!(tags, vec![CheckpointTag::Timestep(5), CheckpointTag::End]);
    }

    #[test]
    fn listing_missing_root_is_empty() {
        let dir = tempdir().expect("temp dir");
        assert!(list_checkpoints(dir.path()).expect("list").is_empty());
    }
}
