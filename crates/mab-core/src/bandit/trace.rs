use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::persist::PersistError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Round-robin pulls that seed every posterior.
    Initialise,
    /// Pulls chosen by the sampling strategy.
    Strategy,
}

/// One line of `steps.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub t: usize,
    pub arm: usize,
    pub reward: f64,
    pub phase: Phase,
    pub top_m: Option<Vec<usize>>,
    pub elapsed_ms: f64,
}

/// Append-only JSONL writer for per-timestep records.
pub(crate) struct StepTrace {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl StepTrace {
    pub(crate) fn open(path: &Path) -> Result<Self, PersistError> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| PersistError::io(dir, source))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| PersistError::io(path, source))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub(crate) fn record(&mut self, record: &StepRecord) -> Result<(), PersistError> {
        serde_json::to_writer(&mut self.writer, record).map_err(|source| PersistError::Format {
            path: self.path.clone(),
            source,
        })?;
        self.writer
            .write_all(b"\n")
            .map_err(|source| PersistError::io(&self.path, source))
    }

    pub(crate) fn flush(&mut self) -> Result<(), PersistError> {
        self.writer
            .flush()
            .map_err(|source| PersistError::io(&self.path, source))
    }
}

/// Drop records at or after `timestep`, e.g. before replaying from a checkpoint. Lines
/// that do not parse (a write cut short by a crash) are dropped too.
pub(crate) fn truncate_from(path: &Path, timestep: usize) -> Result<(), PersistError> {
    if !path.is_file() {
        return Ok(());
    }
    let raw = fs::read_to_string(path).map_err(|source| PersistError::io(path, source))?;
    let mut kept = String::with_capacity(raw.len());
    for line in raw.lines() {
        let Ok(record) = serde_json::from_str::<StepRecord>(line) else {
            continue;
        };
        if record.t < timestep {
            kept.push_str(line);
            kept.push('\n');
        }
    }
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    fs::write(&staging, kept).map_err(|source| PersistError::io(&staging, source))?;
    fs::rename(&staging, path).map_err(|source| PersistError::io(path, source))
}

/// Read every record of a `steps.jsonl` file.
pub fn read_steps(path: &Path) -> Result<Vec<StepRecord>, PersistError> {
    let raw = fs::read_to_string(path).map_err(|source| PersistError::io(path, source))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|source| PersistError::Format {
                path: path.to_path_buf(),
                source,
            })
        })
        .collect()
}
