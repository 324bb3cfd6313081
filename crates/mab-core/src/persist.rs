//! JSON persistence helpers used by posteriors, sampling strategies and checkpoints.
//!
//! Writes go to a sibling temporary file first and are renamed into place, so a crash
//! mid-write leaves the previous artifact intact.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed state in {path:?}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("state in {path:?} belongs to {found}, expected {expected}")]
    KindMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("state in {path:?} covers {found} arms, expected {expected}")]
    ArmCountMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("state in {path:?} is inconsistent: {message}")]
    Invalid { path: PathBuf, message: String },
}

impl PersistError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn invalid(path: &Path, message: impl Into<String>) -> Self {
        PersistError::Invalid {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

/// Serialize `value` as pretty JSON to `path` using write-new-then-rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| PersistError::io(parent, source))?;
    }

    let staging = staging_path(path);
    {
        let file = File::create(&staging).map_err(|source| PersistError::io(&staging, source))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value).map_err(|source| {
            PersistError::Format {
                path: staging.clone(),
                source,
            }
        })?;
        writer
            .flush()
            .map_err(|source| PersistError::io(&staging, source))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|source| PersistError::io(&staging, source))?;
    }

    fs::rename(&staging, path).map_err(|source| PersistError::io(path, source))
}

/// Read and decode a JSON artifact written by [`write_json_atomic`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let file = File::open(path).map_err(|source| PersistError::io(path, source))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| PersistError::Format {
        path: path.to_path_buf(),
        source,
    })
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("state"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        seed: u64,
        values: Vec<f64>,
    }

    #[test]
    fn writes_then_reads_back() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("record.json");
        let record = Record {
            seed: 7,
            values: vec![0.25, -1.5],
        };
        write_json_atomic(&path, &record).expect("write");
        assert!(!dir.path().join("nested").join("record.json.tmp").exists());
        let restored: Record = read_json(&path).expect("read");
        assert_eq!(restored, record);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempdir().expect("temp dir");
        let err = read_json::<Record>(&dir.path().join("absent.json")).expect_err("missing");
        assert!(matches!(err, PersistError::Io { .. }));
    }

    #[test]
    fn corrupt_file_is_format_error() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("corrupt.json");
        fs::write(&path, b"{\"seed\": ").expect("write corrupt");
        let err = read_json::<Record>(&path).expect_err("corrupt");
        assert!(matches!(err, PersistError::Format { .. }));
    }
}
