use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use mab_core::ValidationError;
use mab_core::posterior::{PosteriorConfig, PosteriorKind};
use mab_core::sampling::SamplingConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

const DEFAULT_SAVE_DIR: &str = "runs/{run_id}";
const DEFAULT_SAVE_INTERVAL: usize = 10;
const DEFAULT_EXTERNAL_TIMEOUT_MS: u64 = 600_000;
const RUN_ID_ALLOWED: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789._-";

/// Root experiment configuration loaded from YAML.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RunConfig {
    pub run_id: String,
    #[serde(default = "default_save_dir")]
    pub save_dir: String,
    #[serde(default)]
    pub seed: u64,
    pub episodes: usize,
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,
    /// Pulls per arm before the strategy takes over; defaults per posterior model.
    #[serde(default)]
    pub initialise_arms: Option<usize>,
    /// Wall-clock budget in hours, or minutes with `limit_minutes`.
    #[serde(default)]
    pub time_limit: Option<f64>,
    #[serde(default)]
    pub limit_minutes: bool,
    #[serde(default)]
    pub posterior: PosteriorSection,
    #[serde(default)]
    pub sampling: SamplingConfig,
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RunConfig {
    /// Load configuration from a YAML file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let path_buf = path.to_path_buf();
        let file = File::open(path).map_err(|source| ConfigError::Read {
            source,
            path: path_buf.clone(),
        })?;
        let reader = BufReader::new(file);
        let mut cfg: RunConfig =
            serde_yaml::from_reader(reader).map_err(|source| ConfigError::Parse {
                source,
                path: path_buf.clone(),
            })?;
        cfg.validate().map_err(|source| ConfigError::Invalid {
            path: path_buf,
            source,
        })?;
        Ok(cfg)
    }

    /// Validate the configuration without performing I/O.
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        validate_run_id(&self.run_id)?;
        if self.episodes == 0 {
            return Err(ValidationError::invalid(
                "episodes",
                "number of episodes must be greater than zero",
            ));
        }
        if self.save_dir.trim().is_empty() {
            return Err(ValidationError::invalid("save_dir", "path must not be empty"));
        }
        if let Some(limit) = self.time_limit
            && !(limit.is_finite() && limit >= 0.0)
        {
            return Err(ValidationError::invalid(
                "time_limit",
                format!("must be a finite, non-negative number, got {limit}"),
            ));
        }
        self.posterior.resolve()?;
        self.environment.validate()?;
        self.sampling.validate(self.environment.num_arms())?;
        self.logging.normalize();
        Ok(())
    }

    /// Save directory with `{run_id}` placeholders substituted.
    pub fn resolved_save_dir(&self) -> PathBuf {
        resolve_template(&self.run_id, &self.save_dir)
    }

    pub fn resolved_initialise_arms(&self) -> Result<usize, ValidationError> {
        match self.initialise_arms {
            Some(count) => Ok(count),
            None => Ok(self.posterior.resolve()?.default_initialise_arms()),
        }
    }
}

fn default_save_dir() -> String {
    DEFAULT_SAVE_DIR.to_string()
}

fn default_save_interval() -> usize {
    DEFAULT_SAVE_INTERVAL
}

/// Posterior model choice; any other keys override that model's default hyperparameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PosteriorSection {
    pub kind: PosteriorKind,
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

impl Default for PosteriorSection {
    fn default() -> Self {
        Self::of_kind(PosteriorKind::StudentT)
    }
}

impl PosteriorSection {
    pub fn of_kind(kind: PosteriorKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
        }
    }

    /// Merge the overrides onto the model defaults and validate the result.
    pub fn resolve(&self) -> Result<PosteriorConfig, ValidationError> {
        let defaults = PosteriorConfig::defaults_for(self.kind);
        let mut merged = serde_yaml::to_value(&defaults)
            .map_err(|err| ValidationError::invalid("posterior", err.to_string()))?;
        if let serde_yaml::Value::Mapping(map) = &mut merged {
            for (key, value) in &self.params {
                if key == "kind" {
                    continue;
                }
                if !map.contains_key(key.as_str()) {
                    return Err(ValidationError::invalid(
                        format!("posterior.{key}"),
                        format!("unknown hyperparameter for {} posterior", self.kind),
                    ));
                }
                map.insert(serde_yaml::Value::String(key.clone()), value.clone());
            }
        }
        let resolved: PosteriorConfig = serde_yaml::from_value(merged)
            .map_err(|err| ValidationError::invalid("posterior", err.to_string()))?;
        resolved.validate()?;
        Ok(resolved)
    }
}

/// The environment the bandit pulls arms against.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvironmentConfig {
    /// Gaussian arms, for dry runs and tests.
    Synthetic(SyntheticConfig),
    /// A simulator process spawned once per step.
    External(ExternalConfig),
}

impl EnvironmentConfig {
    pub fn num_arms(&self) -> usize {
        match self {
            EnvironmentConfig::Synthetic(cfg) => cfg.means.len(),
            EnvironmentConfig::External(cfg) => cfg.arms,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            EnvironmentConfig::Synthetic(cfg) => cfg.validate(),
            EnvironmentConfig::External(cfg) => cfg.validate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SyntheticConfig {
    /// Mean reward of every arm.
    pub means: Vec<f64>,
    #[serde(default = "default_std_dev")]
    pub std_dev: f64,
    /// Reward noise seed; the run seed is used when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl SyntheticConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.means.is_empty() {
            return Err(ValidationError::invalid(
                "environment.means",
                "at least one arm must be configured",
            ));
        }
        if let Some(idx) = self.means.iter().position(|m| !m.is_finite()) {
            return Err(ValidationError::invalid(
                format!("environment.means[{idx}]"),
                "arm mean must be finite",
            ));
        }
        if !(self.std_dev.is_finite() && self.std_dev >= 0.0) {
            return Err(ValidationError::invalid(
                "environment.std_dev",
                "standard deviation must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

fn default_std_dev() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ExternalConfig {
    /// Number of arms the simulator exposes.
    pub arms: usize,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Steps slower than this are logged as warnings.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ExternalConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.arms == 0 {
            return Err(ValidationError::invalid(
                "environment.arms",
                "at least one arm is required",
            ));
        }
        if self.command.trim().is_empty() {
            return Err(ValidationError::invalid(
                "environment.command",
                "command must not be empty",
            ));
        }
        Ok(())
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_EXTERNAL_TIMEOUT_MS
}

/// Logging configuration defaults to human-readable logs on stderr.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enable_structured: bool,
    #[serde(default = "default_tracing_level")]
    pub tracing_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_structured: false,
            tracing_level: default_tracing_level(),
        }
    }
}

impl LoggingConfig {
    fn normalize(&mut self) {
        if self.tracing_level.trim().is_empty() {
            self.tracing_level = default_tracing_level();
        }
    }

    pub fn level(&self) -> Option<Level> {
        match self.tracing_level.to_ascii_lowercase().as_str() {
            "trace" => Some(Level::TRACE),
            "debug" => Some(Level::DEBUG),
            "info" => Some(Level::INFO),
            "warn" | "warning" => Some(Level::WARN),
            "error" => Some(Level::ERROR),
            _ => None,
        }
    }
}

fn default_tracing_level() -> String {
    "info".to_string()
}

fn validate_run_id(run_id: &str) -> Result<(), ValidationError> {
    if run_id.trim().is_empty() {
        return Err(ValidationError::invalid("run_id", "run_id must not be empty"));
    }

    if !run_id.chars().all(|c| RUN_ID_ALLOWED.contains(c)) {
        return Err(ValidationError::invalid(
            "run_id",
            "run_id may only contain alphanumeric characters, '.', '_' or '-'",
        ));
    }

    Ok(())
}

fn resolve_template(run_id: &str, template: &str) -> PathBuf {
    PathBuf::from(template.replace("{run_id}", run_id))
}

/// Errors surfaced when loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        #[source]
        source: serde_yaml::Error,
        path: PathBuf,
    },
    #[error("invalid configuration in {path:?}: {source}")]
    Invalid {
        path: PathBuf,
        source: ValidationError,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Invalid { path, .. } => path.as_path(),
        }
    }
}
