//! Environment adapters the runner can drive.

mod external;
mod synthetic;

use mab_core::Environment;

use crate::config::EnvironmentConfig;

pub use external::ExternalEnvironment;
pub use synthetic::SyntheticEnvironment;

/// Build the configured environment; `run_seed` seeds synthetic rewards unless the
/// environment carries its own seed.
pub fn build_environment(config: &EnvironmentConfig, run_seed: u64) -> Box<dyn Environment> {
    match config {
        EnvironmentConfig::Synthetic(cfg) => Box::new(SyntheticEnvironment::new(
            cfg.means.clone(),
            cfg.std_dev,
            cfg.seed.unwrap_or(run_seed),
        )),
        EnvironmentConfig::External(cfg) => Box::new(ExternalEnvironment::new(cfg.clone())),
    }
}
