pub mod bandit;
pub mod config;
pub mod env;
pub mod persist;
pub mod posterior;
pub mod sampling;

pub use bandit::{Bandit, BanditError, CheckpointTag, PlayOptions, RunOutcome, RunReport, StopToken};
pub use config::ValidationError;
pub use env::{Environment, EnvironmentError};
pub use persist::PersistError;
pub use posterior::{Posterior, PosteriorConfig, PosteriorError, PosteriorKind, Posteriors};
pub use sampling::{Bfts, Sampling, SamplingConfig, SamplingError, ThompsonSampling};

pub struct AppInfo;

impl AppInfo {
    pub const fn name() -> &'static str {
        "mab"
    }

    pub const fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
