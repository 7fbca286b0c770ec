pub mod backend;
pub mod dispatch;
pub mod roster;
pub mod server;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::error::Error;

/// Shorthand used throughout the crate for fallible async operations whose
/// error is only ever logged or propagated to the top, never matched on.
pub type AsyncResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Maximum number of backends the pool can hold. Lines of the roster file
/// beyond this count are ignored.
pub const MAX_SERVERS: usize = 10;

/// Default port the inbound listener binds to.
pub const LB_PORT: u16 = 1800;

/// Default listen backlog for the inbound listener.
pub const MAX_QUEUED_CONNECTIONS: u32 = 100;

/// Default per-backend connection cap, used when a roster entry doesn't
/// override it.
pub const DEFAULT_SERVER_MAX_CONNECTIONS: usize = 1000;

/// Readiness wait granularity in production builds.
pub const POLL_TIMEOUT_MS: u64 = 100;

/// Same, but generous enough to step through in a debugger; matches the
/// `DEBUG_POLL_TIMEOUT_IN_MS` escape hatch of the original source.
#[cfg(debug_assertions)]
pub const EFFECTIVE_POLL_TIMEOUT_MS: u64 = 10_000;
#[cfg(not(debug_assertions))]
pub const EFFECTIVE_POLL_TIMEOUT_MS: u64 = POLL_TIMEOUT_MS;

/// Top level process configuration, loaded from a YAML file at start-up.
///
/// Every field defaults to the constant the original load balancer hard
/// coded, so a missing or partial config file still produces a working
/// process.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_on: String,
    pub roster_path: String,
    pub default_max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_on: format!("0.0.0.0:{}", LB_PORT),
            roster_path: roster::DEFAULT_ROSTER_PATH.to_string(),
            default_max_connections: DEFAULT_SERVER_MAX_CONNECTIONS,
        }
    }
}

impl Config {
    /// Load the config from `path`. Missing file or malformed YAML falls
    /// back to `Config::default()` rather than aborting start-up: unlike
    /// the roster, configuration was never part of the core's hard
    /// requirements.
    pub fn from_file(path: &str) -> Config {
        match std::fs::File::open(path) {
            Ok(f) => serde_yaml::from_reader(f).unwrap_or_else(|e| {
                log::warn!("Malformed config at {}: {}, using defaults", path, e);
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }
}

/// Initialize the process-wide logger. Call once, at the very start of
/// `main`.
pub fn init_logging() -> Result<(), log::SetLoggerError> {
    env_logger::try_init()
}
