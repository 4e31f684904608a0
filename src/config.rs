//! Configuration for the load engine.
//!
//! Settings can be built in code, loaded from the environment, or loaded
//! from a `loadstone.toml` file in the working directory:
//!
//! ```
//! use loadstone::config::Settings;
//!
//! let settings = Settings::from_env("LOADSTONE_").expect("failed to load settings");
//! ```

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Tunables of the registry, the load contexts, and the merge engine.
///
/// Durations are stored in milliseconds so they can be set from flat
/// environment variables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Number of lock shards in the registry's bucket array. The shard
    /// locks guard only the maps, never the content of a context.
    pub registry_shards: usize,

    /// Rows per sealed block in a slice writer.
    pub block_rows: usize,

    /// Capacity of the merge scheduler's job queue. A full queue yields
    /// `Again`, which callers treat as success-with-deferral.
    pub merge_queue_depth: usize,

    /// Upper bound for any bounded wait (merge-wait, finished-tablet probe,
    /// column-group barrier) before surfacing `NeedRetry`, in milliseconds.
    pub wait_timeout_ms: u64,

    /// Pace of wakeups inside bounded waits, in milliseconds.
    pub wait_poll_ms: u64,

    /// Interval of progress logging while waiting for a major table, in
    /// milliseconds.
    pub wait_log_interval_ms: u64,

    /// Attempts for the post-commit checksum report before surfacing a
    /// hard failure.
    pub checksum_report_attempts: u32,

    /// Backoff between checksum report attempts, in milliseconds.
    pub checksum_report_backoff_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry_shards: 64,
            block_rows: 256,
            merge_queue_depth: 64,
            wait_timeout_ms: 30_000,
            wait_poll_ms: 100,
            wait_log_interval_ms: 10_000,
            checksum_report_attempts: 10,
            checksum_report_backoff_ms: 100,
        }
    }
}

impl Settings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }

    pub fn wait_log_interval(&self) -> Duration {
        Duration::from_millis(self.wait_log_interval_ms)
    }

    pub fn checksum_report_backoff(&self) -> Duration {
        Duration::from_millis(self.checksum_report_backoff_ms)
    }

    /// Loads settings from defaults, an optional `loadstone.toml`, and
    /// environment variables carrying the given prefix, in increasing
    /// priority.
    pub fn from_env(prefix: &str) -> Result<Settings, crate::Error> {
        let settings: Settings = Figment::new()
            .merge(figment::providers::Serialized::defaults(
                Settings::default(),
            ))
            .merge(Toml::file("loadstone.toml"))
            .merge(Env::prefixed(prefix))
            .extract()
            .map_err(LoadError::from)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings with the default `LOADSTONE_` prefix.
    pub fn load() -> Result<Settings, crate::Error> {
        Self::from_env("LOADSTONE_")
    }

    fn validate(&self) -> Result<(), LoadError> {
        if self.registry_shards == 0 {
            return Err(LoadError::InvalidArgument("registry_shards must be > 0"));
        }
        if self.block_rows == 0 {
            return Err(LoadError::InvalidArgument("block_rows must be > 0"));
        }
        if self.merge_queue_depth == 0 {
            return Err(LoadError::InvalidArgument("merge_queue_depth must be > 0"));
        }
        if self.checksum_report_attempts == 0 {
            return Err(LoadError::InvalidArgument(
                "checksum_report_attempts must be > 0",
            ));
        }
        Ok(())
    }
}
