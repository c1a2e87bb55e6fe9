//! Pipeline configuration.
//!
//! Loaded from a JSON file with serde defaults for every field; the CLI
//! layers flag and environment overrides on top. A configuration that
//! fails validation aborts the run before any state is written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunable pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Shared filesystem output root.
    pub output_base: PathBuf,
    /// Root of the read-only source object mirror.
    pub source_root: PathBuf,
    /// Failure count at which an old source file is quarantined.
    pub fail_threshold: u32,
    /// Source last-modified age (days) beyond which failures quarantine.
    pub old_days: i64,
    /// Row batch size for chunked source parsing.
    pub chunksize: usize,
    /// Live poller cycle interval in seconds.
    pub live_poll_interval: u64,
    /// Minimum target observations before a boosted model is trained.
    pub min_observations: u64,
    /// Entities whose newest observation is younger than this are deferred.
    pub min_age_hours: f64,
    /// Upper bound on parallel training workers.
    pub workers_cap: usize,
    /// Estimated resident memory per training worker, in gigabytes.
    pub per_worker_ram_gb: f64,
    /// Overrides for park-code → IANA timezone name.
    pub park_timezones: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_base: PathBuf::from("."),
            source_root: PathBuf::from("source"),
            fail_threshold: 3,
            old_days: 600,
            chunksize: 250_000,
            live_poll_interval: 300,
            min_observations: 500,
            min_age_hours: 0.0,
            workers_cap: 16,
            per_worker_ram_gb: 2.0,
            park_timezones: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from a JSON file, applying defaults for any
    /// omitted field.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file is unreadable, malformed,
    /// or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| Error::config(format!("bad config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates invariants the rest of the pipeline assumes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.chunksize == 0 {
            return Err(Error::config("chunksize must be positive"));
        }
        if self.live_poll_interval == 0 {
            return Err(Error::config("live_poll_interval must be positive"));
        }
        if self.workers_cap == 0 {
            return Err(Error::config("workers_cap must be positive"));
        }
        if self.per_worker_ram_gb <= 0.0 {
            return Err(Error::config("per_worker_ram_gb must be positive"));
        }
        for (park, tz) in &self.park_timezones {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                return Err(Error::config(format!(
                    "unknown timezone {tz:?} for park {park:?}"
                )));
            }
        }
        Ok(())
    }

    /// The configured timezone for a park, if overridden.
    #[must_use]
    pub fn park_timezone(&self, park_code: &str) -> Option<chrono_tz::Tz> {
        self.park_timezones
            .get(park_code)
            .and_then(|name| name.parse().ok())
    }
}
