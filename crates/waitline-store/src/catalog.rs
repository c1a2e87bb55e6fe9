//! Processed-file catalog and failure tally.
//!
//! The catalog maps each source key to the last-modified marker it had when
//! processing committed; a key is considered processed iff its catalog
//! marker equals the current source marker. The tally tracks repeated
//! failures; a key is quarantined when it has failed at least
//! `fail_threshold` times and its source copy is older than `old_days`.
//! Both files use write-replace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waitline_core::atomic::{read_json, write_json_replace};
use waitline_core::Error as CoreError;

use crate::error::Result;

/// On-disk shape of `processed_files.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ProcessedFilesDoc {
    processed_files: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    total_files: usize,
}

/// The processed-file catalog.
#[derive(Debug)]
pub struct ProcessedCatalog {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl ProcessedCatalog {
    /// Loads the catalog, starting empty if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns a storage error on an unreadable file; a corrupt file starts
    /// fresh with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = match read_json::<ProcessedFilesDoc>(path) {
            Ok(doc) => doc.processed_files,
            Err(CoreError::NotFound(_)) => BTreeMap::new(),
            Err(CoreError::Serialization { message }) => {
                tracing::warn!(%message, "corrupt processed catalog, starting fresh");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// An empty catalog that ignores history (full-rebuild mode).
    #[must_use]
    pub fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            entries: BTreeMap::new(),
        }
    }

    /// Whether `key` is already processed at `marker`.
    #[must_use]
    pub fn is_processed(&self, key: &str, marker: &str) -> bool {
        self.entries.get(key).is_some_and(|m| m == marker)
    }

    /// Records a successfully processed key at its source marker.
    pub fn record(&mut self, key: &str, marker: &str) {
        self.entries.insert(key.to_string(), marker.to_string());
    }

    /// Number of catalogued keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persists the catalog with write-replace.
    ///
    /// # Errors
    ///
    /// Returns a storage error on write failure.
    pub fn save(&self) -> Result<()> {
        let doc = ProcessedFilesDoc {
            total_files: self.entries.len(),
            processed_files: self.entries.clone(),
            last_updated: Some(Utc::now()),
        };
        write_json_replace(&self.path, &doc)?;
        Ok(())
    }
}

/// One key's failure record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    /// How many times processing this key has failed.
    pub failures: u32,
    /// When the last attempt happened.
    pub last_attempt: DateTime<Utc>,
    /// Error text from the last attempt.
    pub last_error: String,
    /// The source object's last-modified at the last attempt.
    pub last_modified: DateTime<Utc>,
}

/// On-disk shape of `failed_files.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FailedFilesDoc {
    failed_files: BTreeMap<String, FailureEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
}

/// The failure tally with its quarantine policy.
#[derive(Debug)]
pub struct FailureTally {
    path: PathBuf,
    entries: BTreeMap<String, FailureEntry>,
    fail_threshold: u32,
    old_days: i64,
}

impl FailureTally {
    /// Loads the tally, starting empty if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns a storage error on an unreadable file.
    pub fn load(path: &Path, fail_threshold: u32, old_days: i64) -> Result<Self> {
        let entries = match read_json::<FailedFilesDoc>(path) {
            Ok(doc) => doc.failed_files,
            Err(CoreError::NotFound(_) | CoreError::Serialization { .. }) => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            fail_threshold,
            old_days,
        })
    }

    /// Whether `key` is quarantined: enough failures and an old source copy.
    #[must_use]
    pub fn is_quarantined(&self, key: &str, source_last_modified: DateTime<Utc>) -> bool {
        self.entries.get(key).is_some_and(|entry| {
            entry.failures >= self.fail_threshold
                && (Utc::now() - source_last_modified).num_days() >= self.old_days
        })
    }

    /// Increments the failure count for `key`.
    pub fn record_failure(
        &mut self,
        key: &str,
        error: impl std::fmt::Display,
        source_last_modified: DateTime<Utc>,
    ) {
        let failures = self.entries.get(key).map_or(0, |e| e.failures) + 1;
        self.entries.insert(
            key.to_string(),
            FailureEntry {
                failures,
                last_attempt: Utc::now(),
                last_error: error.to_string(),
                last_modified: source_last_modified,
            },
        );
    }

    /// Clears the tally for a key after it processes successfully.
    pub fn clear(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// The failure record for a key, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FailureEntry> {
        self.entries.get(key)
    }

    /// Number of tallied keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tally is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persists the tally with write-replace.
    ///
    /// # Errors
    ///
    /// Returns a storage error on write failure.
    pub fn save(&self) -> Result<()> {
        let doc = FailedFilesDoc {
            failed_files: self.entries.clone(),
            last_updated: Some(Utc::now()),
        };
        write_json_replace(&self.path, &doc)?;
        Ok(())
    }
}
