//! Cross-process locks for the pipeline driver and the live poller.
//!
//! A lock is a JSON file created with `create_new` semantics — only one
//! process can create it. The file records the holder's PID, acquisition
//! time, and owning command so a human (or the dashboard) can see who holds
//! it. A lock file older than 24 hours is treated as abandoned and taken
//! over.
//!
//! The pipeline lock and the queue-times lock are mutually exclusive with
//! themselves but not with each other; the two processes write to disjoint
//! areas.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// A lock file older than this is considered abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique holder ID for this acquisition.
    pub holder_id: String,
    /// PID of the holding process.
    pub pid: u32,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// The command that took the lock.
    pub owner: String,
}

impl LockInfo {
    fn new(owner: &str) -> Self {
        Self {
            holder_id: Ulid::new().to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
            owner: owner.to_string(),
        }
    }
}

/// A single-writer cross-process lock at a fixed path.
#[derive(Debug, Clone)]
pub struct ProcessLock {
    path: PathBuf,
    owner: String,
}

impl ProcessLock {
    /// Creates a lock handle for `path`, labeled with the owning command.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            owner: owner.into(),
        }
    }

    /// Attempts to acquire the lock.
    ///
    /// A stale lock file (mtime older than 24 h) is removed with a warning
    /// and the acquisition retried once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockContention`] if another live holder exists, or
    /// a storage error on filesystem failure.
    pub fn acquire(&self) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::storage_with_source(format!("mkdir {}", parent.display()), e)
            })?;
        }

        match self.try_create() {
            Ok(guard) => return Ok(guard),
            Err(Error::LockContention { .. }) => {}
            Err(e) => return Err(e),
        }

        // Lock exists: check age and take over if abandoned.
        let age = self
            .path
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok());
        if age.is_some_and(|a| a > STALE_AFTER) {
            tracing::warn!(path = %self.path.display(), "removing stale lock file");
            let _ = fs::remove_file(&self.path);
            return self.try_create();
        }

        let holder = self
            .read_info()
            .ok()
            .flatten()
            .map_or_else(|| "unknown".to_string(), |i| {
                format!("{} (pid {}, since {})", i.owner, i.pid, i.acquired_at)
            });
        Err(Error::LockContention { holder })
    }

    fn try_create(&self) -> Result<LockGuard> {
        let info = LockInfo::new(&self.owner);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let body = serde_json::to_vec_pretty(&info)?;
                file.write_all(&body).map_err(|e| {
                    Error::storage_with_source(format!("write {}", self.path.display()), e)
                })?;
                file.sync_all().map_err(|e| {
                    Error::storage_with_source(format!("fsync {}", self.path.display()), e)
                })?;
                Ok(LockGuard {
                    path: self.path.clone(),
                    holder_id: info.holder_id,
                    released: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::LockContention {
                    holder: "existing lock file".into(),
                })
            }
            Err(e) => Err(Error::storage_with_source(
                format!("create {}", self.path.display()),
                e,
            )),
        }
    }

    /// Reads the current lock info, if a lock file exists.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file exists but cannot be read.
    pub fn read_info(&self) -> Result<Option<LockInfo>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(serde_json::from_slice(&data).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("read {}", self.path.display()),
                e,
            )),
        }
    }

    /// Whether a live (non-stale) lock file exists.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }
}

/// RAII guard for a held lock; the lock file is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    holder_id: String,
    released: bool,
}

impl LockGuard {
    /// The unique holder ID of this acquisition.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Explicitly releases the lock, surfacing removal errors.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock file cannot be removed.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_if_exists(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_if_exists(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::storage_with_source(
            format!("remove {}", path.display()),
            e,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().expect("tempdir");
        let lock = ProcessLock::new(dir.path().join("pipeline.lock"), "ingest");
        let guard = lock.acquire().expect("acquire");
        assert!(lock.is_locked());
        guard.release().expect("release");
        assert!(!lock.is_locked());
    }

    #[test]
    fn second_acquisition_is_contention() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("pipeline.lock");
        let first = ProcessLock::new(&path, "ingest");
        let second = ProcessLock::new(&path, "ingest");
        let _guard = first.acquire().expect("first");
        let err = second.acquire().unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
    }

    #[test]
    fn drop_releases() {
        let dir = TempDir::new().expect("tempdir");
        let lock = ProcessLock::new(dir.path().join("q.lock"), "poll-live");
        {
            let _guard = lock.acquire().expect("acquire");
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn lock_info_records_owner() {
        let dir = TempDir::new().expect("tempdir");
        let lock = ProcessLock::new(dir.path().join("pipeline.lock"), "train-batch");
        let _guard = lock.acquire().expect("acquire");
        let info = lock.read_info().expect("read").expect("present");
        assert_eq!(info.owner, "train-batch");
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn disjoint_locks_do_not_contend() {
        let dir = TempDir::new().expect("tempdir");
        let pipeline = ProcessLock::new(dir.path().join("pipeline.lock"), "ingest");
        let poller = ProcessLock::new(dir.path().join("queue_times.lock"), "poll-live");
        let _a = pipeline.acquire().expect("pipeline");
        let _b = poller.acquire().expect("poller");
    }
}
