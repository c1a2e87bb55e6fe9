//! Atomic-by-replace filesystem writes.
//!
//! Every state mutation in the pipeline writes to a `.tmp` sibling, fsyncs,
//! then renames over the target. Readers therefore never observe a torn
//! file; at worst they see the previous generation. On error the `.tmp` is
//! unlinked.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

/// Writes `data` to `path` atomically via a `.tmp` sibling and rename.
///
/// Parent directories are created as needed.
///
/// # Errors
///
/// Returns a storage error if any filesystem step fails; the temporary
/// file is removed on failure.
pub fn write_replace(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::storage_with_source(format!("mkdir {}", parent.display()), e))?;
    }
    let tmp = tmp_sibling(path, "tmp");
    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)
            .map_err(|e| Error::storage_with_source(format!("create {}", tmp.display()), e))?;
        file.write_all(data)
            .map_err(|e| Error::storage_with_source(format!("write {}", tmp.display()), e))?;
        file.sync_all()
            .map_err(|e| Error::storage_with_source(format!("fsync {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .map_err(|e| Error::storage_with_source(format!("rename {}", path.display()), e))?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Serializes `value` as pretty JSON and writes it atomically.
///
/// # Errors
///
/// Returns a serialization error if encoding fails, or a storage error if
/// the write fails.
pub fn write_json_replace<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_replace(path, &data)
}

/// Reads and deserializes a JSON state file.
///
/// # Errors
///
/// Returns `Error::NotFound` if the file does not exist, a storage error
/// on read failure, or a serialization error if the content is invalid.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(Error::NotFound(path.display().to_string()));
    }
    let data = fs::read(path)
        .map_err(|e| Error::storage_with_source(format!("read {}", path.display()), e))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Returns the sibling path `path.{suffix}` used for staged writes.
#[must_use]
pub fn tmp_sibling(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| suffix.to_string().into(), std::ffi::OsStr::to_os_string);
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        let value = Sample {
            name: "mk".into(),
            count: 3,
        };
        write_json_replace(&path, &value).expect("write");
        let back: Sample = read_json(&path).expect("read");
        assert_eq!(back, value);
        // No stray temp file left behind.
        assert!(!tmp_sibling(&path, "tmp").exists());
    }

    #[test]
    fn replace_overwrites_previous_generation() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state.json");
        write_replace(&path, b"one").expect("first");
        write_replace(&path, b"two").expect("second");
        assert_eq!(fs::read(&path).expect("read"), b"two");
    }

    #[test]
    fn read_missing_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let err = read_json::<Sample>(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
