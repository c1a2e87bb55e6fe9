//! Read-only source object store abstraction.
//!
//! The historical feed is a listing + streaming API over immutable CSV
//! objects. The trait mirrors what the pipeline needs and nothing more:
//! list keys under a prefix with their last-modified markers, and open a
//! key's bytes. Backends: a local filesystem tree (production mirrors the
//! bucket locally) and an in-memory map for tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{IngestError, Result};

/// Metadata for one listed source object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceObject {
    /// Object key (path under the source root).
    pub key: String,
    /// Last-modified marker used for incremental processing.
    pub last_modified: DateTime<Utc>,
}

/// Read-only listing + streaming over source objects.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Lists CSV objects under `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<SourceObject>>;

    /// Reads an object's full contents.
    ///
    /// Implementations map missing keys and I/O interruptions to
    /// [`IngestError::Transient`] so the caller's retry policy applies.
    async fn get(&self, key: &str) -> Result<Bytes>;
}

/// Filesystem-backed source store rooted at a directory.
#[derive(Debug)]
pub struct FsSourceStore {
    root: PathBuf,
}

impl FsSourceStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceStore for FsSourceStore {
    async fn list(&self, prefix: &str) -> Result<Vec<SourceObject>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let objects = tokio::task::spawn_blocking(move || -> Result<Vec<SourceObject>> {
            let mut out = Vec::new();
            let start = root.join(&prefix);
            if !start.exists() {
                return Ok(out);
            }
            let mut stack = vec![start];
            while let Some(dir) = stack.pop() {
                for entry in std::fs::read_dir(&dir).map_err(io_transient)? {
                    let entry = entry.map_err(io_transient)?;
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else if path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
                    {
                        let meta = entry.metadata().map_err(io_transient)?;
                        let modified: DateTime<Utc> = meta
                            .modified()
                            .map_err(io_transient)?
                            .into();
                        let key = path
                            .strip_prefix(&root)
                            .map_err(|e| IngestError::unparseable(e))?
                            .to_string_lossy()
                            .replace('\\', "/");
                        out.push(SourceObject {
                            key,
                            last_modified: modified,
                        });
                    }
                }
            }
            out.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(out)
        })
        .await
        .map_err(|e| IngestError::transient(format!("list task: {e}")))??;
        Ok(objects)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.root.join(key);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| IngestError::transient(format!("read {}: {e}", path.display())))?;
        Ok(Bytes::from(data))
    }
}

fn io_transient(e: impl std::fmt::Display) -> IngestError {
    IngestError::transient(e.to_string())
}

/// In-memory source store for tests.
#[derive(Debug, Default)]
pub struct MemorySourceStore {
    objects: RwLock<BTreeMap<String, (DateTime<Utc>, Bytes)>>,
}

impl MemorySourceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an object.
    pub fn put(&self, key: &str, last_modified: DateTime<Utc>, data: impl Into<Bytes>) {
        self.objects
            .write()
            .expect("source store lock")
            .insert(key.to_string(), (last_modified, data.into()));
    }

    /// Updates an object's last-modified marker without changing its data.
    pub fn touch(&self, key: &str, last_modified: DateTime<Utc>) {
        if let Some(entry) = self
            .objects
            .write()
            .expect("source store lock")
            .get_mut(key)
        {
            entry.0 = last_modified;
        }
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn list(&self, prefix: &str) -> Result<Vec<SourceObject>> {
        let objects = self.objects.read().expect("source store lock");
        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix) && key.to_lowercase().ends_with(".csv"))
            .map(|(key, (modified, _))| SourceObject {
                key: key.clone(),
                last_modified: *modified,
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let objects = self.objects.read().expect("source store lock");
        objects
            .get(key)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| IngestError::transient(format!("no such key: {key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_lists_by_prefix_sorted() {
        let store = MemorySourceStore::new();
        let now = Utc::now();
        store.put("export/wait_times/wdw/b.csv", now, "x");
        store.put("export/wait_times/wdw/a.csv", now, "y");
        store.put("export/fastpass_times/wdw/c.csv", now, "z");
        store.put("export/wait_times/wdw/notes.txt", now, "n");

        let listed = store.list("export/wait_times/").await.expect("list");
        let keys: Vec<&str> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["export/wait_times/wdw/a.csv", "export/wait_times/wdw/b.csv"]
        );
    }

    #[tokio::test]
    async fn fs_store_round_trip() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let file_dir = dir.path().join("export/wait_times/wdw");
        std::fs::create_dir_all(&file_dir).expect("mkdir");
        std::fs::write(file_dir.join("jan.csv"), b"header\n").expect("write");

        let store = FsSourceStore::new(dir.path());
        let listed = store.list("export/wait_times/").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "export/wait_times/wdw/jan.csv");

        let data = store.get(&listed[0].key).await.expect("get");
        assert_eq!(&data[..], b"header\n");
    }

    #[tokio::test]
    async fn missing_key_is_transient() {
        let store = MemorySourceStore::new();
        let err = store.get("absent.csv").await.unwrap_err();
        assert!(err.is_transient());
    }
}
