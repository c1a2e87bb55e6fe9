//! Persistent categorical label encoding.
//!
//! Tree models consume integers, not strings. Each categorical feature has
//! an append-only map from category to integer ID in
//! `state/encoding_mappings.json`. Existing assignments are never
//! rewritten — retraining with new categories only appends — and unknown
//! categories at inference time receive fresh IDs rather than failing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waitline_core::atomic::{read_json, write_json_replace};
use waitline_core::Error as CoreError;

use crate::error::Result;

#[derive(Debug, Default, Serialize, Deserialize)]
struct EncodingDoc {
    /// Per-feature category → ID maps.
    columns: BTreeMap<String, BTreeMap<String, i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
}

/// The persistent label map.
#[derive(Debug)]
pub struct EncodingMap {
    path: PathBuf,
    doc: EncodingDoc,
    dirty: bool,
}

impl EncodingMap {
    /// Loads the map, starting empty if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns a storage error on an unreadable file.
    pub fn load(path: &Path) -> Result<Self> {
        let doc = match read_json::<EncodingDoc>(path) {
            Ok(doc) => doc,
            Err(CoreError::NotFound(_)) => EncodingDoc {
                created_at: Some(Utc::now()),
                ..EncodingDoc::default()
            },
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            doc,
            dirty: false,
        })
    }

    /// Encodes a category, assigning the next free ID if it is new.
    pub fn encode(&mut self, column: &str, category: &str) -> i64 {
        let column_map = self.doc.columns.entry(column.to_string()).or_default();
        if let Some(id) = column_map.get(category) {
            return *id;
        }
        let next = column_map.values().max().map_or(0, |m| m + 1);
        column_map.insert(category.to_string(), next);
        self.dirty = true;
        next
    }

    /// Looks up a category without assigning.
    #[must_use]
    pub fn lookup(&self, column: &str, category: &str) -> Option<i64> {
        self.doc.columns.get(column)?.get(category).copied()
    }

    /// Reverse lookup: the category carrying `id` in `column`.
    #[must_use]
    pub fn decode(&self, column: &str, id: i64) -> Option<&str> {
        self.doc
            .columns
            .get(column)?
            .iter()
            .find_map(|(cat, v)| (*v == id).then_some(cat.as_str()))
    }

    /// Persists the map if any ID was assigned since the last save.
    ///
    /// # Errors
    ///
    /// Returns a storage error on write failure.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.doc.last_updated = Some(Utc::now());
        write_json_replace(&self.path, &self.doc)?;
        self.dirty = false;
        Ok(())
    }
}
