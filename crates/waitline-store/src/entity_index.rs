//! The per-entity observation index.
//!
//! One record per entity code: latest park date and timestamp, counts by
//! wait-time kind, and modeling bookkeeping. The index is maintained
//! incrementally by the canonical writer and drives selective modeling —
//! the batch trainer never scans the fact store to find work.
//!
//! The schema is versioned through SQLite's `user_version` pragma; count
//! columns added after v1 are populated with zero on migration.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use waitline_core::observation::{Observation, WaitTimeType};
use waitline_core::parks::park_code_for_entity;
use waitline_core::RootLayout;

use crate::csvio;
use crate::error::{Result, StoreError};

/// Current index schema version.
const SCHEMA_VERSION: i32 = 2;

/// One entity's index record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    /// Uppercase entity code.
    pub entity_code: String,
    /// Newest park date with an observation.
    pub latest_park_date: String,
    /// Newest serialized `observed_at`.
    pub latest_observed_at: String,
    /// Total observation rows.
    pub row_count: u64,
    /// ACTUAL rows.
    pub actual_count: u64,
    /// POSTED rows.
    pub posted_count: u64,
    /// PRIORITY rows.
    pub priority_count: u64,
    /// When this entity was last modeled, if ever.
    pub last_modeled_at: Option<String>,
    /// When this entity first entered the index.
    pub first_seen_at: String,
    /// Last index update.
    pub updated_at: String,
}

/// A work-list entry for the batch trainer.
#[derive(Debug, Clone)]
pub struct ModelingCandidate {
    /// Entity to model.
    pub entity_code: String,
    /// Newest observation timestamp.
    pub latest_observed_at: String,
    /// Previous modeling timestamp, if any.
    pub last_modeled_at: Option<String>,
    /// ACTUAL observation count.
    pub actual_count: u64,
    /// PRIORITY observation count.
    pub priority_count: u64,
}

/// Per-batch delta applied by the canonical writer.
#[derive(Debug, Clone, Default)]
pub struct BatchDelta {
    /// Max park date in the batch.
    pub max_park_date: String,
    /// Max serialized `observed_at` in the batch.
    pub max_observed_at: String,
    /// Rows in the batch.
    pub rows: u64,
    /// ACTUAL rows in the batch.
    pub actual: u64,
    /// POSTED rows in the batch.
    pub posted: u64,
    /// PRIORITY rows in the batch.
    pub priority: u64,
}

/// Handle to the entity index database.
#[derive(Debug)]
pub struct EntityIndex {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl EntityIndex {
    /// Opens (creating or migrating if needed) the index at `path`.
    ///
    /// # Errors
    ///
    /// Returns a database error on open or migration failure.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(waitline_core::Error::from)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::db(format!("open {}", path.display()), e))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// An in-memory index for tests.
    ///
    /// # Errors
    ///
    /// Returns a database error on schema creation failure.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entity_index (
                entity_code TEXT PRIMARY KEY,
                latest_park_date TEXT NOT NULL,
                latest_observed_at TEXT NOT NULL,
                row_count INTEGER DEFAULT 0,
                last_modeled_at TEXT,
                first_seen_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version < 2 {
            // v2 added the per-type count columns; existing rows start at 0.
            let columns: Vec<String> = conn
                .prepare("PRAGMA table_info(entity_index)")?
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<std::result::Result<_, _>>()?;
            for col in ["actual_count", "posted_count", "priority_count"] {
                if !columns.iter().any(|c| c == col) {
                    conn.execute(
                        &format!("ALTER TABLE entity_index ADD COLUMN {col} INTEGER DEFAULT 0"),
                        [],
                    )?;
                }
            }
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_latest_observed_at
             ON entity_index(latest_observed_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_last_modeled_at
             ON entity_index(last_modeled_at)",
            [],
        )?;
        Ok(())
    }

    /// Applies one write batch's deltas: an idempotent upsert-increment.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure; nothing is applied partially.
    pub fn record_batch(&self, entity_code: &str, delta: &BatchDelta) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().map_err(|_| StoreError::db_msg("poisoned lock"))?;
        conn.execute(
            "INSERT INTO entity_index
               (entity_code, latest_park_date, latest_observed_at, row_count,
                actual_count, posted_count, priority_count, first_seen_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(entity_code) DO UPDATE SET
               latest_park_date = MAX(latest_park_date, excluded.latest_park_date),
               latest_observed_at = MAX(latest_observed_at, excluded.latest_observed_at),
               row_count = row_count + excluded.row_count,
               actual_count = actual_count + excluded.actual_count,
               posted_count = posted_count + excluded.posted_count,
               priority_count = priority_count + excluded.priority_count,
               updated_at = excluded.updated_at",
            params![
                entity_code,
                delta.max_park_date,
                delta.max_observed_at,
                delta.rows,
                delta.actual,
                delta.posted,
                delta.priority,
                now,
            ],
        )?;
        Ok(())
    }

    /// Entities needing (re-)modeling.
    ///
    /// Selection: never modeled, or new observations since the last
    /// modeling; newest observation at least `min_age_hours` old; at least
    /// `min_target_observations` of ACTUAL or PRIORITY.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn list_for_modeling(
        &self,
        min_age_hours: f64,
        min_target_observations: u64,
    ) -> Result<Vec<ModelingCandidate>> {
        let cutoff = (Utc::now()
            - chrono::Duration::seconds((min_age_hours * 3600.0) as i64))
        .to_rfc3339();
        let conn = self.conn.lock().map_err(|_| StoreError::db_msg("poisoned lock"))?;
        let mut stmt = conn.prepare(
            "SELECT entity_code, latest_observed_at, last_modeled_at,
                    actual_count, priority_count
             FROM entity_index
             WHERE (last_modeled_at IS NULL OR latest_observed_at > last_modeled_at)
               AND latest_observed_at < ?1
               AND (actual_count >= ?2 OR priority_count >= ?2)
             ORDER BY latest_observed_at DESC",
        )?;
        let rows = stmt.query_map(
            params![cutoff, i64::try_from(min_target_observations).unwrap_or(i64::MAX)],
            |row| {
                Ok(ModelingCandidate {
                    entity_code: row.get(0)?,
                    latest_observed_at: row.get(1)?,
                    last_modeled_at: row.get(2)?,
                    actual_count: row.get::<_, i64>(3)?.max(0) as u64,
                    priority_count: row.get::<_, i64>(4)?.max(0) as u64,
                })
            },
        )?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Marks an entity modeled at `at`.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub fn mark_modeled(&self, entity_code: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::db_msg("poisoned lock"))?;
        conn.execute(
            "UPDATE entity_index SET last_modeled_at = ?1 WHERE entity_code = ?2",
            params![at.to_rfc3339(), entity_code],
        )?;
        Ok(())
    }

    /// Fetches one entity's record.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn get(&self, entity_code: &str) -> Result<Option<EntityRecord>> {
        let conn = self.conn.lock().map_err(|_| StoreError::db_msg("poisoned lock"))?;
        let record = conn
            .query_row(
                "SELECT entity_code, latest_park_date, latest_observed_at, row_count,
                        actual_count, posted_count, priority_count,
                        last_modeled_at, first_seen_at, updated_at
                 FROM entity_index WHERE entity_code = ?1",
                params![entity_code],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Every record, ordered by entity code.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn all(&self) -> Result<Vec<EntityRecord>> {
        let conn = self.conn.lock().map_err(|_| StoreError::db_msg("poisoned lock"))?;
        let mut stmt = conn.prepare(
            "SELECT entity_code, latest_park_date, latest_observed_at, row_count,
                    actual_count, posted_count, priority_count,
                    last_modeled_at, first_seen_at, updated_at
             FROM entity_index ORDER BY entity_code",
        )?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
        Ok(EntityRecord {
            entity_code: row.get(0)?,
            latest_park_date: row.get(1)?,
            latest_observed_at: row.get(2)?,
            row_count: row.get::<_, i64>(3)?.max(0) as u64,
            actual_count: row.get::<_, i64>(4)?.max(0) as u64,
            posted_count: row.get::<_, i64>(5)?.max(0) as u64,
            priority_count: row.get::<_, i64>(6)?.max(0) as u64,
            last_modeled_at: row.get(7)?,
            first_seen_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    /// Loads every fact row for one entity, sorted by `observed_at`.
    ///
    /// Only `fact/clean/YYYY-MM/{park}_*.csv` files for the entity's park
    /// are scanned — each entity belongs to exactly one park.
    ///
    /// # Errors
    ///
    /// Returns a CSV error if a partition file is unreadable.
    pub fn load_entity_rows(
        layout: &RootLayout,
        entity_code: &str,
    ) -> Result<Vec<Observation>> {
        let park = park_code_for_entity(entity_code);
        let prefix = format!("{park}_");
        let clean = layout.fact_clean();
        let mut rows = Vec::new();
        if !clean.exists() {
            return Ok(rows);
        }
        let mut month_dirs: Vec<PathBuf> = std::fs::read_dir(&clean)
            .map_err(waitline_core::Error::from)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        month_dirs.sort();
        for month_dir in month_dirs {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&month_dir)
                .map_err(waitline_core::Error::from)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".csv"))
                })
                .collect();
            files.sort();
            for file in files {
                for row in csvio::read_fact_file(&file)? {
                    if row.entity_code == entity_code {
                        rows.push(row);
                    }
                }
            }
        }
        rows.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
        Ok(rows)
    }

    /// Rebuilds the index from a full scan of the fact store.
    ///
    /// The existing records are dropped and reconstructed; counts afterward
    /// exactly equal the fact files' contents.
    ///
    /// # Errors
    ///
    /// Returns a database or CSV error on failure.
    pub fn rebuild(&self, layout: &RootLayout) -> Result<u64> {
        {
            let conn = self.conn.lock().map_err(|_| StoreError::db_msg("poisoned lock"))?;
            conn.execute("DELETE FROM entity_index", [])?;
        }

        let clean = layout.fact_clean();
        if !clean.exists() {
            return Ok(0);
        }

        let mut entities: std::collections::BTreeMap<String, BatchDelta> =
            std::collections::BTreeMap::new();
        let mut month_dirs: Vec<PathBuf> = std::fs::read_dir(&clean)
            .map_err(waitline_core::Error::from)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        month_dirs.sort();
        for month_dir in month_dirs {
            for entry in std::fs::read_dir(&month_dir).map_err(waitline_core::Error::from)? {
                let path = entry.map_err(waitline_core::Error::from)?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                    continue;
                }
                for row in csvio::read_fact_file(&path)? {
                    let park_date = park_date_string(&row);
                    let delta = entities.entry(row.entity_code.clone()).or_default();
                    delta.rows += 1;
                    match row.wait_time_type {
                        WaitTimeType::Actual => delta.actual += 1,
                        WaitTimeType::Posted => delta.posted += 1,
                        WaitTimeType::Priority => delta.priority += 1,
                    }
                    let observed = row.observed_at_string();
                    if observed > delta.max_observed_at {
                        delta.max_observed_at = observed;
                    }
                    if park_date > delta.max_park_date {
                        delta.max_park_date = park_date;
                    }
                }
            }
        }

        let total = entities.len() as u64;
        for (entity_code, delta) in entities {
            self.record_batch(&entity_code, &delta)?;
        }
        tracing::info!(entities = total, "entity index rebuilt from fact store");
        Ok(total)
    }

    /// The database path, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn park_date_string(row: &Observation) -> String {
    waitline_core::park_date(&row.observed_at).to_string()
}

/// Builds the per-entity deltas for one partition bucket of observations.
#[must_use]
pub fn deltas_for_rows(rows: &[Observation], park_date: NaiveDate) -> Vec<(String, BatchDelta)> {
    let mut map: std::collections::BTreeMap<String, BatchDelta> = std::collections::BTreeMap::new();
    for row in rows {
        let delta = map.entry(row.entity_code.clone()).or_default();
        delta.rows += 1;
        match row.wait_time_type {
            WaitTimeType::Actual => delta.actual += 1,
            WaitTimeType::Posted => delta.posted += 1,
            WaitTimeType::Priority => delta.priority += 1,
        }
        let observed = row.observed_at_string();
        if observed > delta.max_observed_at {
            delta.max_observed_at = observed;
        }
    }
    let date = park_date.to_string();
    for delta in map.values_mut() {
        delta.max_park_date.clone_from(&date);
    }
    map.into_iter().collect()
}
