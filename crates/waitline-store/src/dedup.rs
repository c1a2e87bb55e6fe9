//! The persistent row-deduplication set.
//!
//! A SQLite table whose primary key is the full 4-tuple
//! `(entity_code, observed_at, wait_time_type, wait_time_minutes)`.
//! Batch insertion uses `INSERT OR IGNORE` inside one transaction and
//! reports, per row, whether it was new — only new rows flow on to the
//! canonical files. Cardinality grows monotonically; `clear` supports the
//! full-rebuild path.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use waitline_core::observation::Observation;

use crate::error::{Result, StoreError};

/// Handle to a dedup database (canonical or poller-scoped).
#[derive(Debug)]
pub struct DedupSet {
    conn: Mutex<Connection>,
}

impl DedupSet {
    /// Opens (creating if needed) the dedup database at `path`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(waitline_core::Error::from)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::db(format!("open {}", path.display()), e))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS dedupe_keys (
                entity_code TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                wait_time_type TEXT NOT NULL,
                wait_time_minutes INTEGER NOT NULL,
                PRIMARY KEY (entity_code, observed_at, wait_time_type, wait_time_minutes)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory set for tests.
    ///
    /// # Errors
    ///
    /// Returns a database error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS dedupe_keys (
                entity_code TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                wait_time_type TEXT NOT NULL,
                wait_time_minutes INTEGER NOT NULL,
                PRIMARY KEY (entity_code, observed_at, wait_time_type, wait_time_minutes)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a batch of rows, returning `true` per row that was new.
    ///
    /// The whole batch commits in one transaction; on error nothing is
    /// inserted.
    ///
    /// # Errors
    ///
    /// Returns a database error if the transaction fails.
    pub fn insert_new_mask(&self, rows: &[Observation]) -> Result<Vec<bool>> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::db_msg("poisoned lock"))?;
        let tx = conn.transaction()?;
        let mut mask = Vec::with_capacity(rows.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO dedupe_keys
                 (entity_code, observed_at, wait_time_type, wait_time_minutes)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for row in rows {
                let inserted = stmt.execute(params![
                    row.entity_code,
                    row.observed_at_string(),
                    row.wait_time_type.as_str(),
                    row.wait_time_minutes,
                ])?;
                mask.push(inserted == 1);
            }
        }
        tx.commit()?;
        Ok(mask)
    }

    /// Whether a single row is already present.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn contains(&self, row: &Observation) -> Result<bool> {
        let conn = self.conn.lock().map_err(|_| StoreError::db_msg("poisoned lock"))?;
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM dedupe_keys
             WHERE entity_code = ?1 AND observed_at = ?2
               AND wait_time_type = ?3 AND wait_time_minutes = ?4",
        )?;
        let found = stmt
            .query_row(
                params![
                    row.entity_code,
                    row.observed_at_string(),
                    row.wait_time_type.as_str(),
                    row.wait_time_minutes,
                ],
                |_| Ok(()),
            )
            .map(|()| true);
        match found {
            Ok(v) => Ok(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Total number of keys in the set.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn len(&self) -> Result<u64> {
        let conn = self.conn.lock().map_err(|_| StoreError::db_msg("poisoned lock"))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dedupe_keys", [], |r| r.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Whether the set is empty.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes every key — used only by the full-rebuild path.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::db_msg("poisoned lock"))?;
        conn.execute("DELETE FROM dedupe_keys", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waitline_core::observation::{parse_observed_at, WaitTimeType};

    fn obs(entity: &str, at: &str, t: WaitTimeType, m: i32) -> Observation {
        Observation::new(entity, parse_observed_at(at).unwrap(), t, m)
    }

    #[test]
    fn second_insert_is_duplicate() {
        let set = DedupSet::in_memory().expect("open");
        let rows = vec![
            obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Posted, 35),
            obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Actual, 40),
        ];
        assert_eq!(set.insert_new_mask(&rows).expect("first"), vec![true, true]);
        assert_eq!(
            set.insert_new_mask(&rows).expect("second"),
            vec![false, false]
        );
        assert_eq!(set.len().expect("len"), 2);
    }

    #[test]
    fn tuple_components_all_distinguish() {
        let set = DedupSet::in_memory().expect("open");
        let base = obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Posted, 35);
        set.insert_new_mask(std::slice::from_ref(&base)).expect("insert");

        let differing = vec![
            obs("MK102", "2024-01-15T10:30:00-05:00", WaitTimeType::Posted, 35),
            obs("MK101", "2024-01-15T10:35:00-05:00", WaitTimeType::Posted, 35),
            obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Actual, 35),
            obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Posted, 36),
        ];
        let mask = set.insert_new_mask(&differing).expect("insert");
        assert!(mask.iter().all(|new| *new));
    }

    #[test]
    fn clear_empties_the_set() {
        let set = DedupSet::in_memory().expect("open");
        let row = obs("EP09", "2024-03-10T09:00:00-05:00", WaitTimeType::Priority, 8888);
        set.insert_new_mask(std::slice::from_ref(&row)).expect("insert");
        assert!(set.contains(&row).expect("contains"));
        set.clear().expect("clear");
        assert!(!set.contains(&row).expect("contains"));
        assert!(set.is_empty().expect("empty"));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("dedupe.sqlite");
        let row = obs("AK01", "2026-06-15T09:05:00-04:00", WaitTimeType::Posted, 20);
        {
            let set = DedupSet::open(&path).expect("open");
            set.insert_new_mask(std::slice::from_ref(&row)).expect("insert");
        }
        let set = DedupSet::open(&path).expect("reopen");
        assert!(set.contains(&row).expect("contains"));
    }
}
