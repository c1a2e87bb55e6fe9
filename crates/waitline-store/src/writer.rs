//! The canonical partitioned writer.
//!
//! Accepts a stream of observations and lands them in
//! `fact/clean/YYYY-MM/{park}_{date}.csv` partitions:
//!
//! 1. rows already in the dedup set are dropped;
//! 2. rows outside their documented numeric range are counted and dropped
//!    (they never enter the canonical store);
//! 3. survivors buffer by `(park_code, park_date)` and flush at a bounded
//!    threshold or at batch end.
//!
//! A flush merges the sorted new rows with the existing file's ordered
//! rows in one streaming pass (no full re-sort), writes a `.tmp` sibling,
//! and renames. The entity-index increments are applied before the
//! bucket's dedup insertions commit, and both happen before the caller
//! records the source file as processed.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::NaiveDate;

use waitline_core::atomic::tmp_sibling;
use waitline_core::observation::{DedupKey, Observation, WaitTimeType};
use waitline_core::parks::park_code_for_entity;
use waitline_core::{park_date, RootLayout};

use crate::csvio;
use crate::dedup::DedupSet;
use crate::entity_index::{deltas_for_rows, EntityIndex};
use crate::error::{Result, StoreError};

/// Default number of buffered rows that triggers a flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 100_000;

/// Totals accumulated by a writer over its lifetime.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    /// POSTED rows written.
    pub posted_written: u64,
    /// ACTUAL rows written.
    pub actual_written: u64,
    /// PRIORITY rows written.
    pub priority_written: u64,
    /// Rows dropped as duplicates of the dedup set.
    pub duplicates: u64,
    /// Rows dropped for being outside their valid range.
    pub invalid: u64,
    /// Rows written per park.
    pub rows_per_park: BTreeMap<String, u64>,
    /// Distinct partitions touched.
    pub partitions_touched: u64,
}

impl WriteReport {
    /// Total rows written across all wait-time kinds.
    #[must_use]
    pub fn total_written(&self) -> u64 {
        self.posted_written + self.actual_written + self.priority_written
    }

    /// Folds another report into this one.
    pub fn merge(&mut self, other: &Self) {
        self.posted_written += other.posted_written;
        self.actual_written += other.actual_written;
        self.priority_written += other.priority_written;
        self.duplicates += other.duplicates;
        self.invalid += other.invalid;
        self.partitions_touched += other.partitions_touched;
        for (park, n) in &other.rows_per_park {
            *self.rows_per_park.entry(park.clone()).or_default() += n;
        }
    }
}

/// Streaming writer into the canonical store.
pub struct CanonicalWriter<'a> {
    layout: &'a RootLayout,
    dedup: &'a DedupSet,
    index: &'a EntityIndex,
    buffers: BTreeMap<(String, NaiveDate), Vec<Observation>>,
    pending_keys: HashSet<DedupKey>,
    buffered_rows: usize,
    flush_threshold: usize,
    report: WriteReport,
}

impl<'a> CanonicalWriter<'a> {
    /// Creates a writer over the given stores.
    #[must_use]
    pub fn new(layout: &'a RootLayout, dedup: &'a DedupSet, index: &'a EntityIndex) -> Self {
        Self {
            layout,
            dedup,
            index,
            buffers: BTreeMap::new(),
            pending_keys: HashSet::new(),
            buffered_rows: 0,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            report: WriteReport::default(),
        }
    }

    /// Overrides the flush threshold (rows buffered before a flush).
    #[must_use]
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    /// Pushes a batch of observations through dedup into the buffers.
    ///
    /// # Errors
    ///
    /// Returns a store error if dedup lookups or a triggered flush fail.
    pub fn push_batch(&mut self, rows: Vec<Observation>) -> Result<()> {
        for row in rows {
            if !row.in_valid_range() {
                self.report.invalid += 1;
                continue;
            }
            let key = row.dedup_key();
            if self.pending_keys.contains(&key) || self.dedup.contains(&row)? {
                self.report.duplicates += 1;
                continue;
            }
            let park = park_code_for_entity(&row.entity_code);
            let date = park_date(&row.observed_at);
            self.pending_keys.insert(key);
            self.buffers.entry((park, date)).or_default().push(row);
            self.buffered_rows += 1;
            if self.buffered_rows >= self.flush_threshold {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Flushes every buffered partition.
    ///
    /// # Errors
    ///
    /// Returns a store error on failure; the failed bucket's rows stay
    /// out of the dedup set so a re-run can retry them.
    pub fn flush(&mut self) -> Result<()> {
        let buffers = std::mem::take(&mut self.buffers);
        for ((park, date), mut rows) in buffers {
            rows.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
            let path = self.layout.fact_file(&park, date);
            merge_into_partition(&path, &rows)?;

            // Index increments precede the dedup commit, which in turn
            // precedes the caller's processed-catalog update.
            for (entity, delta) in deltas_for_rows(&rows, date) {
                self.index.record_batch(&entity, &delta)?;
            }
            self.dedup.insert_new_mask(&rows)?;

            for row in &rows {
                self.pending_keys.remove(&row.dedup_key());
                match row.wait_time_type {
                    WaitTimeType::Posted => self.report.posted_written += 1,
                    WaitTimeType::Actual => self.report.actual_written += 1,
                    WaitTimeType::Priority => self.report.priority_written += 1,
                }
            }
            *self.report.rows_per_park.entry(park).or_default() += rows.len() as u64;
            self.report.partitions_touched += 1;
            tracing::debug!(path = %path.display(), rows = rows.len(), "partition flushed");
        }
        self.buffered_rows = 0;
        Ok(())
    }

    /// Discards buffered rows without writing them.
    ///
    /// Used when a source file fails mid-stream: no partial append is
    /// allowed, and the dropped rows were never dedup-committed.
    pub fn discard_buffered(&mut self) {
        for rows in self.buffers.values() {
            for row in rows {
                self.pending_keys.remove(&row.dedup_key());
            }
        }
        self.buffers.clear();
        self.buffered_rows = 0;
    }

    /// Flushes remaining buffers and returns the accumulated report.
    ///
    /// # Errors
    ///
    /// Returns a store error if the final flush fails.
    pub fn finish(mut self) -> Result<WriteReport> {
        self.flush()?;
        Ok(self.report)
    }

    /// The report accumulated so far.
    #[must_use]
    pub fn report(&self) -> &WriteReport {
        &self.report
    }
}

/// Merges sorted `new_rows` into the partition file at `path`.
///
/// Existing rows are streamed in order and interleaved with the new rows;
/// the combined sequence lands in a `.tmp` sibling which replaces the
/// target. A brand-new partition is written directly.
fn merge_into_partition(path: &Path, new_rows: &[Observation]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(waitline_core::Error::from)?;
    }

    let tmp = tmp_sibling(path, "append.tmp");
    let result = (|| -> Result<()> {
        let file = std::fs::File::create(&tmp).map_err(waitline_core::Error::from)?;
        let mut csv_writer = csv::Writer::from_writer(std::io::BufWriter::new(file));
        csv_writer.write_record(csvio::HEADER).map_err(StoreError::from)?;

        let mut pending = new_rows.iter().peekable();
        if path.exists() {
            for existing in csvio::read_fact_file(path)? {
                while let Some(next) = pending.peek() {
                    if next.observed_at < existing.observed_at {
                        let row = pending.next().expect("peeked");
                        csvio::write_row(&mut csv_writer, row)?;
                    } else {
                        break;
                    }
                }
                csvio::write_row(&mut csv_writer, &existing)?;
            }
        }
        for row in pending {
            csvio::write_row(&mut csv_writer, row)?;
        }

        let mut inner = csv_writer
            .into_inner()
            .map_err(|e| StoreError::csv(e.to_string()))?;
        use std::io::Write as _;
        inner.flush().map_err(waitline_core::Error::from)?;
        inner
            .into_inner()
            .map_err(|e| StoreError::csv(e.to_string()))?
            .sync_all()
            .map_err(waitline_core::Error::from)?;
        std::fs::rename(&tmp, path).map_err(waitline_core::Error::from)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use waitline_core::observation::parse_observed_at;

    fn obs(entity: &str, at: &str, t: WaitTimeType, m: i32) -> Observation {
        Observation::new(entity, parse_observed_at(at).unwrap(), t, m)
    }

    struct Fixture {
        _dir: TempDir,
        layout: RootLayout,
        dedup: DedupSet,
        index: EntityIndex,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let layout = RootLayout::new(dir.path());
        let dedup = DedupSet::in_memory().expect("dedup");
        let index = EntityIndex::in_memory().expect("index");
        Fixture {
            _dir: dir,
            layout,
            dedup,
            index,
        }
    }

    #[test]
    fn writes_partition_and_updates_index() {
        let f = fixture();
        let mut writer = CanonicalWriter::new(&f.layout, &f.dedup, &f.index);
        writer
            .push_batch(vec![
                obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Posted, 35),
                obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Actual, 40),
            ])
            .expect("push");
        let report = writer.finish().expect("finish");
        assert_eq!(report.posted_written, 1);
        assert_eq!(report.actual_written, 1);
        assert_eq!(report.rows_per_park.get("mk"), Some(&2));

        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let rows = csvio::read_fact_file(&f.layout.fact_file("mk", date)).expect("read");
        assert_eq!(rows.len(), 2);

        let record = f.index.get("MK101").expect("get").expect("present");
        assert_eq!(record.posted_count, 1);
        assert_eq!(record.actual_count, 1);
    }

    #[test]
    fn six_am_rule_routes_to_previous_day_partition() {
        let f = fixture();
        let mut writer = CanonicalWriter::new(&f.layout, &f.dedup, &f.index);
        writer
            .push_batch(vec![obs(
                "EP09",
                "2024-03-11T03:15:00-04:00",
                WaitTimeType::Actual,
                12,
            )])
            .expect("push");
        writer.finish().expect("finish");

        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert!(f.layout.fact_file("ep", date).exists());
    }

    #[test]
    fn duplicates_are_dropped_across_batches() {
        let f = fixture();
        let row = obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Posted, 35);
        {
            let mut writer = CanonicalWriter::new(&f.layout, &f.dedup, &f.index);
            writer.push_batch(vec![row.clone()]).expect("push");
            writer.finish().expect("finish");
        }
        let mut writer = CanonicalWriter::new(&f.layout, &f.dedup, &f.index);
        writer.push_batch(vec![row]).expect("push");
        let report = writer.finish().expect("finish");
        assert_eq!(report.total_written(), 0);
        assert_eq!(report.duplicates, 1);

        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let rows = csvio::read_fact_file(&f.layout.fact_file("mk", date)).expect("read");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn intra_batch_duplicates_collapse() {
        let f = fixture();
        let row = obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Posted, 35);
        let mut writer = CanonicalWriter::new(&f.layout, &f.dedup, &f.index);
        writer.push_batch(vec![row.clone(), row]).expect("push");
        let report = writer.finish().expect("finish");
        assert_eq!(report.total_written(), 1);
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn append_merges_in_timestamp_order() {
        let f = fixture();
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        {
            let mut writer = CanonicalWriter::new(&f.layout, &f.dedup, &f.index);
            writer
                .push_batch(vec![
                    obs("MK101", "2024-01-15T09:00:00-05:00", WaitTimeType::Posted, 10),
                    obs("MK101", "2024-01-15T12:00:00-05:00", WaitTimeType::Posted, 30),
                ])
                .expect("push");
            writer.finish().expect("finish");
        }
        {
            let mut writer = CanonicalWriter::new(&f.layout, &f.dedup, &f.index);
            writer
                .push_batch(vec![
                    obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Posted, 20),
                    obs("MK101", "2024-01-15T13:00:00-05:00", WaitTimeType::Posted, 40),
                ])
                .expect("push");
            writer.finish().expect("finish");
        }
        let rows = csvio::read_fact_file(&f.layout.fact_file("mk", date)).expect("read");
        let minutes: Vec<i32> = rows.iter().map(|r| r.wait_time_minutes).collect();
        assert_eq!(minutes, vec![10, 20, 30, 40]);
        let mut sorted = rows.clone();
        sorted.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
        assert_eq!(rows, sorted);
    }

    #[test]
    fn threshold_triggers_mid_batch_flush() {
        let f = fixture();
        let mut writer =
            CanonicalWriter::new(&f.layout, &f.dedup, &f.index).with_flush_threshold(2);
        writer
            .push_batch(vec![
                obs("MK101", "2024-01-15T09:00:00-05:00", WaitTimeType::Posted, 10),
                obs("MK101", "2024-01-15T09:05:00-05:00", WaitTimeType::Posted, 15),
                obs("MK101", "2024-01-15T09:10:00-05:00", WaitTimeType::Posted, 20),
            ])
            .expect("push");
        // Two rows flushed at the threshold; the third is still buffered.
        assert_eq!(writer.report().posted_written, 2);
        let report = writer.finish().expect("finish");
        assert_eq!(report.posted_written, 3);
        assert_eq!(report.partitions_touched, 2);
    }

    #[test]
    fn out_of_range_rows_never_land() {
        let f = fixture();
        let mut writer = CanonicalWriter::new(&f.layout, &f.dedup, &f.index);
        writer
            .push_batch(vec![
                obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Posted, 1500),
                obs("MK101", "2024-01-15T10:31:00-05:00", WaitTimeType::Posted, 25),
            ])
            .expect("push");
        let report = writer.finish().expect("finish");
        assert_eq!(report.invalid, 1);
        assert_eq!(report.posted_written, 1);
    }

    #[test]
    fn discard_leaves_no_trace() {
        let f = fixture();
        let row = obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Posted, 35);
        let mut writer = CanonicalWriter::new(&f.layout, &f.dedup, &f.index);
        writer.push_batch(vec![row.clone()]).expect("push");
        writer.discard_buffered();
        let report = writer.finish().expect("finish");
        assert_eq!(report.total_written(), 0);
        // The discarded row was never dedup-committed, so a retry lands it.
        assert!(!f.dedup.contains(&row).expect("contains"));
    }
}
