//! The historical ingest driver.
//!
//! One run: list candidate keys per property, drop keys whose catalog
//! marker matches the source, drop quarantined keys, then stream each
//! survivor through its parser into the canonical writer. A file's catalog
//! entry is recorded only after its rows have committed to the fact store,
//! the dedup set, and the entity index — a crash mid-file re-discovers the
//! file next run and the dedup set absorbs the replay.

use std::collections::BTreeMap;

use waitline_core::parks::timezone_from_key;
use waitline_core::{RetryPolicy, RootLayout};
use waitline_store::{
    CanonicalWriter, DedupSet, EntityIndex, FailureTally, ProcessedCatalog, WriteReport,
};

use crate::classify::{classify, FileClass};
use crate::error::{IngestError, Result};
use crate::fastpass::{parse_fastpass_legacy, parse_fastpass_new};
use crate::source::{SourceObject, SourceStore};
use crate::standby::{parse_standby, ParsedChunk};

/// Options for one ingest run.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Property scopes to list (`wdw`, `dlr`, …).
    pub properties: Vec<String>,
    /// Row batch size for chunked parsing.
    pub chunksize: usize,
    /// Ignore the processed catalog and clear the dedup set first.
    pub full_rebuild: bool,
    /// Quarantine threshold: failures required.
    pub fail_threshold: u32,
    /// Quarantine threshold: source age in days.
    pub old_days: i64,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            properties: waitline_core::parks::DEFAULT_PROPERTIES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            chunksize: 250_000,
            full_rebuild: false,
            fail_threshold: 3,
            old_days: 600,
        }
    }
}

/// Outcome of one ingest run.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Files fully processed this run.
    pub files_processed: u64,
    /// Files skipped because their catalog marker matched.
    pub files_skipped: u64,
    /// Files skipped by the quarantine policy.
    pub files_quarantined: u64,
    /// Files that failed after retries.
    pub files_failed: u64,
    /// Files with an unrecognized key shape.
    pub files_unknown: u64,
    /// Per-class counts of files examined.
    pub file_classes: BTreeMap<&'static str, u64>,
    /// Rows dropped by parsers for missing values.
    pub rows_dropped: u64,
    /// Rows rejected by parsers as unparseable.
    pub row_parse_errors: u64,
    /// Values outside their documented range.
    pub rows_invalid: u64,
    /// Canonical write totals.
    pub write: WriteReport,
}

/// The ingest component.
pub struct Ingestor<'a> {
    source: &'a dyn SourceStore,
    layout: &'a RootLayout,
    dedup: &'a DedupSet,
    index: &'a EntityIndex,
    retry: RetryPolicy,
}

impl<'a> Ingestor<'a> {
    /// Creates an ingestor over the given source and stores.
    #[must_use]
    pub fn new(
        source: &'a dyn SourceStore,
        layout: &'a RootLayout,
        dedup: &'a DedupSet,
        index: &'a EntityIndex,
    ) -> Self {
        Self {
            source,
            layout,
            dedup,
            index,
            retry: RetryPolicy::default(),
        }
    }

    /// Overrides the retry policy (tests shrink the backoff).
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Runs one ingest pass.
    ///
    /// # Errors
    ///
    /// Returns an error only for run-level failures (state files
    /// unreadable, dedup clear failed); per-file failures are absorbed
    /// into the report and the failure tally.
    pub async fn run(&self, options: &IngestOptions) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        let mut catalog = if options.full_rebuild {
            tracing::info!("full rebuild: ignoring processed catalog and clearing dedup set");
            self.dedup.clear()?;
            ProcessedCatalog::empty(&self.layout.processed_files())
        } else {
            ProcessedCatalog::load(&self.layout.processed_files())?
        };
        let mut tally = FailureTally::load(
            &self.layout.failed_files(),
            options.fail_threshold,
            options.old_days,
        )?;

        // Discovery across both prefixes per property.
        let mut candidates: Vec<SourceObject> = Vec::new();
        for prop in &options.properties {
            for prefix in [
                format!("export/wait_times/{prop}/"),
                format!("export/fastpass_times/{prop}/"),
            ] {
                match self.source.list(&prefix).await {
                    Ok(mut objects) => candidates.append(&mut objects),
                    Err(e) => {
                        tracing::error!(prefix, error = %e, "listing failed, skipping prefix");
                    }
                }
            }
        }
        candidates.sort_by(|a, b| a.key.cmp(&b.key));
        tracing::info!(total = candidates.len(), "source objects discovered");

        for object in candidates {
            let marker = object.last_modified.to_rfc3339();
            if !options.full_rebuild && catalog.is_processed(&object.key, &marker) {
                report.files_skipped += 1;
                continue;
            }
            if tally.is_quarantined(&object.key, object.last_modified) {
                report.files_quarantined += 1;
                tracing::info!(key = object.key, "skipping quarantined file");
                continue;
            }

            let class = classify(&object.key);
            *report.file_classes.entry(class.as_str()).or_default() += 1;
            if class == FileClass::Unknown {
                report.files_unknown += 1;
                tracing::warn!(key = object.key, "unrecognized file type, skipping");
                continue;
            }

            match self
                .process_file(&object, class, options.chunksize, &mut report)
                .await
            {
                Ok(()) => {
                    tally.clear(&object.key);
                    catalog.record(&object.key, &marker);
                    catalog.save()?;
                    tally.save()?;
                    report.files_processed += 1;
                }
                Err(e) => {
                    tracing::error!(key = object.key, error = %e, "file failed");
                    tally.record_failure(&object.key, &e, object.last_modified);
                    tally.save()?;
                    report.files_failed += 1;
                }
            }
        }

        catalog.save()?;
        tally.save()?;
        tracing::info!(
            processed = report.files_processed,
            skipped = report.files_skipped,
            quarantined = report.files_quarantined,
            failed = report.files_failed,
            rows = report.write.total_written(),
            "ingest run complete"
        );
        Ok(report)
    }

    /// Streams one file through its parser into the canonical writer.
    ///
    /// All of the file's rows commit (fact, index, dedup) before this
    /// returns; on error the buffered rows are discarded so no partial
    /// append survives.
    async fn process_file(
        &self,
        object: &SourceObject,
        class: FileClass,
        chunksize: usize,
        report: &mut IngestReport,
    ) -> Result<()> {
        let span = waitline_core::observability::ingest_span("process_file", &object.key);
        let _guard = span.enter();
        tracing::info!(class = class.as_str(), "processing");

        let data = self
            .retry
            .run(|| self.source.get(&object.key), IngestError::is_transient)
            .await?;

        let tz = timezone_from_key(&object.key);
        let chunks: Box<dyn Iterator<Item = Result<ParsedChunk>>> = match class {
            FileClass::Standby => Box::new(parse_standby(&data, tz, chunksize)?),
            FileClass::FastpassNew => Box::new(parse_fastpass_new(&data, tz, chunksize)?),
            FileClass::FastpassOld => Box::new(parse_fastpass_legacy(&data, tz, chunksize)?),
            FileClass::Unknown => unreachable!("unknown files are filtered before processing"),
        };

        let mut writer = CanonicalWriter::new(self.layout, self.dedup, self.index);
        let mut rows_emitted = 0u64;
        let mut parse_errors = 0u64;
        let result = (|| -> Result<()> {
            for chunk in chunks {
                let chunk = chunk?;
                rows_emitted += chunk.rows.len() as u64;
                parse_errors += chunk.parse_errors;
                report.rows_dropped += chunk.dropped;
                report.row_parse_errors += chunk.parse_errors;
                report.rows_invalid += chunk.invalid;
                writer.push_batch(chunk.rows)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                if rows_emitted == 0 && parse_errors > 0 {
                    writer.discard_buffered();
                    return Err(IngestError::unparseable(format!(
                        "all {parse_errors} rows failed to parse"
                    )));
                }
                let file_report = writer.finish()?;
                report.rows_invalid += file_report.invalid;
                report.write.merge(&file_report);
                tracing::info!(
                    rows = file_report.total_written(),
                    duplicates = file_report.duplicates,
                    "file committed"
                );
                Ok(())
            }
            Err(e) => {
                writer.discard_buffered();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySourceStore;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use waitline_store::csvio;

    const STANDBY: &str = "entity_code,observed_at,submitted_posted_time,submitted_actual_time\n\
                           MK101,2024-01-15T10:30:00,35,40\n";

    struct Fixture {
        _dir: TempDir,
        layout: RootLayout,
        dedup: DedupSet,
        index: EntityIndex,
        source: MemorySourceStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let layout = RootLayout::new(dir.path());
        let dedup = DedupSet::open(&layout.dedup_db()).expect("dedup");
        let index = EntityIndex::open(&layout.entity_index_db()).expect("index");
        Fixture {
            _dir: dir,
            layout,
            dedup,
            index,
            source: MemorySourceStore::new(),
        }
    }

    fn options() -> IngestOptions {
        IngestOptions {
            properties: vec!["wdw".into()],
            chunksize: 1000,
            ..IngestOptions::default()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: std::time::Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn single_standby_file_end_to_end() {
        let f = fixture();
        let modified = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        f.source
            .put("export/wait_times/wdw/jan.csv", modified, STANDBY);

        let ingestor = Ingestor::new(&f.source, &f.layout, &f.dedup, &f.index);
        let report = ingestor.run(&options()).await.expect("run");

        assert_eq!(report.files_processed, 1);
        assert_eq!(report.write.posted_written, 1);
        assert_eq!(report.write.actual_written, 1);

        let date = chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let rows = csvio::read_fact_file(&f.layout.fact_file("mk", date)).expect("read");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].observed_at_string(), "2024-01-15T10:30:00-05:00");

        let record = f.index.get("MK101").expect("get").expect("present");
        assert_eq!(record.posted_count, 1);
        assert_eq!(record.actual_count, 1);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let f = fixture();
        let modified = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        f.source
            .put("export/wait_times/wdw/jan.csv", modified, STANDBY);

        let ingestor = Ingestor::new(&f.source, &f.layout, &f.dedup, &f.index);
        let first = ingestor.run(&options()).await.expect("first");
        assert_eq!(first.files_processed, 1);
        let dedup_len = f.dedup.len().expect("len");

        let second = ingestor.run(&options()).await.expect("second");
        assert_eq!(second.files_processed, 0);
        assert_eq!(second.files_skipped, 1);
        assert_eq!(second.write.total_written(), 0);
        assert_eq!(f.dedup.len().expect("len"), dedup_len);
    }

    #[tokio::test]
    async fn touched_file_reprocesses_but_rows_dedup() {
        let f = fixture();
        let modified = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        f.source
            .put("export/wait_times/wdw/jan.csv", modified, STANDBY);

        let ingestor = Ingestor::new(&f.source, &f.layout, &f.dedup, &f.index);
        ingestor.run(&options()).await.expect("first");

        let newer = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        f.source.touch("export/wait_times/wdw/jan.csv", newer);
        let second = ingestor.run(&options()).await.expect("second");
        assert_eq!(second.files_processed, 1);
        assert_eq!(second.write.total_written(), 0);
        assert_eq!(second.write.duplicates, 2);
    }

    #[tokio::test]
    async fn headerless_standby_counts_as_failed() {
        let f = fixture();
        let modified = Utc::now();
        f.source
            .put("export/wait_times/wdw/misc.csv", modified, "a,b\n1,2\n");

        let ingestor =
            Ingestor::new(&f.source, &f.layout, &f.dedup, &f.index).with_retry(fast_retry());
        let report = ingestor.run(&options()).await.expect("run");
        assert_eq!(report.files_failed, 1);
        assert_eq!(report.files_processed, 0);

        // The failure is tallied for the quarantine policy.
        let tally = FailureTally::load(&f.layout.failed_files(), 3, 600).expect("tally");
        assert_eq!(
            tally.get("export/wait_times/wdw/misc.csv").map(|e| e.failures),
            Some(1)
        );
    }

    #[tokio::test]
    async fn failure_tally_quarantines_old_files() {
        let f = fixture();
        // Last modified far in the past, so quarantine can engage.
        let old = Utc.with_ymd_and_hms(2014, 6, 1, 0, 0, 0).unwrap();
        f.source.put(
            "export/fastpass_times/wdw/fp_2014.csv",
            old,
            "garbage without commas\n\u{0}\u{0}\n",
        );

        let ingestor =
            Ingestor::new(&f.source, &f.layout, &f.dedup, &f.index).with_retry(fast_retry());
        let mut opts = options();
        opts.fail_threshold = 2;

        let first = ingestor.run(&opts).await.expect("first");
        assert_eq!(first.files_failed, 1);
        let second = ingestor.run(&opts).await.expect("second");
        assert_eq!(second.files_failed, 1);
        // Two failures recorded and the file is old: third run quarantines.
        let third = ingestor.run(&opts).await.expect("third");
        assert_eq!(third.files_quarantined, 1);
        assert_eq!(third.files_failed, 0);
    }

    #[tokio::test]
    async fn full_rebuild_clears_dedup_and_reprocesses() {
        let f = fixture();
        let modified = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        f.source
            .put("export/wait_times/wdw/jan.csv", modified, STANDBY);

        let ingestor = Ingestor::new(&f.source, &f.layout, &f.dedup, &f.index);
        ingestor.run(&options()).await.expect("first");

        let mut opts = options();
        opts.full_rebuild = true;
        let rebuilt = ingestor.run(&opts).await.expect("rebuild");
        assert_eq!(rebuilt.files_processed, 1);
        // The cleared dedup set accepts the rows again.
        assert_eq!(rebuilt.write.total_written(), 2);
    }
}
