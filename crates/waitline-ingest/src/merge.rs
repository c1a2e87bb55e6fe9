//! The morning merge of staged live observations.
//!
//! The live poller writes only to `staging/live/`; the canonical store
//! stays static between daily runs. At the very start of each pipeline run
//! this merge folds **yesterday's** staging files (yesterday in Eastern
//! time under the 6 AM rule) through the canonical writer — same dedup,
//! same partitioning — and deletes each staging file once its rows have
//! committed. A file whose commit fails stays in place for the next run.

use chrono::Utc;

use waitline_core::parkdate::park_date_in_zone;
use waitline_core::RootLayout;
use waitline_store::{csvio, CanonicalWriter, DedupSet, EntityIndex, WriteReport};

use crate::error::Result;

/// Outcome of one morning merge.
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Staging files merged and deleted.
    pub files_merged: u64,
    /// Staging files left in place after a failure.
    pub files_failed: u64,
    /// Canonical write totals.
    pub write: WriteReport,
}

impl MergeReport {
    /// Whether every discovered staging file committed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.files_failed == 0
    }
}

/// Merges yesterday's staged live rows into the canonical store.
///
/// # Errors
///
/// Returns an error only when the staging area itself cannot be listed;
/// per-file failures are absorbed into the report.
pub fn merge_yesterday_staging(
    layout: &RootLayout,
    dedup: &DedupSet,
    index: &EntityIndex,
) -> Result<MergeReport> {
    let eastern = chrono_tz::America::New_York;
    let today = park_date_in_zone(Utc::now(), eastern);
    let yesterday = today.pred_opt().unwrap_or(today);
    merge_staging_for_date(layout, dedup, index, yesterday)
}

/// Merges staged rows for a specific park date (exposed for the CLI's
/// `merge-staging` command and for tests).
///
/// # Errors
///
/// Returns an error only when the staging area cannot be listed.
pub fn merge_staging_for_date(
    layout: &RootLayout,
    dedup: &DedupSet,
    index: &EntityIndex,
    date: chrono::NaiveDate,
) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    let month_dir = layout
        .staging_live()
        .join(waitline_core::parkdate::month_folder(date));
    if !month_dir.exists() {
        tracing::debug!(date = %date, "no staging directory for date");
        return Ok(report);
    }

    let suffix = format!("_{date}.csv");
    let mut files: Vec<std::path::PathBuf> = std::fs::read_dir(&month_dir)
        .map_err(waitline_core::Error::from)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix))
        })
        .collect();
    files.sort();

    for path in files {
        let merged = (|| -> Result<WriteReport> {
            let rows = csvio::read_fact_file(&path)?;
            let mut writer = CanonicalWriter::new(layout, dedup, index);
            writer.push_batch(rows)?;
            Ok(writer.finish()?)
        })();
        match merged {
            Ok(file_report) => {
                report.write.merge(&file_report);
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "merged but could not delete staging file");
                } else {
                    tracing::info!(
                        path = %path.display(),
                        rows = file_report.total_written(),
                        duplicates = file_report.duplicates,
                        "staging file merged"
                    );
                }
                report.files_merged += 1;
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "staging merge failed, file kept");
                report.files_failed += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;
    use waitline_core::observation::{parse_observed_at, Observation, WaitTimeType};

    fn obs(entity: &str, at: &str, minutes: i32) -> Observation {
        Observation::new(
            entity,
            parse_observed_at(at).unwrap(),
            WaitTimeType::Posted,
            minutes,
        )
    }

    fn write_staging(layout: &RootLayout, park: &str, date: NaiveDate, rows: &[Observation]) {
        let path = layout.staging_file(park, date);
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        let file = std::fs::File::create(&path).expect("create");
        csvio::write_fact_rows(file, rows).expect("write");
    }

    #[test]
    fn merge_unions_staging_with_existing_facts() {
        let dir = TempDir::new().expect("tempdir");
        let layout = RootLayout::new(dir.path());
        let dedup = DedupSet::in_memory().expect("dedup");
        let index = EntityIndex::in_memory().expect("index");
        let date = NaiveDate::from_ymd_opt(2026, 1, 26).unwrap();

        // Two rows already canonical.
        let existing = vec![
            obs("MK101", "2026-01-26T09:00:00-05:00", 10),
            obs("MK101", "2026-01-26T09:05:00-05:00", 15),
        ];
        {
            let mut writer = CanonicalWriter::new(&layout, &dedup, &index);
            writer.push_batch(existing.clone()).expect("push");
            writer.finish().expect("finish");
        }

        // Staging holds five new rows plus the two already present.
        let mut staged = vec![
            obs("MK101", "2026-01-26T10:00:00-05:00", 20),
            obs("MK101", "2026-01-26T10:05:00-05:00", 25),
            obs("MK101", "2026-01-26T10:10:00-05:00", 30),
            obs("MK101", "2026-01-26T10:15:00-05:00", 35),
            obs("MK101", "2026-01-26T10:20:00-05:00", 40),
        ];
        staged.extend(existing);
        write_staging(&layout, "mk", date, &staged);

        let report = merge_staging_for_date(&layout, &dedup, &index, date).expect("merge");
        assert_eq!(report.files_merged, 1);
        assert_eq!(report.write.total_written(), 5);
        assert_eq!(report.write.duplicates, 2);

        // Fact file holds the dedupped union; staging file is gone.
        let rows = csvio::read_fact_file(&layout.fact_file("mk", date)).expect("read");
        assert_eq!(rows.len(), 7);
        assert!(!layout.staging_file("mk", date).exists());
    }

    #[test]
    fn merge_twice_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let layout = RootLayout::new(dir.path());
        let dedup = DedupSet::in_memory().expect("dedup");
        let index = EntityIndex::in_memory().expect("index");
        let date = NaiveDate::from_ymd_opt(2026, 1, 26).unwrap();

        let staged = vec![obs("MK101", "2026-01-26T10:00:00-05:00", 20)];
        write_staging(&layout, "mk", date, &staged);
        merge_staging_for_date(&layout, &dedup, &index, date).expect("first");

        // Re-stage the identical rows: the dedup set absorbs them.
        write_staging(&layout, "mk", date, &staged);
        let second = merge_staging_for_date(&layout, &dedup, &index, date).expect("second");
        assert_eq!(second.write.total_written(), 0);
        assert_eq!(second.write.duplicates, 1);

        let rows = csvio::read_fact_file(&layout.fact_file("mk", date)).expect("read");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn unreadable_staging_file_is_kept() {
        let dir = TempDir::new().expect("tempdir");
        let layout = RootLayout::new(dir.path());
        let dedup = DedupSet::in_memory().expect("dedup");
        let index = EntityIndex::in_memory().expect("index");
        let date = NaiveDate::from_ymd_opt(2026, 1, 26).unwrap();

        let path = layout.staging_file("mk", date);
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(&path, b"entity_code,observed_at,wait_time_type,wait_time_minutes\nbroken row\n")
            .expect("write");

        let report = merge_staging_for_date(&layout, &dedup, &index, date).expect("merge");
        assert_eq!(report.files_failed, 1);
        assert!(!report.is_clean());
        assert!(path.exists());
    }

    #[test]
    fn only_matching_date_files_are_merged() {
        let dir = TempDir::new().expect("tempdir");
        let layout = RootLayout::new(dir.path());
        let dedup = DedupSet::in_memory().expect("dedup");
        let index = EntityIndex::in_memory().expect("index");
        let target = NaiveDate::from_ymd_opt(2026, 1, 26).unwrap();
        let other = NaiveDate::from_ymd_opt(2026, 1, 25).unwrap();

        write_staging(&layout, "mk", target, &[obs("MK101", "2026-01-26T10:00:00-05:00", 20)]);
        write_staging(&layout, "mk", other, &[obs("MK101", "2026-01-25T10:00:00-05:00", 20)]);

        let report = merge_staging_for_date(&layout, &dedup, &index, target).expect("merge");
        assert_eq!(report.files_merged, 1);
        assert!(layout.staging_file("mk", other).exists());
        assert!(!layout.staging_file("mk", target).exists());
    }
}
