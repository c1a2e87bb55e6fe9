//! `waitline merge-staging` - merge staged live rows on their own.

use chrono::NaiveDate;
use clap::Args;

use waitline_core::{PipelineConfig, RootLayout};
use waitline_ingest::merge::{merge_staging_for_date, merge_yesterday_staging};
use waitline_store::{DedupSet, EntityIndex};

/// Arguments for `waitline merge-staging`.
#[derive(Debug, Args)]
pub struct MergeArgs {
    /// Merge a specific park date instead of yesterday.
    #[arg(long)]
    pub date: Option<NaiveDate>,
}

/// Runs the command.
///
/// # Errors
///
/// Returns lock contention or merge failures.
pub fn execute(
    args: MergeArgs,
    _config: &PipelineConfig,
    layout: &RootLayout,
) -> anyhow::Result<()> {
    let _lock = super::acquire_pipeline_lock(layout, "merge-staging")?;
    let dedup = DedupSet::open(&layout.dedup_db())?;
    let index = EntityIndex::open(&layout.entity_index_db())?;

    let report = match args.date {
        Some(date) => merge_staging_for_date(layout, &dedup, &index, date)?,
        None => merge_yesterday_staging(layout, &dedup, &index)?,
    };
    println!(
        "merged {} files, {} rows ({} duplicates), {} failed",
        report.files_merged,
        report.write.total_written(),
        report.write.duplicates,
        report.files_failed
    );
    if !report.is_clean() {
        anyhow::bail!("{} staging files failed to merge", report.files_failed);
    }
    Ok(())
}
