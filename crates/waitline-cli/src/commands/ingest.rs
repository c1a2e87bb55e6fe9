//! `waitline ingest` - the daily ETL step.
//!
//! Acquires the pipeline lock, merges yesterday's staged live rows, then
//! runs the incremental historical ingest. Both phases report through the
//! `etl` step of the pipeline status record.

use clap::Args;

use waitline_core::status::{StatusFile, Step};
use waitline_core::{PipelineConfig, RootLayout};
use waitline_ingest::{merge_yesterday_staging, FsSourceStore, IngestOptions, Ingestor};
use waitline_store::{DedupSet, EntityIndex};

/// Arguments for `waitline ingest`.
#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Reprocess everything: ignore the processed catalog and clear the
    /// dedup set.
    #[arg(long)]
    pub full_rebuild: bool,

    /// Comma-separated property scopes (default: all).
    #[arg(long)]
    pub scopes: Option<String>,

    /// Row batch size override.
    #[arg(long)]
    pub chunksize: Option<usize>,
}

/// Runs the command.
///
/// # Errors
///
/// Returns lock contention, a failed merge step, or store failures.
pub async fn execute(
    args: IngestArgs,
    config: &PipelineConfig,
    layout: &RootLayout,
) -> anyhow::Result<()> {
    let _lock = super::acquire_pipeline_lock(layout, "ingest")?;
    let status = StatusFile::new(layout.pipeline_status());
    status.begin_run()?;
    status.update(|s| s.start_step(Step::Etl))?;

    let dedup = DedupSet::open(&layout.dedup_db())?;
    let index = EntityIndex::open(&layout.entity_index_db())?;

    // Morning merge strictly precedes any new historical ingest.
    let merge_report = merge_yesterday_staging(layout, &dedup, &index)?;
    if !merge_report.is_clean() {
        status.update(|s| {
            s.fail_step(
                Step::Etl,
                format!("{} staging files failed to merge", merge_report.files_failed),
            );
        })?;
        anyhow::bail!(
            "morning merge left {} staging files unmerged",
            merge_report.files_failed
        );
    }
    println!(
        "merged {} staging files ({} rows)",
        merge_report.files_merged,
        merge_report.write.total_written()
    );

    let source = FsSourceStore::new(&config.source_root);
    let options = IngestOptions {
        properties: args.scopes.map_or_else(
            || IngestOptions::default().properties,
            |scopes| scopes.split(',').map(|s| s.trim().to_string()).collect(),
        ),
        chunksize: args.chunksize.unwrap_or(config.chunksize),
        full_rebuild: args.full_rebuild,
        fail_threshold: config.fail_threshold,
        old_days: config.old_days,
    };

    let ingestor = Ingestor::new(&source, layout, &dedup, &index);
    // A Ctrl-C abandons the run but drops back through the lock guard so
    // the next run can take over without waiting out the stale window.
    let result = tokio::select! {
        result = ingestor.run(&options) => result,
        _ = tokio::signal::ctrl_c() => {
            status.update(|s| s.fail_step(Step::Etl, "interrupted"))?;
            anyhow::bail!("interrupted");
        }
    };
    match result {
        Ok(report) => {
            status.update(|s| s.finish_step(Step::Etl))?;
            println!(
                "ingest complete: {} files processed, {} skipped, {} quarantined, {} failed",
                report.files_processed,
                report.files_skipped,
                report.files_quarantined,
                report.files_failed
            );
            println!(
                "rows written: {} posted, {} actual, {} priority ({} duplicates, {} invalid)",
                report.write.posted_written,
                report.write.actual_written,
                report.write.priority_written,
                report.write.duplicates,
                report.rows_invalid
            );
            for (park, rows) in &report.write.rows_per_park {
                println!("  {park}: {rows} rows");
            }
            Ok(())
        }
        Err(e) => {
            status.update(|s| s.fail_step(Step::Etl, e.to_string()))?;
            Err(e.into())
        }
    }
}
