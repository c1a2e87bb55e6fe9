//! `waitline build-posted-aggregates`.

use chrono::Utc;
use clap::Args;

use waitline_core::status::{StatusFile, Step};
use waitline_core::RootLayout;
use waitline_model::{build_posted_aggregates, Dimensions};

/// Arguments for `waitline build-posted-aggregates`.
#[derive(Debug, Args)]
pub struct AggregatesArgs {}

/// Runs the command.
///
/// # Errors
///
/// Returns lock contention or scan failures.
pub fn execute(_args: &AggregatesArgs, layout: &RootLayout) -> anyhow::Result<()> {
    let _lock = super::acquire_pipeline_lock(layout, "build-posted-aggregates")?;
    let status = StatusFile::new(layout.pipeline_status());
    status.update(|s| s.start_step(Step::Aggregates))?;

    let dims = Dimensions::load(&layout.dimension_tables(), Utc::now())?;
    let result = build_posted_aggregates(layout, &dims, Utc::now())
        .and_then(|aggregates| {
            aggregates.save(&layout.posted_aggregates())?;
            Ok(aggregates.len())
        });
    match result {
        Ok(groups) => {
            status.update(|s| s.finish_step(Step::Aggregates))?;
            println!(
                "posted aggregates written: {groups} groups -> {}",
                layout.posted_aggregates().display()
            );
            Ok(())
        }
        Err(e) => {
            status.update(|s| s.fail_step(Step::Aggregates, e.to_string()))?;
            Err(e.into())
        }
    }
}
