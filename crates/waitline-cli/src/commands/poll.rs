//! `waitline poll-live` - the live queue-times poller.

use std::time::Duration;

use clap::Args;

use waitline_core::{PipelineConfig, ProcessLock, RootLayout};
use waitline_ingest::{LivePoller, LivePollerOptions};

/// Arguments for `waitline poll-live`.
#[derive(Debug, Args)]
pub struct PollLiveArgs {
    /// Seconds between poll cycles.
    #[arg(long)]
    pub interval: Option<u64>,

    /// Poll every mapped park regardless of operating hours.
    #[arg(long)]
    pub no_hours_filter: bool,

    /// Run one cycle and exit.
    #[arg(long)]
    pub once: bool,
}

/// Runs the poller under its own lock.
///
/// # Errors
///
/// Returns lock contention or poller setup failures.
pub async fn execute(
    args: PollLiveArgs,
    config: &PipelineConfig,
    layout: &RootLayout,
) -> anyhow::Result<()> {
    let lock = ProcessLock::new(layout.queue_times_lock(), "poll-live");
    let _guard = lock.acquire()?;

    let options = LivePollerOptions {
        interval: Duration::from_secs(args.interval.unwrap_or(config.live_poll_interval)),
        hours_filter: !args.no_hours_filter,
        ..LivePollerOptions::default()
    };
    let poller = LivePoller::new(layout.clone(), options)?;

    if args.once {
        let report = poller.poll_once().await?;
        println!(
            "polled {} parks: {} rows staged, {} duplicates, {} unmapped rides, {} stale",
            report.parks_polled,
            report.rows_staged,
            report.duplicates,
            report.unmapped.len(),
            report.stale_records
        );
        for (ride, count) in &report.unmapped {
            println!("  unmapped: {ride} ({count} records)");
        }
        return Ok(());
    }
    poller.run().await?;
    Ok(())
}
