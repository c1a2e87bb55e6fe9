//! # waitline-cli
//!
//! Command-line interface for the Waitline pipeline.
//!
//! ## Commands
//!
//! - `waitline ingest` - Morning merge plus incremental historical ingest
//! - `waitline merge-staging` - Merge staged live rows on their own
//! - `waitline index rebuild` - Rebuild the entity index from the facts
//! - `waitline train-batch` - Train every entity needing modeling
//! - `waitline train-entity` - Train one entity
//! - `waitline build-posted-aggregates` - Rebuild the POSTED medians
//! - `waitline forecast` - Generate forecast curves
//! - `waitline backfill` - Generate backfill curves for a date range
//! - `waitline wti` - Compute the Wait Time Index
//! - `waitline poll-live` - Run the live queue-times poller
//!
//! ## Exit codes
//!
//! `0` success · `1` validation or pipeline step failed · `2` lock
//! contention · `3` fatal configuration error.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use waitline_core::PipelineConfig;

/// Waitline - wait-time pipeline command-line interface.
#[derive(Debug, Parser)]
#[command(name = "waitline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (JSON).
    #[arg(long, env = "WAITLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output root override.
    #[arg(long, env = "WAITLINE_OUTPUT_BASE")]
    pub output_base: Option<PathBuf>,

    /// Source mirror root override.
    #[arg(long, env = "WAITLINE_SOURCE_ROOT")]
    pub source_root: Option<PathBuf>,

    /// Emit JSON logs instead of pretty logs.
    #[arg(long)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Resolves the effective configuration: file, then flag overrides.
    ///
    /// # Errors
    ///
    /// Returns a configuration error (exit code 3) if the file is
    /// unreadable or invalid.
    pub fn resolve_config(&self) -> waitline_core::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(base) = &self.output_base {
            config.output_base.clone_from(base);
        }
        if let Some(root) = &self.source_root {
            config.source_root.clone_from(root);
        }
        config.validate()?;
        Ok(config)
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Merge yesterday's staging, then ingest new historical files.
    Ingest(commands::ingest::IngestArgs),
    /// Merge staged live rows without running the ingest.
    MergeStaging(commands::merge::MergeArgs),
    /// Entity index maintenance.
    Index(commands::index::IndexArgs),
    /// Train every entity needing modeling.
    TrainBatch(commands::train::TrainBatchArgs),
    /// Train a single entity.
    TrainEntity(commands::train::TrainEntityArgs),
    /// Rebuild the posted aggregates table.
    BuildPostedAggregates(commands::aggregates::AggregatesArgs),
    /// Generate forecast curves for future dates.
    Forecast(commands::curves::ForecastArgs),
    /// Generate backfill curves for a historical date range.
    Backfill(commands::curves::BackfillArgs),
    /// Compute the Wait Time Index.
    Wti(commands::wti::WtiArgs),
    /// Run the live queue-times poller.
    PollLive(commands::poll::PollLiveArgs),
}
