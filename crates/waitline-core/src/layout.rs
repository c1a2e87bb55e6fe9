//! Typed paths under the pipeline output root.
//!
//! Every component receives a [`RootLayout`] handle instead of discovering
//! the output base ambiently. The sub-areas are created lazily by the
//! writers that own them.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::parkdate::month_folder;

/// Handle to the shared filesystem root and its sub-areas.
#[derive(Debug, Clone)]
pub struct RootLayout {
    base: PathBuf,
}

impl RootLayout {
    /// Creates a layout rooted at `base`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The output root itself.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `fact/clean/` — the canonical partitioned store.
    #[must_use]
    pub fn fact_clean(&self) -> PathBuf {
        self.base.join("fact").join("clean")
    }

    /// `staging/live/` — live poller output, merged each morning.
    #[must_use]
    pub fn staging_live(&self) -> PathBuf {
        self.base.join("staging").join("live")
    }

    /// `state/` — catalogs, tallies, locks, dedup and index databases.
    #[must_use]
    pub fn state(&self) -> PathBuf {
        self.base.join("state")
    }

    /// `models/{entity_code}/` — per-entity model artifacts.
    #[must_use]
    pub fn models(&self, entity_code: &str) -> PathBuf {
        self.base.join("models").join(entity_code)
    }

    /// `aggregates/` — columnar aggregate outputs.
    #[must_use]
    pub fn aggregates(&self) -> PathBuf {
        self.base.join("aggregates")
    }

    /// `curves/forecast/` or `curves/backfill/`.
    #[must_use]
    pub fn curves(&self, kind: CurveKind) -> PathBuf {
        self.base.join("curves").join(kind.as_str())
    }

    /// `wti/` — Wait Time Index output.
    #[must_use]
    pub fn wti(&self) -> PathBuf {
        self.base.join("wti")
    }

    /// `reports/` — rendered report output (written by external tooling).
    #[must_use]
    pub fn reports(&self) -> PathBuf {
        self.base.join("reports")
    }

    /// `logs/` — per-run log files.
    #[must_use]
    pub fn logs(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// `dimension_tables/` — externally produced dimension CSVs.
    #[must_use]
    pub fn dimension_tables(&self) -> PathBuf {
        self.base.join("dimension_tables")
    }

    /// `config/` — shipped configuration tables (ride-id mapping).
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.base.join("config")
    }

    /// The canonical fact file for one `(park, park_date)` partition.
    #[must_use]
    pub fn fact_file(&self, park_code: &str, date: NaiveDate) -> PathBuf {
        self.fact_clean()
            .join(month_folder(date))
            .join(format!("{park_code}_{date}.csv"))
    }

    /// The staging file for one `(park, park_date)` partition.
    #[must_use]
    pub fn staging_file(&self, park_code: &str, date: NaiveDate) -> PathBuf {
        self.staging_live()
            .join(month_folder(date))
            .join(format!("{park_code}_{date}.csv"))
    }

    /// A curve file for one `(entity, park_date)`.
    #[must_use]
    pub fn curve_file(&self, kind: CurveKind, entity_code: &str, date: NaiveDate) -> PathBuf {
        self.curves(kind).join(format!("{entity_code}_{date}.csv"))
    }

    /// The pipeline lock file.
    #[must_use]
    pub fn pipeline_lock(&self) -> PathBuf {
        self.state().join("pipeline.lock")
    }

    /// The live poller lock file.
    #[must_use]
    pub fn queue_times_lock(&self) -> PathBuf {
        self.state().join("queue_times.lock")
    }

    /// The pipeline status record.
    #[must_use]
    pub fn pipeline_status(&self) -> PathBuf {
        self.state().join("pipeline_status.json")
    }

    /// The processed-file catalog.
    #[must_use]
    pub fn processed_files(&self) -> PathBuf {
        self.state().join("processed_files.json")
    }

    /// The failure tally.
    #[must_use]
    pub fn failed_files(&self) -> PathBuf {
        self.state().join("failed_files.json")
    }

    /// The canonical dedup database.
    #[must_use]
    pub fn dedup_db(&self) -> PathBuf {
        self.state().join("dedupe.sqlite")
    }

    /// The live poller's private dedup database.
    #[must_use]
    pub fn queue_times_dedup_db(&self) -> PathBuf {
        self.state().join("dedupe_queue_times.sqlite")
    }

    /// The entity index database.
    #[must_use]
    pub fn entity_index_db(&self) -> PathBuf {
        self.state().join("entity_index.sqlite")
    }

    /// The persistent categorical encoding map.
    #[must_use]
    pub fn encoding_mappings(&self) -> PathBuf {
        self.state().join("encoding_mappings.json")
    }

    /// The posted aggregates parquet file.
    #[must_use]
    pub fn posted_aggregates(&self) -> PathBuf {
        self.aggregates().join("posted_aggregates.parquet")
    }

    /// The WTI parquet file.
    #[must_use]
    pub fn wti_file(&self) -> PathBuf {
        self.wti().join("wti.parquet")
    }
}

/// Which curve family a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveKind {
    /// Forward-looking predictions for future dates.
    Forecast,
    /// Historical observed/imputed curves.
    Backfill,
}

impl CurveKind {
    /// Directory segment for this curve kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Forecast => "forecast",
            Self::Backfill => "backfill",
        }
    }
}
