//! The shared pipeline status record.
//!
//! `state/pipeline_status.json` is the single place a run reports progress:
//! per-step state, the first error per step, and training progress. Writes
//! are write-replace with a monotonic generation number; readers (the
//! dashboard) may observe an older generation but never a torn file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic::{read_json, write_json_replace};
use crate::error::{Error, Result};

/// Ordered pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Morning merge plus historical ingest.
    Etl,
    /// External dimension refresh.
    Dimensions,
    /// Posted aggregate build.
    Aggregates,
    /// Report rendering (external).
    Report,
    /// Per-entity model training.
    Training,
    /// Forecast curve generation.
    Forecast,
    /// Wait Time Index computation.
    Wti,
}

impl Step {
    /// All steps in execution order.
    pub const ORDER: [Self; 7] = [
        Self::Etl,
        Self::Dimensions,
        Self::Aggregates,
        Self::Report,
        Self::Training,
        Self::Forecast,
        Self::Wti,
    ];

    /// Step name as it appears in the status file.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Etl => "etl",
            Self::Dimensions => "dimensions",
            Self::Aggregates => "aggregates",
            Self::Report => "report",
            Self::Training => "training",
            Self::Forecast => "forecast",
            Self::Wti => "wti",
        }
    }
}

/// State of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Not yet started this run.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Done,
    /// Terminated with an error.
    Failed,
}

/// One step's record in the status file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepRecord {
    /// Current state.
    pub state: StepState,
    /// First error text recorded for this step, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The pipeline status record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// When the current run started.
    pub started_at: DateTime<Utc>,
    /// Per-step states keyed by step name.
    pub steps: std::collections::BTreeMap<String, StepRecord>,
    /// Entity currently being trained, if the training step is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_entity: Option<String>,
    /// Entities completed in the training step.
    pub entities_done: usize,
    /// Total entities selected for the training step.
    pub entities_total: usize,
    /// Monotonic write generation.
    pub generation: u64,
    /// When the record was last written.
    pub last_updated: DateTime<Utc>,
}

impl PipelineStatus {
    /// A fresh record with every step pending.
    #[must_use]
    pub fn begin_run() -> Self {
        let now = Utc::now();
        let steps = Step::ORDER
            .iter()
            .map(|s| (s.as_str().to_string(), StepRecord::default()))
            .collect();
        Self {
            started_at: now,
            steps,
            current_entity: None,
            entities_done: 0,
            entities_total: 0,
            generation: 0,
            last_updated: now,
        }
    }

    /// Returns the record for `step`, creating it if absent.
    pub fn step_mut(&mut self, step: Step) -> &mut StepRecord {
        self.steps.entry(step.as_str().to_string()).or_default()
    }

    /// Marks a step running.
    pub fn start_step(&mut self, step: Step) {
        let record = self.step_mut(step);
        record.state = StepState::Running;
        record.error = None;
    }

    /// Marks a step done.
    pub fn finish_step(&mut self, step: Step) {
        self.step_mut(step).state = StepState::Done;
    }

    /// Marks a step failed, keeping the first error text.
    pub fn fail_step(&mut self, step: Step, error: impl Into<String>) {
        let record = self.step_mut(step);
        record.state = StepState::Failed;
        if record.error.is_none() {
            record.error = Some(error.into());
        }
    }
}

/// Handle to the on-disk status record.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    /// Creates a handle for the status file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the current record, or `None` if no run has written one.
    ///
    /// # Errors
    ///
    /// Returns a storage error on read failure. A corrupt file reads as
    /// `None` — consumers treat missing/stale status as "unknown".
    pub fn load(&self) -> Result<Option<PipelineStatus>> {
        match read_json::<PipelineStatus>(&self.path) {
            Ok(status) => Ok(Some(status)),
            Err(Error::NotFound(_) | Error::Serialization { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Loads, applies `update`, bumps the generation, and writes back.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub fn update(&self, update: impl FnOnce(&mut PipelineStatus)) -> Result<PipelineStatus> {
        let mut status = self.load()?.unwrap_or_else(PipelineStatus::begin_run);
        update(&mut status);
        status.generation += 1;
        status.last_updated = Utc::now();
        write_json_replace(&self.path, &status)?;
        Ok(status)
    }

    /// Resets the record for a new run and writes it.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub fn begin_run(&self) -> Result<PipelineStatus> {
        let previous_generation = self.load()?.map_or(0, |s| s.generation);
        let mut status = PipelineStatus::begin_run();
        status.generation = previous_generation + 1;
        write_json_replace(&self.path, &status)?;
        Ok(status)
    }
}
