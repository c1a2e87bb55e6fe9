//! Batch training orchestration.
//!
//! The work list comes from the entity index; entities sort WDW parks
//! first (`mk, ep, hs, ak`), then by target observation count descending.
//! Training fans out over an in-process worker pool bounded by
//! `min(cpus, ⌊0.8 · available_ram / per_worker_ram⌋, cap)`; each entity
//! has a one-hour hard ceiling, after which its task is abandoned and
//! recorded `TIMEOUT`. Failures never abort the batch.
//!
//! Workers read fact partitions and write only their own
//! `models/{entity}/` directory; the entity index and the pipeline status
//! are updated by the orchestrator alone as results arrive.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waitline_core::status::StatusFile;
use waitline_core::RootLayout;
use waitline_store::{EntityIndex, ModelingCandidate};

use crate::curves::artifact_names;
use crate::dimensions::Dimensions;
use crate::encoding::EncodingMap;
use crate::error::{ModelError, Result};
use crate::features::{build_table, TargetKind};
use crate::trainer::{
    BoostedTreeTrainer, Hyperparams, MeanModel, RegressorTrainer, TrainedArtifact, TrainingData,
};

/// WDW park tier trained first.
const PARK_PRIORITY: [&str; 4] = ["mk", "ep", "hs", "ak"];

/// Hard per-entity training ceiling.
pub const ENTITY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Options for a batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Defer entities whose newest observation is younger than this.
    pub min_age_hours: f64,
    /// Minimum target observations for a boosted model.
    pub min_observations: u64,
    /// Worker override; `None` sizes from the machine.
    pub workers: Option<usize>,
    /// Upper bound on workers.
    pub workers_cap: usize,
    /// Estimated resident memory per worker, in gigabytes.
    pub per_worker_ram_gb: f64,
    /// Fail the run (exit non-zero) if any entity failed.
    pub stop_on_error: bool,
    /// Optional cap on rows per entity (newest kept).
    pub sample: Option<usize>,
    /// Boosting hyperparameters.
    pub hyperparams: Hyperparams,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            min_age_hours: 0.0,
            min_observations: 500,
            workers: None,
            workers_cap: 16,
            per_worker_ram_gb: 2.0,
            stop_on_error: false,
            sample: None,
            hyperparams: Hyperparams::default(),
        }
    }
}

/// How one entity's training ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    /// Boosted model(s) trained and persisted.
    Trained,
    /// Too few observations; mean model recorded.
    MeanModel,
    /// Training failed.
    Failed {
        /// The error text.
        error: String,
    },
    /// The one-hour ceiling was hit.
    Timeout,
}

/// One entity's batch outcome.
#[derive(Debug, Clone)]
pub struct EntityOutcome {
    /// The entity.
    pub entity_code: String,
    /// How it ended.
    pub status: EntityStatus,
    /// Wall-clock training time.
    pub elapsed: Duration,
}

/// The batch result.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Per-entity outcomes in completion order.
    pub outcomes: Vec<EntityOutcome>,
}

impl BatchOutcome {
    /// Entities that trained (boosted or mean).
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, EntityStatus::Trained | EntityStatus::MeanModel))
            .count()
    }

    /// Entities that failed or timed out.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Training metadata persisted beside the artifacts.
#[derive(Debug, Serialize, Deserialize)]
struct TrainingMetadata {
    entity_code: String,
    target: String,
    variants: Vec<String>,
    feature_names: Vec<String>,
    rows_total: usize,
    rows_train: usize,
    rows_val: usize,
    rows_test: usize,
    window_start: Option<String>,
    window_end: Option<String>,
    val_mae_without_posted: Option<f64>,
    val_mae_with_posted: Option<f64>,
    trained_at: DateTime<Utc>,
}

/// Sorts candidates: WDW tier first, then target count descending.
#[must_use]
pub fn priority_sort(mut candidates: Vec<ModelingCandidate>) -> Vec<ModelingCandidate> {
    let tier = |entity_code: &str| {
        let park = waitline_core::park_code_for_entity(entity_code);
        PARK_PRIORITY
            .iter()
            .position(|p| *p == park)
            .unwrap_or(PARK_PRIORITY.len())
    };
    candidates.sort_by(|a, b| {
        let target_a = a.actual_count.max(a.priority_count);
        let target_b = b.actual_count.max(b.priority_count);
        tier(&a.entity_code)
            .cmp(&tier(&b.entity_code))
            .then(target_b.cmp(&target_a))
            .then(a.entity_code.cmp(&b.entity_code))
    });
    candidates
}

/// Sizes the worker pool from CPUs and available memory.
#[must_use]
pub fn worker_count(cap: usize, per_worker_ram_gb: f64) -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let by_ram = available_ram_gb().map_or(cpus, |gb| {
        ((gb * 0.8) / per_worker_ram_gb).floor().max(1.0) as usize
    });
    cpus.min(by_ram).min(cap).max(1)
}

/// Available system memory in GiB, from `/proc/meminfo`.
fn available_ram_gb() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: f64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / (1024.0 * 1024.0));
        }
    }
    None
}

/// Trains one entity and persists its artifacts.
///
/// # Errors
///
/// Returns an error if the entity's data or artifacts are unusable.
pub fn train_entity(
    layout: &RootLayout,
    dims: &Dimensions,
    encoding: &Mutex<EncodingMap>,
    entity_code: &str,
    options: &BatchOptions,
) -> Result<EntityStatus> {
    let span = waitline_core::observability::modeling_span("train", entity_code);
    let _guard = span.enter();

    let mut rows = EntityIndex::load_entity_rows(layout, entity_code)?;
    if let Some(sample) = options.sample {
        if rows.len() > sample {
            rows.drain(..rows.len() - sample);
        }
    }
    let target = TargetKind::for_entity(dims.has_priority_queue(entity_code));
    let as_of = Utc::now();

    let target_rows = rows
        .iter()
        .filter(|r| r.wait_time_type == target.wait_type())
        .count();
    if target_rows == 0 {
        return Err(ModelError::insufficient(format!(
            "{entity_code} has no {} observations",
            target.wait_type()
        )));
    }

    let model_dir = layout.models(entity_code);
    std::fs::create_dir_all(&model_dir).map_err(waitline_core::Error::from)?;

    if (target_rows as u64) < options.min_observations {
        // Mean model: metadata only, no boosted training.
        let table = {
            let mut enc = encoding.lock().map_err(|_| ModelError::artifact("poisoned lock"))?;
            let table = build_table(&rows, dims, &mut enc, entity_code, target, false, as_of)?;
            enc.save()?;
            table
        };
        let mean = MeanModel::fit(&table.target, &table.weights);
        TrainedArtifact::Mean(mean).save(&model_dir.join(artifact_names::MEAN))?;
        write_metadata(
            &model_dir,
            &TrainingMetadata {
                entity_code: entity_code.to_string(),
                target: target.wait_type().to_string(),
                variants: vec!["mean".into()],
                feature_names: Vec::new(),
                rows_total: table.len(),
                rows_train: 0,
                rows_val: 0,
                rows_test: 0,
                window_start: table.park_dates.iter().min().map(ToString::to_string),
                window_end: table.park_dates.iter().max().map(ToString::to_string),
                val_mae_without_posted: None,
                val_mae_with_posted: None,
                trained_at: as_of,
            },
        )?;
        tracing::info!(rows = table.len(), "mean model recorded");
        return Ok(EntityStatus::MeanModel);
    }

    let trainer = BoostedTreeTrainer;
    let mut variants = vec!["without_posted".to_string()];
    let mut val_mae_with = None;

    // Without-POSTED variant (all targets).
    let (metadata_names, counts, window, val_mae_without) = {
        let mut enc = encoding.lock().map_err(|_| ModelError::artifact("poisoned lock"))?;
        let table = build_table(&rows, dims, &mut enc, entity_code, target, false, as_of)?;
        enc.save()?;
        let (train_idx, val_idx, test_idx) = table.chronological_split(0.7, 0.15);
        let data = TrainingData {
            matrix: &table.matrix,
            n_features: table.feature_names.len(),
            target: &table.target,
            weights: &table.weights,
            train_idx: &train_idx,
            val_idx: &val_idx,
        };
        let artifact = trainer.train(&data, &options.hyperparams)?;
        let val_mae = artifact.mae(&data, &val_idx);
        artifact.save(&model_dir.join(artifact_names::WITHOUT_POSTED))?;
        (
            table.feature_names.clone(),
            (table.len(), train_idx.len(), val_idx.len(), test_idx.len()),
            (
                table.park_dates.iter().min().map(ToString::to_string),
                table.park_dates.iter().max().map(ToString::to_string),
            ),
            val_mae,
        )
    };

    // With-POSTED variant (ACTUAL targets only).
    if target == TargetKind::Actual {
        let mut enc = encoding.lock().map_err(|_| ModelError::artifact("poisoned lock"))?;
        let table = build_table(&rows, dims, &mut enc, entity_code, target, true, as_of)?;
        enc.save()?;
        let (train_idx, val_idx, _) = table.chronological_split(0.7, 0.15);
        let data = TrainingData {
            matrix: &table.matrix,
            n_features: table.feature_names.len(),
            target: &table.target,
            weights: &table.weights,
            train_idx: &train_idx,
            val_idx: &val_idx,
        };
        let artifact = trainer.train(&data, &options.hyperparams)?;
        val_mae_with = artifact.mae(&data, &val_idx);
        artifact.save(&model_dir.join(artifact_names::WITH_POSTED))?;
        variants.push("with_posted".to_string());
    }

    write_metadata(
        &model_dir,
        &TrainingMetadata {
            entity_code: entity_code.to_string(),
            target: target.wait_type().to_string(),
            variants,
            feature_names: metadata_names,
            rows_total: counts.0,
            rows_train: counts.1,
            rows_val: counts.2,
            rows_test: counts.3,
            window_start: window.0,
            window_end: window.1,
            val_mae_without_posted: val_mae_without,
            val_mae_with_posted: val_mae_with,
            trained_at: as_of,
        },
    )?;
    tracing::info!(rows = counts.0, "boosted model trained");
    Ok(EntityStatus::Trained)
}

fn write_metadata(model_dir: &Path, metadata: &TrainingMetadata) -> Result<()> {
    waitline_core::atomic::write_json_replace(
        &model_dir.join(artifact_names::METADATA),
        metadata,
    )
    .map_err(ModelError::Core)
}

/// Runs the training batch.
///
/// # Errors
///
/// Returns an error only for setup failures; per-entity failures land in
/// the outcome.
pub async fn train_batch(
    layout: &RootLayout,
    index: &EntityIndex,
    dims: Arc<Dimensions>,
    options: BatchOptions,
) -> Result<BatchOutcome> {
    let candidates = priority_sort(
        index.list_for_modeling(options.min_age_hours, options.min_observations)?,
    );
    let total = candidates.len();
    tracing::info!(total, "entities selected for modeling");

    let status = StatusFile::new(layout.pipeline_status());
    status.update(|s| {
        s.entities_total = total;
        s.entities_done = 0;
    })?;

    let workers = options
        .workers
        .unwrap_or_else(|| worker_count(options.workers_cap, options.per_worker_ram_gb))
        .max(1);
    tracing::info!(workers, "worker pool sized");

    let encoding = Arc::new(Mutex::new(EncodingMap::load(&layout.encoding_mappings())?));
    let semaphore = Arc::new(tokio::sync::Semaphore::new(workers));
    let mut handles = Vec::with_capacity(total);

    for candidate in candidates {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ModelError::artifact(e))?;
        let layout = layout.clone();
        let dims = Arc::clone(&dims);
        let encoding = Arc::clone(&encoding);
        let options = options.clone();
        let entity_code = candidate.entity_code.clone();

        let status_handle = status.clone();
        let _ = status_handle.update(|s| {
            s.current_entity = Some(entity_code.clone());
        });

        handles.push(tokio::spawn(async move {
            let started = std::time::Instant::now();
            let entity = entity_code.clone();
            let work = tokio::task::spawn_blocking(move || {
                train_entity(&layout, &dims, &encoding, &entity, &options)
            });
            let status = match tokio::time::timeout(ENTITY_TIMEOUT, work).await {
                Ok(Ok(Ok(status))) => status,
                Ok(Ok(Err(e))) => EntityStatus::Failed {
                    error: e.to_string(),
                },
                Ok(Err(join_error)) => EntityStatus::Failed {
                    error: format!("worker panicked: {join_error}"),
                },
                Err(_) => EntityStatus::Timeout,
            };
            drop(permit);
            EntityOutcome {
                entity_code,
                status,
                elapsed: started.elapsed(),
            }
        }));
    }

    let mut outcome = BatchOutcome::default();
    for handle in handles {
        let entity_outcome = handle.await.map_err(|e| ModelError::artifact(e))?;
        match &entity_outcome.status {
            EntityStatus::Trained | EntityStatus::MeanModel => {
                index.mark_modeled(&entity_outcome.entity_code, Utc::now())?;
            }
            EntityStatus::Failed { error } => {
                tracing::error!(
                    entity = entity_outcome.entity_code,
                    error,
                    "entity training failed"
                );
            }
            EntityStatus::Timeout => {
                tracing::error!(
                    entity = entity_outcome.entity_code,
                    "entity training timed out"
                );
            }
        }
        let done = outcome.outcomes.len() + 1;
        let _ = status.update(|s| {
            s.entities_done = done;
            s.current_entity = None;
        });
        outcome.outcomes.push(entity_outcome);
    }

    tracing::info!(
        succeeded = outcome.succeeded(),
        failed = outcome.failed(),
        "batch complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::{ParkHours, ParkHoursLookup};
    use tempfile::TempDir;
    use waitline_core::observation::{parse_observed_at, Observation, WaitTimeType};
    use waitline_store::csvio;

    fn candidate(entity: &str, actual: u64) -> ModelingCandidate {
        ModelingCandidate {
            entity_code: entity.into(),
            latest_observed_at: "2026-01-01T00:00:00+00:00".into(),
            last_modeled_at: None,
            actual_count: actual,
            priority_count: 0,
        }
    }

    #[test]
    fn priority_sort_wdw_first_then_count() {
        let sorted = priority_sort(vec![
            candidate("TDL05", 9000),
            candidate("EP09", 100),
            candidate("MK101", 50),
            candidate("MK102", 800),
        ]);
        let codes: Vec<&str> = sorted.iter().map(|c| c.entity_code.as_str()).collect();
        assert_eq!(codes, vec!["MK102", "MK101", "EP09", "TDL05"]);
    }

    #[test]
    fn worker_count_is_bounded() {
        let n = worker_count(16, 2.0);
        assert!(n >= 1);
        assert!(n <= 16);
        assert_eq!(worker_count(1, 2.0), 1);
    }

    fn seed_entity(layout: &RootLayout, entity: &str, days: u32, per_day: u32) {
        for day in 1..=days {
            let date = chrono::NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
            let mut rows = Vec::new();
            for i in 0..per_day {
                let hour = 9 + (i % 12);
                let minute = (i * 7) % 60;
                rows.push(Observation::new(
                    entity,
                    parse_observed_at(&format!(
                        "2024-01-{day:02}T{hour:02}:{minute:02}:00-05:00"
                    ))
                    .unwrap(),
                    WaitTimeType::Actual,
                    i32::try_from(10 + hour * 2).unwrap(),
                ));
                rows.push(Observation::new(
                    entity,
                    parse_observed_at(&format!(
                        "2024-01-{day:02}T{hour:02}:{minute:02}:30-05:00"
                    ))
                    .unwrap(),
                    WaitTimeType::Posted,
                    i32::try_from(15 + hour * 2).unwrap(),
                ));
            }
            rows.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
            let path = layout.fact_file("mk", date);
            std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
            let file = std::fs::File::create(&path).expect("create");
            csvio::write_fact_rows(file, &rows).expect("write");
        }
    }

    fn dims_for_january() -> Dimensions {
        let mut dims = Dimensions::default();
        let mut lookup = ParkHoursLookup::default();
        for day in 1..=31 {
            let date = chrono::NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
            dims.dategroup.insert(date, i64::from(day % 7));
            dims.season.insert(date, ("WINTER".into(), 2024));
            lookup.insert(
                "mk",
                date,
                ParkHours {
                    open_minutes: 9 * 60,
                    close_minutes: 21 * 60,
                    emh_morning: false,
                    emh_evening: false,
                },
            );
        }
        dims.park_hours = lookup;
        dims
    }

    #[test]
    fn small_entity_gets_mean_model() {
        let dir = TempDir::new().expect("tempdir");
        let layout = RootLayout::new(dir.path());
        seed_entity(&layout, "MK101", 3, 4);
        let dims = dims_for_january();
        let encoding =
            Mutex::new(EncodingMap::load(&layout.encoding_mappings()).expect("encoding"));
        let options = BatchOptions::default();

        let status = train_entity(&layout, &dims, &encoding, "MK101", &options).expect("train");
        assert_eq!(status, EntityStatus::MeanModel);
        assert!(layout.models("MK101").join(artifact_names::MEAN).exists());
        assert!(!layout
            .models("MK101")
            .join(artifact_names::WITHOUT_POSTED)
            .exists());
        assert!(layout.models("MK101").join(artifact_names::METADATA).exists());
    }

    #[test]
    fn large_entity_trains_both_variants() {
        let dir = TempDir::new().expect("tempdir");
        let layout = RootLayout::new(dir.path());
        // 20 days × 30 rows = 600 ACTUAL observations.
        seed_entity(&layout, "MK101", 20, 30);
        let dims = dims_for_january();
        let encoding =
            Mutex::new(EncodingMap::load(&layout.encoding_mappings()).expect("encoding"));
        let options = BatchOptions {
            hyperparams: Hyperparams {
                rounds: 5,
                max_depth: 3,
                learning_rate: 0.3,
                subsample: 1.0,
                min_child_weight: 1.0,
            },
            ..BatchOptions::default()
        };

        let status = train_entity(&layout, &dims, &encoding, "MK101", &options).expect("train");
        assert_eq!(status, EntityStatus::Trained);
        let model_dir = layout.models("MK101");
        assert!(model_dir.join(artifact_names::WITHOUT_POSTED).exists());
        assert!(model_dir.join(artifact_names::WITH_POSTED).exists());

        let metadata: TrainingMetadata = serde_json::from_slice(
            &std::fs::read(model_dir.join(artifact_names::METADATA)).expect("read"),
        )
        .expect("decode");
        assert_eq!(metadata.target, "ACTUAL");
        assert_eq!(metadata.variants, vec!["without_posted", "with_posted"]);
        assert_eq!(metadata.rows_total, 600);
    }

    #[tokio::test]
    async fn batch_marks_entities_modeled() {
        let dir = TempDir::new().expect("tempdir");
        let layout = RootLayout::new(dir.path());
        seed_entity(&layout, "MK101", 3, 4);
        let index = EntityIndex::open(&layout.entity_index_db()).expect("index");
        index.rebuild(&layout).expect("rebuild");
        assert_eq!(index.list_for_modeling(0.0, 1).expect("list").len(), 1);

        let dims = Arc::new(dims_for_january());
        let options = BatchOptions {
            workers: Some(2),
            min_observations: 1,
            ..BatchOptions::default()
        };
        let outcome = train_batch(&layout, &index, dims, options).await.expect("batch");
        assert_eq!(outcome.outcomes.len(), 1);
        assert_eq!(outcome.succeeded(), 1);

        // Modeled entities drop off the work list.
        assert!(index.list_for_modeling(0.0, 1).expect("list").is_empty());
        let record = index.get("MK101").expect("get").expect("present");
        assert!(record.last_modeled_at.is_some());
    }
}
