//! `waitline train-batch` and `waitline train-entity`.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use clap::Args;

use waitline_core::status::{StatusFile, Step};
use waitline_core::{PipelineConfig, RootLayout};
use waitline_model::batch::{train_entity, EntityStatus};
use waitline_model::{train_batch, BatchOptions, Dimensions, EncodingMap};
use waitline_store::EntityIndex;

/// Arguments for `waitline train-batch`.
#[derive(Debug, Args)]
pub struct TrainBatchArgs {
    /// Defer entities with observations younger than this many hours.
    #[arg(long)]
    pub min_age_hours: Option<f64>,

    /// Minimum target observations for selection.
    #[arg(long)]
    pub min_observations: Option<u64>,

    /// Parallel workers (default: sized from the machine).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Exit non-zero if any entity failed.
    #[arg(long)]
    pub stop_on_error: bool,
}

/// Runs the batch command.
///
/// # Errors
///
/// Returns lock contention, setup failures, or (with `--stop-on-error`)
/// per-entity failures.
pub async fn execute_batch(
    args: TrainBatchArgs,
    config: &PipelineConfig,
    layout: &RootLayout,
) -> anyhow::Result<()> {
    let _lock = super::acquire_pipeline_lock(layout, "train-batch")?;
    let status = StatusFile::new(layout.pipeline_status());
    status.update(|s| s.start_step(Step::Training))?;

    let index = EntityIndex::open(&layout.entity_index_db())?;
    let dims = Arc::new(Dimensions::load(&layout.dimension_tables(), Utc::now())?);
    let options = BatchOptions {
        min_age_hours: args.min_age_hours.unwrap_or(config.min_age_hours),
        min_observations: args.min_observations.unwrap_or(config.min_observations),
        workers: args.workers,
        workers_cap: config.workers_cap,
        per_worker_ram_gb: config.per_worker_ram_gb,
        stop_on_error: args.stop_on_error,
        ..BatchOptions::default()
    };
    let stop_on_error = options.stop_on_error;

    let result = train_batch(layout, &index, dims, options).await;
    match result {
        Ok(outcome) => {
            status.update(|s| s.finish_step(Step::Training))?;
            for entity in &outcome.outcomes {
                println!(
                    "{}\t{:?}\t{:.1}s",
                    entity.entity_code,
                    entity.status,
                    entity.elapsed.as_secs_f64()
                );
            }
            println!(
                "batch complete: {} succeeded, {} failed",
                outcome.succeeded(),
                outcome.failed()
            );
            if stop_on_error && outcome.failed() > 0 {
                anyhow::bail!("{} entities failed", outcome.failed());
            }
            Ok(())
        }
        Err(e) => {
            status.update(|s| s.fail_step(Step::Training, e.to_string()))?;
            Err(e.into())
        }
    }
}

/// Arguments for `waitline train-entity`.
#[derive(Debug, Args)]
pub struct TrainEntityArgs {
    /// Entity to train.
    #[arg(long)]
    pub entity: String,

    /// Keep only the newest N rows (quick experiments).
    #[arg(long)]
    pub sample: Option<usize>,
}

/// Runs the single-entity command.
///
/// # Errors
///
/// Returns lock contention or the training failure.
pub fn execute_entity(
    args: TrainEntityArgs,
    config: &PipelineConfig,
    layout: &RootLayout,
) -> anyhow::Result<()> {
    let _lock = super::acquire_pipeline_lock(layout, "train-entity")?;
    let dims = Dimensions::load(&layout.dimension_tables(), Utc::now())?;
    let encoding = Mutex::new(EncodingMap::load(&layout.encoding_mappings())?);
    let options = BatchOptions {
        min_observations: config.min_observations,
        sample: args.sample,
        ..BatchOptions::default()
    };

    let entity = args.entity.to_uppercase();
    let outcome = train_entity(layout, &dims, &encoding, &entity, &options)?;
    let index = EntityIndex::open(&layout.entity_index_db())?;
    index.mark_modeled(&entity, Utc::now())?;
    match outcome {
        EntityStatus::Trained => println!("{entity}: boosted model trained"),
        EntityStatus::MeanModel => println!("{entity}: mean model recorded"),
        other => println!("{entity}: {other:?}"),
    }
    Ok(())
}
