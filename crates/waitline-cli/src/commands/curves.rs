//! `waitline forecast` and `waitline backfill`.

use chrono::{Duration, NaiveDate, Utc};
use clap::Args;

use waitline_core::status::{StatusFile, Step};
use waitline_core::RootLayout;
use waitline_model::{
    generate_backfill, generate_forecast, Dimensions, EncodingMap, PostedAggregates,
};
use waitline_store::EntityIndex;

/// Arguments for `waitline forecast`.
#[derive(Debug, Args)]
pub struct ForecastArgs {
    /// Restrict to one park.
    #[arg(long)]
    pub park: Option<String>,

    /// Days ahead to forecast (max two years).
    #[arg(long, default_value_t = 30)]
    pub days: u32,
}

/// Runs the forecast command.
///
/// # Errors
///
/// Returns lock contention or generation failures.
pub fn execute_forecast(args: ForecastArgs, layout: &RootLayout) -> anyhow::Result<()> {
    let _lock = super::acquire_pipeline_lock(layout, "forecast")?;
    let status = StatusFile::new(layout.pipeline_status());
    status.update(|s| s.start_step(Step::Forecast))?;

    let result = (|| -> anyhow::Result<(u64, u64)> {
        let days = args.days.min(731);
        let dims = Dimensions::load(&layout.dimension_tables(), Utc::now())?;
        let aggregates_path = layout.posted_aggregates();
        let aggregates = if aggregates_path.exists() {
            PostedAggregates::load(&aggregates_path)?
        } else {
            tracing::warn!("no posted aggregates; posted_predicted will be empty");
            PostedAggregates::default()
        };
        let mut encoding = EncodingMap::load(&layout.encoding_mappings())?;
        let index = EntityIndex::open(&layout.entity_index_db())?;

        let park_filter = args.park.map(|p| p.to_lowercase());
        let entities: Vec<String> = index
            .all()?
            .into_iter()
            .map(|r| r.entity_code)
            .filter(|code| {
                park_filter
                    .as_ref()
                    .map_or(true, |park| waitline_core::park_code_for_entity(code) == *park)
            })
            .collect();

        let today = waitline_core::parkdate::park_date_in_zone(
            Utc::now(),
            chrono_tz_eastern(),
        );
        let mut written = 0u64;
        let mut skipped = 0u64;
        for entity in &entities {
            for offset in 0..i64::from(days) {
                let date = today + Duration::days(offset);
                match generate_forecast(layout, &dims, &aggregates, &mut encoding, entity, date)?
                {
                    Some(_) => written += 1,
                    None => skipped += 1,
                }
            }
        }
        encoding.save()?;
        Ok((written, skipped))
    })();

    match result {
        Ok((written, skipped)) => {
            status.update(|s| s.finish_step(Step::Forecast))?;
            println!("forecast curves written: {written} ({skipped} skipped without hours)");
            Ok(())
        }
        Err(e) => {
            status.update(|s| s.fail_step(Step::Forecast, e.to_string()))?;
            Err(e)
        }
    }
}

/// Arguments for `waitline backfill`.
#[derive(Debug, Args)]
pub struct BackfillArgs {
    /// First park date (inclusive).
    #[arg(long)]
    pub from: NaiveDate,

    /// Last park date (inclusive).
    #[arg(long)]
    pub to: NaiveDate,

    /// Restrict to one entity.
    #[arg(long)]
    pub entity: Option<String>,
}

/// Runs the backfill command.
///
/// # Errors
///
/// Returns lock contention or generation failures.
pub fn execute_backfill(args: BackfillArgs, layout: &RootLayout) -> anyhow::Result<()> {
    anyhow::ensure!(args.from <= args.to, "--from must not be after --to");
    let _lock = super::acquire_pipeline_lock(layout, "backfill")?;

    let dims = Dimensions::load(&layout.dimension_tables(), Utc::now())?;
    let mut encoding = EncodingMap::load(&layout.encoding_mappings())?;
    let index = EntityIndex::open(&layout.entity_index_db())?;
    let entities: Vec<String> = match args.entity {
        Some(entity) => vec![entity.to_uppercase()],
        None => index.all()?.into_iter().map(|r| r.entity_code).collect(),
    };

    let mut written = 0u64;
    let mut date = args.from;
    while date <= args.to {
        for entity in &entities {
            if generate_backfill(layout, &dims, &mut encoding, entity, date)?.is_some() {
                written += 1;
            }
        }
        date += Duration::days(1);
    }
    encoding.save()?;
    println!("backfill curves written: {written}");
    Ok(())
}

fn chrono_tz_eastern() -> chrono_tz::Tz {
    chrono_tz::America::New_York
}
