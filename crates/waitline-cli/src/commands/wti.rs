//! `waitline wti` - the Wait Time Index.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, Utc};
use clap::Args;

use waitline_core::status::{StatusFile, Step};
use waitline_core::RootLayout;
use waitline_model::wti::{wti_for_park_date, write_wti, WtiRow};
use waitline_model::Dimensions;
use waitline_store::EntityIndex;

/// Arguments for `waitline wti`.
#[derive(Debug, Args)]
pub struct WtiArgs {
    /// First park date (inclusive; default: yesterday).
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// Last park date (inclusive; default: 30 days ahead).
    #[arg(long)]
    pub to: Option<NaiveDate>,

    /// Restrict to one park.
    #[arg(long)]
    pub park: Option<String>,
}

/// Runs the command.
///
/// # Errors
///
/// Returns lock contention or computation failures.
pub fn execute(args: WtiArgs, layout: &RootLayout) -> anyhow::Result<()> {
    let _lock = super::acquire_pipeline_lock(layout, "wti")?;
    let status = StatusFile::new(layout.pipeline_status());
    status.update(|s| s.start_step(Step::Wti))?;

    let result = (|| -> anyhow::Result<usize> {
        let today = waitline_core::parkdate::park_date_in_zone(
            Utc::now(),
            chrono_tz::America::New_York,
        );
        let from = args.from.unwrap_or_else(|| today - Duration::days(1));
        let to = args.to.unwrap_or_else(|| today + Duration::days(30));
        anyhow::ensure!(from <= to, "--from must not be after --to");

        let dims = Dimensions::load(&layout.dimension_tables(), Utc::now())?;
        let index = EntityIndex::open(&layout.entity_index_db())?;

        // Entities grouped by park.
        let mut by_park: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in index.all()? {
            let park = waitline_core::park_code_for_entity(&record.entity_code);
            by_park.entry(park).or_default().push(record.entity_code);
        }
        if let Some(park) = args.park.map(|p| p.to_lowercase()) {
            by_park.retain(|code, _| *code == park);
        }

        let mut rows: Vec<WtiRow> = Vec::new();
        for (park, entities) in &by_park {
            let mut date = from;
            while date <= to {
                rows.extend(wti_for_park_date(layout, &dims, park, date, entities)?);
                date += Duration::days(1);
            }
        }
        write_wti(&layout.wti_file(), &rows)?;
        Ok(rows.len())
    })();

    match result {
        Ok(rows) => {
            status.update(|s| s.finish_step(Step::Wti))?;
            println!("wti written: {rows} rows -> {}", layout.wti_file().display());
            Ok(())
        }
        Err(e) => {
            status.update(|s| s.fail_step(Step::Wti, e.to_string()))?;
            Err(e)
        }
    }
}
