//! The Wait Time Index.
//!
//! For each `(park_code, park_date)` and 5-minute slot, WTI is the mean of
//! the actual wait across every entity in the park with a non-null actual
//! for that slot — observed and imputed values from backfill curves, then
//! predicted values from forecast curves. Null actuals (closed or no
//! prediction) are the only exclusions. Output rows also carry the entity
//! count and the min/max actual.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use waitline_core::layout::CurveKind;
use waitline_core::RootLayout;

use crate::curves::{read_curve_actuals, time_slots};
use crate::dimensions::Dimensions;
use crate::error::Result;

/// One WTI output row.
#[derive(Debug, Clone, PartialEq)]
pub struct WtiRow {
    /// Park code.
    pub park_code: String,
    /// Operational date.
    pub park_date: NaiveDate,
    /// Slot label `HH:MM`.
    pub time_slot: String,
    /// Mean actual across contributing entities.
    pub wti: f64,
    /// Number of contributing entities.
    pub n_entities: i64,
    /// Smallest contributing actual.
    pub min_actual: f64,
    /// Largest contributing actual.
    pub max_actual: f64,
}

/// Computes WTI rows for one `(park, date)` from the entities' curves.
///
/// Backfill curves take precedence per entity; a slot missing there falls
/// back to the forecast curve. Slots with no contributing entity are
/// omitted.
///
/// # Errors
///
/// Returns an error if a curve file is malformed.
pub fn wti_for_park_date(
    layout: &RootLayout,
    dims: &Dimensions,
    park_code: &str,
    park_date: NaiveDate,
    entities: &[String],
) -> Result<Vec<WtiRow>> {
    let Some(hours) = dims.park_hours.get(park_code, park_date) else {
        tracing::debug!(park_code, %park_date, "no park hours; skipping WTI");
        return Ok(Vec::new());
    };
    let slots = time_slots(hours.open_minutes, hours.close_minutes);

    // slot label → contributing actuals.
    let mut per_slot: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for slot in &slots {
        per_slot.insert(slot.label.as_str(), Vec::new());
    }

    for entity in entities {
        let backfill =
            read_curve_actuals(&layout.curve_file(CurveKind::Backfill, entity, park_date))?;
        let forecast =
            read_curve_actuals(&layout.curve_file(CurveKind::Forecast, entity, park_date))?;
        if backfill.is_none() && forecast.is_none() {
            continue;
        }
        for slot in &slots {
            let actual = backfill
                .as_ref()
                .and_then(|c| c.get(&slot.label).copied().flatten())
                .or_else(|| {
                    forecast
                        .as_ref()
                        .and_then(|c| c.get(&slot.label).copied().flatten())
                });
            if let Some(actual) = actual {
                per_slot
                    .get_mut(slot.label.as_str())
                    .expect("slot present")
                    .push(actual);
            }
        }
    }

    let rows = slots
        .iter()
        .filter_map(|slot| {
            let actuals = &per_slot[slot.label.as_str()];
            if actuals.is_empty() {
                return None;
            }
            let sum: f64 = actuals.iter().sum();
            let min = actuals.iter().copied().fold(f64::INFINITY, f64::min);
            let max = actuals.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            Some(WtiRow {
                park_code: park_code.to_string(),
                park_date,
                time_slot: slot.label.clone(),
                wti: sum / actuals.len() as f64,
                n_entities: actuals.len() as i64,
                min_actual: min,
                max_actual: max,
            })
        })
        .collect();
    Ok(rows)
}

/// Writes WTI rows as Parquet.
///
/// # Errors
///
/// Returns a columnar error on encode or write failure.
pub fn write_wti(path: &Path, rows: &[WtiRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(waitline_core::Error::from)?;
    }
    let schema = Arc::new(Schema::new(vec![
        Field::new("park_code", DataType::Utf8, false),
        Field::new("park_date", DataType::Utf8, false),
        Field::new("time_slot", DataType::Utf8, false),
        Field::new("wti", DataType::Float64, false),
        Field::new("n_entities", DataType::Int64, false),
        Field::new("min_actual", DataType::Float64, false),
        Field::new("max_actual", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|r| r.park_code.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|r| r.park_date.to_string()),
            )),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|r| r.time_slot.as_str()),
            )),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.wti))),
            Arc::new(Int64Array::from_iter_values(
                rows.iter().map(|r| r.n_entities),
            )),
            Arc::new(Float64Array::from_iter_values(
                rows.iter().map(|r| r.min_actual),
            )),
            Arc::new(Float64Array::from_iter_values(
                rows.iter().map(|r| r.max_actual),
            )),
        ],
    )?;
    let file = File::create(path).map_err(waitline_core::Error::from)?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(WriterProperties::builder().build()))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}
