//! Forecast and backfill curve generation at 5-minute resolution.
//!
//! Every curve covers a park's operating window for one date as 5-minute
//! slots `[open, close)` — a 09:00–21:00 day yields 144 slots. Closes past
//! midnight wrap; slot labels are wall-clock `HH:MM`.
//!
//! - **Forecast** (future dates): `posted_predicted` from the posted
//!   aggregates, `actual_predicted` from the without-POSTED model (or the
//!   mean model). No model and no hours means no curve.
//! - **Backfill** (past dates): observed ACTUAL passes through with
//!   `source=observed`; other slots are imputed from the with-POSTED
//!   model over the observed POSTED series, linearly interpolated across
//!   interior gaps inside the window, and tagged `source=imputed`.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Timelike};

use waitline_core::layout::CurveKind;
use waitline_core::observation::{Observation, WaitTimeType};
use waitline_core::RootLayout;
use waitline_store::csvio;

use crate::dimensions::Dimensions;
use crate::encoding::EncodingMap;
use crate::error::{ModelError, Result};
use crate::features::FeatureBuilder;
use crate::trainer::TrainedArtifact;

/// Slot width in minutes.
pub const SLOT_MINUTES: u32 = 5;

/// Model artifact file names under `models/{entity}/`.
pub mod artifact_names {
    /// ACTUAL-target model with the posted covariate.
    pub const WITH_POSTED: &str = "model_with_posted.json";
    /// Model without the posted covariate (forecast path).
    pub const WITHOUT_POSTED: &str = "model_without_posted.json";
    /// Mean fallback.
    pub const MEAN: &str = "model_mean.json";
    /// Training metadata.
    pub const METADATA: &str = "metadata.json";
}

/// One 5-minute slot: minutes since midnight (may exceed 1440 for
/// past-midnight closes) and the wall-clock label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSlot {
    /// Minutes since the operational day's midnight.
    pub minutes: u32,
    /// Wall-clock label `HH:MM`.
    pub label: String,
}

/// Generates the `[open, close)` slots for an operating window.
///
/// A close at or before the open is treated as next-day (wrapped) close.
#[must_use]
pub fn time_slots(open_minutes: u32, close_minutes: u32) -> Vec<TimeSlot> {
    let close = if close_minutes <= open_minutes {
        close_minutes + 1440
    } else {
        close_minutes
    };
    (open_minutes..close)
        .step_by(SLOT_MINUTES as usize)
        .map(|minutes| {
            let wall = minutes % 1440;
            TimeSlot {
                minutes,
                label: format!("{:02}:{:02}", wall / 60, wall % 60),
            }
        })
        .collect()
}

/// One forecast row.
#[derive(Debug, Clone)]
pub struct ForecastRow {
    /// Slot label.
    pub time_slot: String,
    /// Predicted actual wait, if a model was available.
    pub actual_predicted: Option<f64>,
    /// Predicted posted wait, if aggregates covered the slot.
    pub posted_predicted: Option<f64>,
}

/// Generates and writes the forecast curve for `(entity, park_date)`.
///
/// Returns the written path, or `None` when the park has no operating
/// hours for the date (no curve is produced).
///
/// # Errors
///
/// Returns an error if models or the output file are unusable.
pub fn generate_forecast(
    layout: &RootLayout,
    dims: &Dimensions,
    aggregates: &crate::aggregates::PostedAggregates,
    encoding: &mut EncodingMap,
    entity_code: &str,
    park_date: NaiveDate,
) -> Result<Option<PathBuf>> {
    let park = waitline_core::park_code_for_entity(entity_code);
    let Some(hours) = dims.park_hours.get(&park, park_date) else {
        tracing::debug!(entity_code, %park_date, "no park hours; skipping forecast");
        return Ok(None);
    };
    let slots = time_slots(hours.open_minutes, hours.close_minutes);

    let model_dir = layout.models(entity_code);
    let model = load_artifact(&model_dir.join(artifact_names::WITHOUT_POSTED))
        .or_else(|| load_artifact(&model_dir.join(artifact_names::MEAN)));
    let dategroup = dims.dategroup.get(&park_date).copied();

    let mut builder = FeatureBuilder::new(dims, encoding, entity_code);
    let rows: Vec<ForecastRow> = slots
        .iter()
        .map(|slot| {
            let hour = i32::try_from((slot.minutes % 1440) / 60).unwrap_or(0);
            let posted_predicted = aggregates.predicted_posted(entity_code, dategroup, hour);
            let actual_predicted = model.as_ref().map(|m| {
                let features = builder.row(park_date, slot.minutes % 1440, None, false);
                m.predict(&features).max(0.0)
            });
            ForecastRow {
                time_slot: slot.label.clone(),
                actual_predicted,
                posted_predicted,
            }
        })
        .collect();

    let path = layout.curve_file(CurveKind::Forecast, entity_code, park_date);
    write_forecast(&path, entity_code, park_date, &rows)?;
    Ok(Some(path))
}

fn load_artifact(path: &Path) -> Option<TrainedArtifact> {
    path.exists()
        .then(|| TrainedArtifact::load(path).ok())
        .flatten()
}

fn write_forecast(
    path: &Path,
    entity_code: &str,
    park_date: NaiveDate,
    rows: &[ForecastRow],
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(waitline_core::Error::from)?;
    }
    let mut writer = csv::Writer::from_path(path).map_err(|e| ModelError::artifact(e))?;
    writer
        .write_record([
            "entity_code",
            "park_date",
            "time_slot",
            "actual_predicted",
            "posted_predicted",
        ])
        .map_err(|e| ModelError::artifact(e))?;
    let date = park_date.to_string();
    for row in rows {
        writer
            .write_record([
                entity_code,
                &date,
                &row.time_slot,
                &format_opt(row.actual_predicted),
                &format_opt(row.posted_predicted),
            ])
            .map_err(|e| ModelError::artifact(e))?;
    }
    writer.flush().map_err(|e| ModelError::artifact(e))?;
    Ok(())
}

fn format_opt(value: Option<f64>) -> String {
    value.map_or_else(String::new, |v| format!("{v:.1}"))
}

/// Source tag of a backfill slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillSource {
    /// Observed ACTUAL for the slot.
    Observed,
    /// Predicted (or unavailable) value.
    Imputed,
}

impl BackfillSource {
    /// The tag as written in curve files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observed => "observed",
            Self::Imputed => "imputed",
        }
    }
}

/// One backfill row.
#[derive(Debug, Clone)]
pub struct BackfillRow {
    /// Slot label.
    pub time_slot: String,
    /// Actual wait (observed or imputed); `None` when nothing is known.
    pub actual: Option<f64>,
    /// Where the value came from.
    pub source: BackfillSource,
}

/// Generates and writes the backfill curve for `(entity, park_date)`.
///
/// Returns the written path, or `None` when the park has no operating
/// hours for the date.
///
/// # Errors
///
/// Returns an error if the fact partition or output file is unusable.
pub fn generate_backfill(
    layout: &RootLayout,
    dims: &Dimensions,
    encoding: &mut EncodingMap,
    entity_code: &str,
    park_date: NaiveDate,
) -> Result<Option<PathBuf>> {
    let park = waitline_core::park_code_for_entity(entity_code);
    let Some(hours) = dims.park_hours.get(&park, park_date) else {
        tracing::debug!(entity_code, %park_date, "no park hours; skipping backfill");
        return Ok(None);
    };
    let slots = time_slots(hours.open_minutes, hours.close_minutes);

    // Observations for this entity on this date.
    let fact_path = layout.fact_file(&park, park_date);
    let observations: Vec<Observation> = if fact_path.exists() {
        csvio::read_fact_file(&fact_path)?
            .into_iter()
            .filter(|r| r.entity_code == entity_code)
            .collect()
    } else {
        Vec::new()
    };

    let actual_by_slot = slot_values(&observations, WaitTimeType::Actual, &slots);
    let mut posted_by_slot = slot_values(&observations, WaitTimeType::Posted, &slots);
    interpolate_gaps(&mut posted_by_slot);

    let model_dir = layout.models(entity_code);
    let with_posted = load_artifact(&model_dir.join(artifact_names::WITH_POSTED));
    let mean = load_artifact(&model_dir.join(artifact_names::MEAN));

    let mut builder = FeatureBuilder::new(dims, encoding, entity_code);
    let rows: Vec<BackfillRow> = slots
        .iter()
        .enumerate()
        .map(|(i, slot)| {
            if let Some(observed) = actual_by_slot[i] {
                return BackfillRow {
                    time_slot: slot.label.clone(),
                    actual: Some(observed),
                    source: BackfillSource::Observed,
                };
            }
            let posted = posted_by_slot[i];
            let imputed = match (&with_posted, posted) {
                (Some(model), Some(posted)) => {
                    let features =
                        builder.row(park_date, slot.minutes % 1440, Some(posted), true);
                    Some(model.predict(&features).max(0.0))
                }
                _ => mean.as_ref().map(|m| m.predict(&[]).max(0.0)),
            };
            BackfillRow {
                time_slot: slot.label.clone(),
                actual: imputed,
                source: BackfillSource::Imputed,
            }
        })
        .collect();

    let path = layout.curve_file(CurveKind::Backfill, entity_code, park_date);
    write_backfill(&path, entity_code, park_date, &rows)?;
    Ok(Some(path))
}

/// Collapses observations of one type onto the slot grid (mean per slot).
fn slot_values(
    observations: &[Observation],
    wait_type: WaitTimeType,
    slots: &[TimeSlot],
) -> Vec<Option<f64>> {
    let mut sums = vec![(0.0f64, 0u32); slots.len()];
    let first = slots.first().map_or(0, |s| s.minutes);
    for obs in observations {
        if obs.wait_time_type != wait_type {
            continue;
        }
        let mut minutes = obs.observed_at.hour() * 60 + obs.observed_at.minute();
        // Early-morning rows belong to the tail of the operational day.
        if obs.observed_at.hour() < 6 {
            minutes += 1440;
        }
        if minutes < first {
            continue;
        }
        let index = ((minutes - first) / SLOT_MINUTES) as usize;
        if let Some(slot) = sums.get_mut(index) {
            slot.0 += f64::from(obs.wait_time_minutes);
            slot.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(sum, n)| (n > 0).then(|| sum / f64::from(n)))
        .collect()
}

/// Linearly interpolates interior gaps in a slot series.
///
/// Leading and trailing missing runs stay missing; only gaps bracketed by
/// known values are filled.
fn interpolate_gaps(series: &mut [Option<f64>]) {
    let mut last_known: Option<usize> = None;
    for i in 0..series.len() {
        if series[i].is_some() {
            if let Some(prev) = last_known {
                let gap = i - prev;
                if gap > 1 {
                    let start = series[prev].expect("known");
                    let end = series[i].expect("known");
                    for (step, slot) in (prev + 1..i).enumerate() {
                        let t = (step + 1) as f64 / gap as f64;
                        series[slot] = Some(start + (end - start) * t);
                    }
                }
            }
            last_known = Some(i);
        }
    }
}

fn write_backfill(
    path: &Path,
    entity_code: &str,
    park_date: NaiveDate,
    rows: &[BackfillRow],
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(waitline_core::Error::from)?;
    }
    let mut writer = csv::Writer::from_path(path).map_err(|e| ModelError::artifact(e))?;
    writer
        .write_record(["entity_code", "park_date", "time_slot", "actual", "source"])
        .map_err(|e| ModelError::artifact(e))?;
    let date = park_date.to_string();
    for row in rows {
        writer
            .write_record([
                entity_code,
                &date,
                &row.time_slot,
                &format_opt(row.actual),
                row.source.as_str(),
            ])
            .map_err(|e| ModelError::artifact(e))?;
    }
    writer.flush().map_err(|e| ModelError::artifact(e))?;
    Ok(())
}

/// Reads the `actual` column of a curve file into slot-label → value.
///
/// Works for both curve kinds: backfill's `actual` and forecast's
/// `actual_predicted` columns.
///
/// # Errors
///
/// Returns an error if the file exists but is malformed.
pub fn read_curve_actuals(
    path: &Path,
) -> Result<Option<std::collections::BTreeMap<String, Option<f64>>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| ModelError::artifact(e))?;
    let headers = reader
        .headers()
        .map_err(|e| ModelError::artifact(e))?
        .clone();
    let slot_col = headers
        .iter()
        .position(|h| h == "time_slot")
        .ok_or_else(|| ModelError::artifact("curve missing time_slot"))?;
    let actual_col = headers
        .iter()
        .position(|h| h == "actual" || h == "actual_predicted")
        .ok_or_else(|| ModelError::artifact("curve missing actual column"))?;

    let mut out = std::collections::BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| ModelError::artifact(e))?;
        let (Some(slot), Some(actual_raw)) = (record.get(slot_col), record.get(actual_col))
        else {
            continue;
        };
        let value = if actual_raw.is_empty() {
            None
        } else {
            actual_raw.parse::<f64>().ok()
        };
        out.insert(slot.to_string(), value);
    }
    Ok(Some(out))
}
