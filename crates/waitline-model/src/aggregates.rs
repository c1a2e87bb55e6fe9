//! Posted aggregates: future-date POSTED imputation.
//!
//! One scan over the canonical fact files collects every POSTED row into
//! `(entity_code, dategroupid, hour)` groups; each group keeps a recency-
//! weighted median (`weight = 1 / (1 + days_ago / 365)`), a weighted mean,
//! and a count. The table persists as
//! `aggregates/posted_aggregates.parquet`.
//!
//! Lookup falls back through five levels so a future slot always gets the
//! most specific median available:
//!
//! 1. `(entity, dategroupid, hour)`
//! 2. `(entity, dategroupid)` — median across hours
//! 3. `(entity, hour)` — median across dategroupids
//! 4. `(entity)` — median across everything
//! 5. `(park_code, hour)` — park-level median

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array as _, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Timelike, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use waitline_core::observation::WaitTimeType;
use waitline_core::parks::park_code_for_entity;
use waitline_core::RootLayout;
use waitline_store::csvio;

use crate::dimensions::Dimensions;
use crate::error::{ModelError, Result};

/// One aggregate group.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    /// Entity code.
    pub entity_code: String,
    /// Calendar date-group ID (`-1` when the dimension had no row).
    pub dategroupid: i64,
    /// Local hour of day.
    pub hour: i32,
    /// Recency-weighted median POSTED.
    pub posted_median: f64,
    /// Recency-weighted mean POSTED.
    pub posted_mean: f64,
    /// Observations behind the group.
    pub posted_count: i64,
    /// Mean recency weight of the group.
    pub avg_weight: f64,
}

/// The aggregate table with its fallback indexes.
#[derive(Debug, Default)]
pub struct PostedAggregates {
    rows: Vec<AggregateRow>,
    by_full: BTreeMap<(String, i64, i32), f64>,
    by_entity_group: BTreeMap<(String, i64), f64>,
    by_entity_hour: BTreeMap<(String, i32), f64>,
    by_entity: BTreeMap<String, f64>,
    by_park_hour: BTreeMap<(String, i32), f64>,
}

impl PostedAggregates {
    /// Number of `(entity, dategroupid, hour)` groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The predicted POSTED for a slot, via the fallback chain.
    #[must_use]
    pub fn predicted_posted(
        &self,
        entity_code: &str,
        dategroupid: Option<i64>,
        hour: i32,
    ) -> Option<f64> {
        let entity = entity_code.to_string();
        if let Some(group) = dategroupid {
            if let Some(v) = self.by_full.get(&(entity.clone(), group, hour)) {
                return Some(*v);
            }
            if let Some(v) = self.by_entity_group.get(&(entity.clone(), group)) {
                return Some(*v);
            }
        }
        if let Some(v) = self.by_entity_hour.get(&(entity.clone(), hour)) {
            return Some(*v);
        }
        if let Some(v) = self.by_entity.get(&entity) {
            return Some(*v);
        }
        let park = park_code_for_entity(entity_code);
        self.by_park_hour.get(&(park, hour)).copied()
    }

    /// Builds the fallback indexes from the base rows.
    fn index(mut self) -> Self {
        let mut entity_group: BTreeMap<(String, i64), Vec<f64>> = BTreeMap::new();
        let mut entity_hour: BTreeMap<(String, i32), Vec<f64>> = BTreeMap::new();
        let mut entity: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut park_hour: BTreeMap<(String, i32), Vec<f64>> = BTreeMap::new();

        for row in &self.rows {
            self.by_full.insert(
                (row.entity_code.clone(), row.dategroupid, row.hour),
                row.posted_median,
            );
            entity_group
                .entry((row.entity_code.clone(), row.dategroupid))
                .or_default()
                .push(row.posted_median);
            entity_hour
                .entry((row.entity_code.clone(), row.hour))
                .or_default()
                .push(row.posted_median);
            entity
                .entry(row.entity_code.clone())
                .or_default()
                .push(row.posted_median);
            park_hour
                .entry((park_code_for_entity(&row.entity_code), row.hour))
                .or_default()
                .push(row.posted_median);
        }

        self.by_entity_group = entity_group
            .into_iter()
            .map(|(k, v)| (k, median(&v)))
            .collect();
        self.by_entity_hour = entity_hour
            .into_iter()
            .map(|(k, v)| (k, median(&v)))
            .collect();
        self.by_entity = entity.into_iter().map(|(k, v)| (k, median(&v))).collect();
        self.by_park_hour = park_hour
            .into_iter()
            .map(|(k, v)| (k, median(&v)))
            .collect();
        self
    }

    /// Writes the table as Parquet.
    ///
    /// # Errors
    ///
    /// Returns a columnar error on encode or write failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(waitline_core::Error::from)?;
        }
        let schema = aggregate_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from_iter_values(
                    self.rows.iter().map(|r| r.entity_code.as_str()),
                )),
                Arc::new(Int64Array::from_iter_values(
                    self.rows.iter().map(|r| r.dategroupid),
                )),
                Arc::new(Int32Array::from_iter_values(self.rows.iter().map(|r| r.hour))),
                Arc::new(Float64Array::from_iter_values(
                    self.rows.iter().map(|r| r.posted_median),
                )),
                Arc::new(Float64Array::from_iter_values(
                    self.rows.iter().map(|r| r.posted_mean),
                )),
                Arc::new(Int64Array::from_iter_values(
                    self.rows.iter().map(|r| r.posted_count),
                )),
                Arc::new(Float64Array::from_iter_values(
                    self.rows.iter().map(|r| r.avg_weight),
                )),
            ],
        )?;
        let file = File::create(path).map_err(waitline_core::Error::from)?;
        let mut writer =
            ArrowWriter::try_new(file, schema, Some(WriterProperties::builder().build()))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }

    /// Loads a table previously written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns a columnar error if the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| ModelError::columnar(format!("open {}: {e}", path.display())))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;
            let entity = column::<StringArray>(&batch, 0)?;
            let group = column::<Int64Array>(&batch, 1)?;
            let hour = column::<Int32Array>(&batch, 2)?;
            let median_col = column::<Float64Array>(&batch, 3)?;
            let mean_col = column::<Float64Array>(&batch, 4)?;
            let count_col = column::<Int64Array>(&batch, 5)?;
            let weight_col = column::<Float64Array>(&batch, 6)?;
            for i in 0..batch.num_rows() {
                rows.push(AggregateRow {
                    entity_code: entity.value(i).to_string(),
                    dategroupid: group.value(i),
                    hour: hour.value(i),
                    posted_median: median_col.value(i),
                    posted_mean: mean_col.value(i),
                    posted_count: count_col.value(i),
                    avg_weight: weight_col.value(i),
                });
            }
        }
        Ok(Self {
            rows,
            ..Self::default()
        }
        .index())
    }

    /// Builds an aggregate table from in-memory groups (tests).
    #[must_use]
    pub fn from_rows(rows: Vec<AggregateRow>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
        .index()
    }
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, index: usize) -> Result<&'a T> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ModelError::columnar(format!("column {index} has unexpected type")))
}

fn aggregate_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("entity_code", DataType::Utf8, false),
        Field::new("dategroupid", DataType::Int64, false),
        Field::new("hour", DataType::Int32, false),
        Field::new("posted_median", DataType::Float64, false),
        Field::new("posted_mean", DataType::Float64, false),
        Field::new("posted_count", DataType::Int64, false),
        Field::new("avg_weight", DataType::Float64, false),
    ]))
}

/// Scans the fact store once and builds the aggregate table.
///
/// # Errors
///
/// Returns a CSV error if a partition is unreadable.
pub fn build_posted_aggregates(
    layout: &RootLayout,
    dims: &Dimensions,
    as_of: DateTime<Utc>,
) -> Result<PostedAggregates> {
    let clean = layout.fact_clean();
    let mut groups: BTreeMap<(String, i64, i32), Vec<(f64, f64)>> = BTreeMap::new();

    if clean.exists() {
        let mut month_dirs: Vec<std::path::PathBuf> = std::fs::read_dir(&clean)
            .map_err(waitline_core::Error::from)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        month_dirs.sort();
        for month_dir in month_dirs {
            for entry in std::fs::read_dir(&month_dir).map_err(waitline_core::Error::from)? {
                let path = entry.map_err(waitline_core::Error::from)?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                    continue;
                }
                for row in csvio::read_fact_file(&path)? {
                    if row.wait_time_type != WaitTimeType::Posted {
                        continue;
                    }
                    let date = waitline_core::park_date(&row.observed_at);
                    let group = dims.dategroup.get(&date).copied().unwrap_or(-1);
                    let hour = row.observed_at.hour() as i32;
                    let days_ago =
                        (as_of - row.observed_at.with_timezone(&Utc)).num_days().max(0) as f64;
                    let weight = 1.0 / (1.0 + days_ago / 365.0);
                    groups
                        .entry((row.entity_code.clone(), group, hour))
                        .or_default()
                        .push((f64::from(row.wait_time_minutes), weight));
                }
            }
        }
    }

    let rows: Vec<AggregateRow> = groups
        .into_iter()
        .map(|((entity_code, dategroupid, hour), values)| {
            let weight_sum: f64 = values.iter().map(|(_, w)| w).sum();
            let mean = if weight_sum > 0.0 {
                values.iter().map(|(v, w)| v * w).sum::<f64>() / weight_sum
            } else {
                0.0
            };
            AggregateRow {
                entity_code,
                dategroupid,
                hour,
                posted_median: weighted_median(&values),
                posted_mean: mean,
                posted_count: values.len() as i64,
                avg_weight: weight_sum / values.len() as f64,
            }
        })
        .collect();

    tracing::info!(groups = rows.len(), "posted aggregates built");
    Ok(PostedAggregates {
        rows,
        ..PostedAggregates::default()
    }
    .index())
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn weighted_median(pairs: &[(f64, f64)]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    let mut sorted = pairs.to_vec();
    sorted.sort_by(|a, b| f64::total_cmp(&a.0, &b.0));
    let half: f64 = sorted.iter().map(|(_, w)| w).sum::<f64>() / 2.0;
    let mut cumulative = 0.0;
    for (value, weight) in &sorted {
        cumulative += weight;
        if cumulative >= half {
            return *value;
        }
    }
    sorted.last().map_or(0.0, |(v, _)| *v)
}
