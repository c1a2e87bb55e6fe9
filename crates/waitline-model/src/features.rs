//! Feature construction for the modeling engine.
//!
//! A feature table is built from one entity's fact rows plus the loaded
//! dimensions: time-of-day, calendar joins, park-hours joins, identity
//! features, and a geometric recency weight. All joins are by-key against
//! pre-selected lookups; the versioned park-hours selection happened once
//! at dimension load, so building features is a single pass over the rows.
//!
//! Missing join values encode as `-1` — the tree engine treats that as
//! just another split value, and the encoding map guarantees identity
//! features never fail.

use chrono::{DateTime, NaiveDate, Timelike, Utc};

use waitline_core::observation::{Observation, WaitTimeType};
use waitline_core::parks::park_code_for_entity;

use crate::dimensions::Dimensions;
use crate::encoding::EncodingMap;
use crate::error::{ModelError, Result};

/// Half-life of the recency weight, in days.
const DECAY_HALF_LIFE_DAYS: f64 = 730.0;

/// Which series an entity models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Standby actual waits; posted is a covariate.
    Actual,
    /// Priority return-window minutes; no posted covariate.
    Priority,
}

impl TargetKind {
    /// The wait-time type this target trains on.
    #[must_use]
    pub const fn wait_type(self) -> WaitTimeType {
        match self {
            Self::Actual => WaitTimeType::Actual,
            Self::Priority => WaitTimeType::Priority,
        }
    }

    /// Target for an entity given its priority-queue flag.
    #[must_use]
    pub const fn for_entity(has_priority_queue: bool) -> Self {
        if has_priority_queue {
            Self::Priority
        } else {
            Self::Actual
        }
    }
}

/// The ordered feature names for a model variant.
#[must_use]
pub fn feature_names(include_posted: bool) -> Vec<String> {
    let mut names: Vec<String> = [
        "pred_mins_since_6am",
        "pred_dategroupid",
        "pred_season",
        "pred_season_year",
        "park_code",
        "entity_code",
        "pred_mins_since_park_open",
        "pred_park_open_hour",
        "pred_park_close_hour",
        "pred_park_hours_open",
        "pred_emh_morning",
        "pred_emh_evening",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect();
    if include_posted {
        names.push("posted_wait_time".to_string());
    }
    names
}

/// A dense row-major feature table with target and weights.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    /// Ordered feature names.
    pub feature_names: Vec<String>,
    /// Row-major matrix, `rows × feature_names.len()`.
    pub matrix: Vec<f64>,
    /// Target values (observed wait minutes).
    pub target: Vec<f64>,
    /// Training weights (`0.5^(days_since/730)`).
    pub weights: Vec<f64>,
    /// Park date per row, for chronological splitting.
    pub park_dates: Vec<NaiveDate>,
}

impl FeatureTable {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.target.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    /// One row's feature slice.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f64] {
        let width = self.feature_names.len();
        &self.matrix[i * width..(i + 1) * width]
    }

    /// Splits chronologically by park date into train/val/test row indices.
    ///
    /// Dates are ordered and partitioned by the ratios; every row of a date
    /// lands in the same split, so the boundary never leaks a day across
    /// sets.
    #[must_use]
    pub fn chronological_split(
        &self,
        train_ratio: f64,
        val_ratio: f64,
    ) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
        let mut dates: Vec<NaiveDate> = self.park_dates.clone();
        dates.sort_unstable();
        dates.dedup();
        let n = dates.len();
        let train_end = ((n as f64) * train_ratio) as usize;
        let val_end = ((n as f64) * (train_ratio + val_ratio)) as usize;
        let train_dates: std::collections::BTreeSet<_> =
            dates[..train_end.min(n)].iter().copied().collect();
        let val_dates: std::collections::BTreeSet<_> =
            dates[train_end.min(n)..val_end.min(n)].iter().copied().collect();

        let mut train = Vec::new();
        let mut val = Vec::new();
        let mut test = Vec::new();
        for (i, date) in self.park_dates.iter().enumerate() {
            if train_dates.contains(date) {
                train.push(i);
            } else if val_dates.contains(date) {
                val.push(i);
            } else {
                test.push(i);
            }
        }
        (train, val, test)
    }
}

/// Builds feature rows for one entity, shared by training and inference.
pub struct FeatureBuilder<'a> {
    dims: &'a Dimensions,
    encoding: &'a mut EncodingMap,
    entity_code: String,
    park_code: String,
    entity_id: f64,
    park_id: f64,
}

impl<'a> FeatureBuilder<'a> {
    /// Creates a builder for `entity_code`.
    pub fn new(dims: &'a Dimensions, encoding: &'a mut EncodingMap, entity_code: &str) -> Self {
        let park_code = park_code_for_entity(entity_code);
        let entity_id = encoding.encode("entity_code", entity_code) as f64;
        let park_id = encoding.encode("park_code", &park_code) as f64;
        Self {
            dims,
            encoding,
            entity_code: entity_code.to_string(),
            park_code,
            entity_id,
            park_id,
        }
    }

    /// The entity's park code.
    #[must_use]
    pub fn park_code(&self) -> &str {
        &self.park_code
    }

    /// Builds one feature row for a park date and local wall-clock minute.
    ///
    /// `posted` supplies the covariate for with-POSTED variants; pass
    /// `None` when building without-POSTED rows.
    pub fn row(
        &mut self,
        park_date: NaiveDate,
        mins_since_midnight: u32,
        posted: Option<f64>,
        include_posted: bool,
    ) -> Vec<f64> {
        let mins_since_6am = f64::from((mins_since_midnight as i32 - 360).rem_euclid(1440));
        let dategroup = self
            .dims
            .dategroup
            .get(&park_date)
            .map_or(-1.0, |g| *g as f64);
        let (season, season_year) = match self.dims.season.get(&park_date) {
            Some((name, year)) => (
                self.encoding.encode("pred_season", name) as f64,
                f64::from(*year),
            ),
            None => (-1.0, -1.0),
        };

        let hours = self.dims.park_hours.get(&self.park_code, park_date);
        let (since_open, open_hour, close_hour, hours_open, emh_m, emh_e) = match hours {
            Some(h) => (
                f64::from(mins_since_midnight) - f64::from(h.open_minutes),
                f64::from(h.open_hour()),
                f64::from(h.close_hour()),
                h.hours_open(),
                f64::from(u8::from(h.emh_morning)),
                f64::from(u8::from(h.emh_evening)),
            ),
            None => (-1.0, -1.0, -1.0, -1.0, -1.0, -1.0),
        };

        let mut row = vec![
            mins_since_6am,
            dategroup,
            season,
            season_year,
            self.park_id,
            self.entity_id,
            since_open,
            open_hour,
            close_hour,
            hours_open,
            emh_m,
            emh_e,
        ];
        if include_posted {
            row.push(posted.unwrap_or(-1.0));
        }
        row
    }

    /// The entity code this builder serves.
    #[must_use]
    pub fn entity_code(&self) -> &str {
        &self.entity_code
    }
}

/// Builds the training feature table for one entity.
///
/// `rows` are the entity's fact rows sorted by `observed_at`. Target rows
/// are those of `target.wait_type()`; when `include_posted` is set, each
/// target row is joined to its nearest POSTED observation on the same park
/// date (two-pointer over the time-sorted series, no per-row scans).
///
/// # Errors
///
/// Returns `InsufficientData` if no target rows exist.
pub fn build_table(
    rows: &[Observation],
    dims: &Dimensions,
    encoding: &mut EncodingMap,
    entity_code: &str,
    target: TargetKind,
    include_posted: bool,
    as_of: DateTime<Utc>,
) -> Result<FeatureTable> {
    let target_rows: Vec<&Observation> = rows
        .iter()
        .filter(|r| r.wait_time_type == target.wait_type())
        .collect();
    if target_rows.is_empty() {
        return Err(ModelError::insufficient(format!(
            "no {} rows for {entity_code}",
            target.wait_type()
        )));
    }

    let posted_rows: Vec<&Observation> = if include_posted {
        rows.iter()
            .filter(|r| r.wait_time_type == WaitTimeType::Posted)
            .collect()
    } else {
        Vec::new()
    };

    let mut builder = FeatureBuilder::new(dims, encoding, entity_code);
    let names = feature_names(include_posted);
    let mut table = FeatureTable {
        feature_names: names,
        matrix: Vec::with_capacity(target_rows.len() * 13),
        target: Vec::with_capacity(target_rows.len()),
        weights: Vec::with_capacity(target_rows.len()),
        park_dates: Vec::with_capacity(target_rows.len()),
    };

    // Nearest-POSTED cursor: both series are time-ordered, so the closest
    // posted observation advances monotonically with the target rows.
    let mut cursor = 0usize;

    for row in target_rows {
        let date = waitline_core::park_date(&row.observed_at);
        let mins_since_midnight = row.observed_at.hour() * 60 + row.observed_at.minute();

        let posted = if posted_rows.is_empty() {
            None
        } else {
            while cursor + 1 < posted_rows.len()
                && nearer(posted_rows[cursor + 1], posted_rows[cursor], row)
            {
                cursor += 1;
            }
            let candidate = posted_rows[cursor];
            (waitline_core::park_date(&candidate.observed_at) == date)
                .then(|| f64::from(candidate.wait_time_minutes))
        };

        let features = builder.row(date, mins_since_midnight, posted, include_posted);
        table.matrix.extend_from_slice(&features);
        table.target.push(f64::from(row.wait_time_minutes));

        let days_since = (as_of - row.observed_at.with_timezone(&Utc)).num_days().max(0) as f64;
        table
            .weights
            .push(0.5_f64.powf(days_since / DECAY_HALF_LIFE_DAYS));
        table.park_dates.push(date);
    }

    Ok(table)
}

/// Whether `a` is closer in time to `target` than `b` is.
fn nearer(a: &Observation, b: &Observation, target: &Observation) -> bool {
    let da = (a.observed_at - target.observed_at).num_seconds().abs();
    let db = (b.observed_at - target.observed_at).num_seconds().abs();
    da <= db
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::{ParkHours, ParkHoursLookup};
    use tempfile::TempDir;
    use waitline_core::observation::parse_observed_at;

    fn obs(entity: &str, at: &str, t: WaitTimeType, m: i32) -> Observation {
        Observation::new(entity, parse_observed_at(at).unwrap(), t, m)
    }

    fn dims_with_hours() -> Dimensions {
        let mut dims = Dimensions::default();
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        dims.dategroup.insert(date, 7);
        dims.season.insert(date, ("WINTER".into(), 2024));
        let mut lookup = ParkHoursLookup::default();
        lookup.insert(
            "mk",
            date,
            ParkHours {
                open_minutes: 9 * 60,
                close_minutes: 21 * 60,
                emh_morning: false,
                emh_evening: true,
            },
        );
        dims.park_hours = lookup;
        dims
    }

    fn encoding(dir: &TempDir) -> EncodingMap {
        EncodingMap::load(&dir.path().join("encoding_mappings.json")).expect("load")
    }

    #[test]
    fn builds_expected_feature_values() {
        let dir = TempDir::new().expect("tempdir");
        let dims = dims_with_hours();
        let mut enc = encoding(&dir);
        let rows = vec![
            obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Actual, 40),
        ];
        let table = build_table(
            &rows,
            &dims,
            &mut enc,
            "MK101",
            TargetKind::Actual,
            false,
            Utc::now(),
        )
        .expect("table");
        assert_eq!(table.len(), 1);
        let row = table.row(0);
        let names = feature_names(false);
        let get = |name: &str| row[names.iter().position(|n| n == name).unwrap()];
        assert_eq!(get("pred_mins_since_6am"), 270.0);
        assert_eq!(get("pred_dategroupid"), 7.0);
        assert_eq!(get("pred_season_year"), 2024.0);
        assert_eq!(get("pred_mins_since_park_open"), 90.0);
        assert_eq!(get("pred_park_open_hour"), 9.0);
        assert_eq!(get("pred_park_close_hour"), 21.0);
        assert_eq!(get("pred_park_hours_open"), 12.0);
        assert_eq!(get("pred_emh_evening"), 1.0);
        assert_eq!(table.target[0], 40.0);
    }

    #[test]
    fn nearest_posted_joins_by_time() {
        let dir = TempDir::new().expect("tempdir");
        let dims = dims_with_hours();
        let mut enc = encoding(&dir);
        let rows = vec![
            obs("MK101", "2024-01-15T09:00:00-05:00", WaitTimeType::Posted, 10),
            obs("MK101", "2024-01-15T10:00:00-05:00", WaitTimeType::Posted, 30),
            obs("MK101", "2024-01-15T10:10:00-05:00", WaitTimeType::Actual, 35),
            obs("MK101", "2024-01-15T12:00:00-05:00", WaitTimeType::Posted, 60),
        ];
        let table = build_table(
            &rows,
            &dims,
            &mut enc,
            "MK101",
            TargetKind::Actual,
            true,
            Utc::now(),
        )
        .expect("table");
        let names = feature_names(true);
        let posted_idx = names.iter().position(|n| n == "posted_wait_time").unwrap();
        // 10:10 actual joins the 10:00 posted (30), not 09:00 or 12:00.
        assert_eq!(table.row(0)[posted_idx], 30.0);
    }

    #[test]
    fn weight_decays_with_age() {
        let dir = TempDir::new().expect("tempdir");
        let dims = dims_with_hours();
        let mut enc = encoding(&dir);
        let rows = vec![obs(
            "MK101",
            "2024-01-15T10:30:00-05:00",
            WaitTimeType::Actual,
            40,
        )];
        // As-of exactly 730 days later: weight is one half.
        let as_of = parse_observed_at("2026-01-14T10:30:00-05:00")
            .unwrap()
            .with_timezone(&Utc);
        let table = build_table(
            &rows,
            &dims,
            &mut enc,
            "MK101",
            TargetKind::Actual,
            false,
            as_of,
        )
        .expect("table");
        assert!((table.weights[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn no_target_rows_is_insufficient() {
        let dir = TempDir::new().expect("tempdir");
        let dims = dims_with_hours();
        let mut enc = encoding(&dir);
        let rows = vec![obs(
            "MK101",
            "2024-01-15T10:30:00-05:00",
            WaitTimeType::Posted,
            40,
        )];
        let err = build_table(
            &rows,
            &dims,
            &mut enc,
            "MK101",
            TargetKind::Actual,
            false,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::InsufficientData { .. }));
    }

    #[test]
    fn chronological_split_keeps_dates_whole() {
        let dir = TempDir::new().expect("tempdir");
        let dims = dims_with_hours();
        let mut enc = encoding(&dir);
        let mut rows = Vec::new();
        for day in 1..=10 {
            for hour in [10, 14] {
                rows.push(obs(
                    "MK101",
                    &format!("2024-01-{day:02}T{hour}:00:00-05:00"),
                    WaitTimeType::Actual,
                    20 + day,
                ));
            }
        }
        let table = build_table(
            &rows,
            &dims,
            &mut enc,
            "MK101",
            TargetKind::Actual,
            false,
            Utc::now(),
        )
        .expect("table");
        let (train, val, test) = table.chronological_split(0.7, 0.15);
        assert_eq!(train.len() + val.len() + test.len(), table.len());
        // 10 dates → 7 train, 1 val (index 7), 2 test.
        assert_eq!(train.len(), 14);
        assert_eq!(val.len(), 2);
        assert_eq!(test.len(), 4);
        let max_train_date = train.iter().map(|&i| table.park_dates[i]).max().unwrap();
        let min_val_date = val.iter().map(|&i| table.park_dates[i]).min().unwrap();
        assert!(max_train_date < min_val_date);
    }

    #[test]
    fn deterministic_given_fixed_inputs() {
        let dir = TempDir::new().expect("tempdir");
        let dims = dims_with_hours();
        let as_of = Utc::now();
        let rows = vec![
            obs("MK101", "2024-01-15T10:30:00-05:00", WaitTimeType::Actual, 40),
            obs("MK101", "2024-01-15T11:30:00-05:00", WaitTimeType::Actual, 45),
        ];
        let mut enc_a = encoding(&dir);
        let a = build_table(&rows, &dims, &mut enc_a, "MK101", TargetKind::Actual, false, as_of)
            .expect("a");
        let mut enc_b = encoding(&dir);
        let b = build_table(&rows, &dims, &mut enc_b, "MK101", TargetKind::Actual, false, as_of)
            .expect("b");
        assert_eq!(a.matrix, b.matrix);
        assert_eq!(a.target, b.target);
    }
}
