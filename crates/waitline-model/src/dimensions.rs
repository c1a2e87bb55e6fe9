//! Dimension tables consumed by the modeling engine.
//!
//! All four tables are produced by external tooling and read here as CSVs
//! under `dimension_tables/`:
//!
//! - `dimentity.csv` — entity metadata including the priority-queue flag
//! - `dimdategroupid.csv` — calendar grouping per park date
//! - `dimseason.csv` — season and season-year per park date
//! - `dimparkhours_versioned.csv` — versioned operating hours
//!
//! The park-hours table is versioned: several rows may describe the same
//! `(park_date, park_code)`, each with a version type, validity interval,
//! and creation time. The lookup selects the best version as of a given
//! instant — valid interval containing the instant, lowest version-type
//! priority number, then newest `created_at` — in one pre-sorted pass.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{ModelError, Result};

/// Version types in priority order (lower wins).
const VERSION_PRIORITY: [(&str, u8); 4] = [
    ("official", 1),
    ("final", 2),
    ("predicted", 3),
    ("historical", 4),
];

fn version_priority(version_type: &str) -> u8 {
    VERSION_PRIORITY
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(version_type))
        .map_or(99, |(_, p)| *p)
}

/// One entity's dimension row.
#[derive(Debug, Clone)]
pub struct EntityDim {
    /// Entity code.
    pub entity_code: String,
    /// Park code.
    pub park_code: String,
    /// Whether the entity has a priority (return-window) queue.
    pub has_priority_queue: bool,
}

/// Operating hours selected for one `(park_date, park_code)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParkHours {
    /// Opening minutes since local midnight.
    pub open_minutes: u32,
    /// Closing minutes since local midnight (may exceed 1440 for
    /// past-midnight closes).
    pub close_minutes: u32,
    /// Morning extra-hours flag.
    pub emh_morning: bool,
    /// Evening extra-hours flag.
    pub emh_evening: bool,
}

impl ParkHours {
    /// Open hour (floor).
    #[must_use]
    pub fn open_hour(&self) -> u32 {
        self.open_minutes / 60
    }

    /// Close hour (floor).
    #[must_use]
    pub fn close_hour(&self) -> u32 {
        self.close_minutes / 60
    }

    /// Hours the park is open (fractional).
    #[must_use]
    pub fn hours_open(&self) -> f64 {
        f64::from(self.close_minutes.saturating_sub(self.open_minutes)) / 60.0
    }
}

/// Best-version park hours per `(park_code, park_date)`, as of a fixed
/// instant.
#[derive(Debug, Default)]
pub struct ParkHoursLookup {
    rows: BTreeMap<(String, NaiveDate), ParkHours>,
}

impl ParkHoursLookup {
    /// The selected hours for a park and date.
    #[must_use]
    pub fn get(&self, park_code: &str, date: NaiveDate) -> Option<&ParkHours> {
        self.rows.get(&(park_code.to_string(), date))
    }

    /// Number of `(park, date)` keys present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the lookup is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Inserts a row (tests and donors).
    pub fn insert(&mut self, park_code: &str, date: NaiveDate, hours: ParkHours) {
        self.rows.insert((park_code.to_string(), date), hours);
    }
}

/// The loaded dimension set.
#[derive(Debug, Default)]
pub struct Dimensions {
    /// Entity metadata keyed by entity code.
    pub entities: BTreeMap<String, EntityDim>,
    /// Date-group ID per park date.
    pub dategroup: BTreeMap<NaiveDate, i64>,
    /// Season name and season year per park date.
    pub season: BTreeMap<NaiveDate, (String, i32)>,
    /// Best-version park hours.
    pub park_hours: ParkHoursLookup,
}

impl Dimensions {
    /// Loads every dimension table under `dim_dir`, selecting park-hours
    /// versions as of `as_of`.
    ///
    /// Missing tables load empty with a warning; modeling degrades rather
    /// than aborts.
    ///
    /// # Errors
    ///
    /// Returns a dimension error if a present table is malformed.
    pub fn load(dim_dir: &Path, as_of: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            entities: load_entities(&dim_dir.join("dimentity.csv"))?,
            dategroup: load_dategroup(&dim_dir.join("dimdategroupid.csv"))?,
            season: load_season(&dim_dir.join("dimseason.csv"))?,
            park_hours: load_park_hours(&dim_dir.join("dimparkhours_versioned.csv"), as_of)?,
        })
    }

    /// Whether an entity models its PRIORITY series (vs ACTUAL).
    #[must_use]
    pub fn has_priority_queue(&self, entity_code: &str) -> bool {
        self.entities
            .get(entity_code)
            .is_some_and(|e| e.has_priority_queue)
    }
}

fn open_reader(path: &Path) -> Result<Option<csv::Reader<std::fs::File>>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "dimension table missing; loading empty");
        return Ok(None);
    }
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map(Some)
        .map_err(|e| ModelError::dimension(format!("{}: {e}", path.display())))
}

fn header_position(
    headers: &csv::StringRecord,
    candidates: &[&str],
) -> Option<usize> {
    candidates
        .iter()
        .find_map(|c| headers.iter().position(|h| h.eq_ignore_ascii_case(c)))
}

fn load_entities(path: &Path) -> Result<BTreeMap<String, EntityDim>> {
    let Some(mut reader) = open_reader(path)? else {
        return Ok(BTreeMap::new());
    };
    let headers = reader
        .headers()
        .map_err(|e| ModelError::dimension(e.to_string()))?
        .clone();
    let code_col = header_position(&headers, &["entity_code", "code"])
        .ok_or_else(|| ModelError::dimension("dimentity missing entity_code"))?;
    let park_col = header_position(&headers, &["park_code", "park"]);
    let priority_col = header_position(&headers, &["has_priority_queue", "priority_queue"]);

    let mut out = BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| ModelError::dimension(e.to_string()))?;
        let Some(code) = record.get(code_col).filter(|s| !s.is_empty()) else {
            continue;
        };
        let code = code.to_uppercase();
        let park = park_col
            .and_then(|i| record.get(i))
            .filter(|s| !s.is_empty())
            .map_or_else(
                || waitline_core::park_code_for_entity(&code),
                str::to_lowercase,
            );
        let has_priority = priority_col
            .and_then(|i| record.get(i))
            .is_some_and(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "t"));
        out.insert(
            code.clone(),
            EntityDim {
                entity_code: code,
                park_code: park,
                has_priority_queue: has_priority,
            },
        );
    }
    Ok(out)
}

fn load_dategroup(path: &Path) -> Result<BTreeMap<NaiveDate, i64>> {
    let Some(mut reader) = open_reader(path)? else {
        return Ok(BTreeMap::new());
    };
    let headers = reader
        .headers()
        .map_err(|e| ModelError::dimension(e.to_string()))?
        .clone();
    let date_col = header_position(&headers, &["park_date", "date"])
        .ok_or_else(|| ModelError::dimension("dimdategroupid missing park_date"))?;
    let group_col = header_position(&headers, &["date_group_id", "dategroupid"])
        .ok_or_else(|| ModelError::dimension("dimdategroupid missing date_group_id"))?;

    let mut out = BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| ModelError::dimension(e.to_string()))?;
        let (Some(date_raw), Some(group_raw)) = (record.get(date_col), record.get(group_col))
        else {
            continue;
        };
        let (Ok(date), Ok(group)) = (date_raw.parse::<NaiveDate>(), group_raw.parse::<i64>())
        else {
            continue;
        };
        out.insert(date, group);
    }
    Ok(out)
}

fn load_season(path: &Path) -> Result<BTreeMap<NaiveDate, (String, i32)>> {
    let Some(mut reader) = open_reader(path)? else {
        return Ok(BTreeMap::new());
    };
    let headers = reader
        .headers()
        .map_err(|e| ModelError::dimension(e.to_string()))?
        .clone();
    let date_col = header_position(&headers, &["park_date", "date"])
        .ok_or_else(|| ModelError::dimension("dimseason missing park_date"))?;
    let season_col = header_position(&headers, &["season"])
        .ok_or_else(|| ModelError::dimension("dimseason missing season"))?;
    let year_col = header_position(&headers, &["season_year"]);

    let mut out = BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| ModelError::dimension(e.to_string()))?;
        let (Some(date_raw), Some(season)) = (record.get(date_col), record.get(season_col))
        else {
            continue;
        };
        let Ok(date) = date_raw.parse::<NaiveDate>() else {
            continue;
        };
        let year = year_col
            .and_then(|i| record.get(i))
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or_else(|| chrono::Datelike::year(&date));
        out.insert(date, (season.to_string(), year));
    }
    Ok(out)
}

/// Loads the versioned park-hours table and selects the best version per
/// `(park_date, park_code)` as of `as_of` in one sorted pass.
fn load_park_hours(path: &Path, as_of: DateTime<Utc>) -> Result<ParkHoursLookup> {
    let Some(mut reader) = open_reader(path)? else {
        return Ok(ParkHoursLookup::default());
    };
    let headers = reader
        .headers()
        .map_err(|e| ModelError::dimension(e.to_string()))?
        .clone();
    let col = |cands: &[&str]| header_position(&headers, cands);
    let (Some(date_col), Some(park_col), Some(open_col), Some(close_col)) = (
        col(&["park_date", "date"]),
        col(&["park_code", "park"]),
        col(&["opening_time", "open_time", "open"]),
        col(&["closing_time", "close_time", "close"]),
    ) else {
        return Err(ModelError::dimension(
            "dimparkhours_versioned missing date/park/open/close columns",
        ));
    };
    let version_col = col(&["version_type"]);
    let valid_from_col = col(&["valid_from"]);
    let valid_until_col = col(&["valid_until"]);
    let created_col = col(&["created_at"]);
    let emh_m_col = col(&["emh_morning"]);
    let emh_e_col = col(&["emh_evening"]);

    // (priority, -created_at) candidate per key; lower tuple wins.
    let mut best: BTreeMap<(String, NaiveDate), (u8, i64, ParkHours)> = BTreeMap::new();

    for record in reader.records() {
        let record = record.map_err(|e| ModelError::dimension(e.to_string()))?;
        let (Some(date_raw), Some(park), Some(open_raw), Some(close_raw)) = (
            record.get(date_col),
            record.get(park_col),
            record.get(open_col),
            record.get(close_col),
        ) else {
            continue;
        };
        let Ok(date) = date_raw.parse::<NaiveDate>() else {
            continue;
        };
        let (Some(open), Some(close)) = (parse_hhmm(open_raw), parse_hhmm(close_raw)) else {
            continue;
        };

        // Validity interval: valid_from <= as_of < valid_until.
        let parse_ts = |i: Option<usize>| {
            i.and_then(|i| record.get(i))
                .filter(|s| !s.is_empty())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };
        if let Some(from) = parse_ts(valid_from_col) {
            if from > as_of {
                continue;
            }
        }
        if let Some(until) = parse_ts(valid_until_col) {
            if until <= as_of {
                continue;
            }
        }

        let priority = version_col
            .and_then(|i| record.get(i))
            .map_or(99, version_priority);
        let created = parse_ts(created_col).map_or(0, |dt| dt.timestamp());
        let is_bool = |i: Option<usize>| {
            i.and_then(|i| record.get(i))
                .is_some_and(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "t"))
        };
        let hours = ParkHours {
            open_minutes: open,
            close_minutes: close,
            emh_morning: is_bool(emh_m_col),
            emh_evening: is_bool(emh_e_col),
        };

        let key = (park.to_lowercase(), date);
        let candidate = (priority, -created, hours);
        match best.get(&key) {
            Some((p, c, _)) if (*p, *c) <= (candidate.0, candidate.1) => {}
            _ => {
                best.insert(key, candidate);
            }
        }
    }

    let mut lookup = ParkHoursLookup::default();
    for ((park, date), (_, _, hours)) in best {
        lookup.rows.insert((park, date), hours);
    }
    Ok(lookup)
}

/// Parses `HH:MM`(`:SS`) into minutes since midnight.
fn parse_hhmm(raw: &str) -> Option<u32> {
    let mut parts = raw.trim().splitn(3, ':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    if hours <= 29 && minutes <= 59 {
        Some(hours * 60 + minutes)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).expect("write");
    }

    #[test]
    fn loads_all_tables() {
        let dir = TempDir::new().expect("tempdir");
        write(
            dir.path(),
            "dimentity.csv",
            "entity_code,park_code,has_priority_queue\nMK101,mk,false\nEP09,ep,true\n",
        );
        write(
            dir.path(),
            "dimdategroupid.csv",
            "park_date,date_group_id\n2026-06-15,42\n",
        );
        write(
            dir.path(),
            "dimseason.csv",
            "park_date,season,season_year\n2026-06-15,SUMMER,2026\n",
        );
        write(
            dir.path(),
            "dimparkhours_versioned.csv",
            "park_date,park_code,version_type,opening_time,closing_time,emh_morning,emh_evening\n\
             2026-06-15,ak,official,09:00,21:00,false,false\n",
        );

        let dims = Dimensions::load(dir.path(), Utc::now()).expect("load");
        assert!(!dims.has_priority_queue("MK101"));
        assert!(dims.has_priority_queue("EP09"));
        assert_eq!(
            dims.dategroup[&NaiveDate::from_ymd_opt(2026, 6, 15).unwrap()],
            42
        );
        assert_eq!(
            dims.season[&NaiveDate::from_ymd_opt(2026, 6, 15).unwrap()],
            ("SUMMER".to_string(), 2026)
        );
        let hours = dims
            .park_hours
            .get("ak", NaiveDate::from_ymd_opt(2026, 6, 15).unwrap())
            .expect("hours");
        assert_eq!(hours.open_minutes, 540);
        assert_eq!(hours.close_minutes, 1260);
    }

    #[test]
    fn missing_tables_load_empty() {
        let dir = TempDir::new().expect("tempdir");
        let dims = Dimensions::load(dir.path(), Utc::now()).expect("load");
        assert!(dims.entities.is_empty());
        assert!(dims.park_hours.is_empty());
    }

    #[test]
    fn version_priority_prefers_official_over_predicted() {
        let dir = TempDir::new().expect("tempdir");
        write(
            dir.path(),
            "dimparkhours_versioned.csv",
            "park_date,park_code,version_type,opening_time,closing_time,created_at\n\
             2026-06-15,mk,predicted,08:00,22:00,2026-01-01T00:00:00+00:00\n\
             2026-06-15,mk,official,09:00,21:00,2025-06-01T00:00:00+00:00\n",
        );
        let lookup =
            load_park_hours(&dir.path().join("dimparkhours_versioned.csv"), Utc::now())
                .expect("load");
        let hours = lookup
            .get("mk", NaiveDate::from_ymd_opt(2026, 6, 15).unwrap())
            .expect("hours");
        // Official wins despite being older.
        assert_eq!(hours.open_minutes, 540);
    }

    #[test]
    fn expired_versions_are_skipped() {
        let dir = TempDir::new().expect("tempdir");
        write(
            dir.path(),
            "dimparkhours_versioned.csv",
            "park_date,park_code,version_type,opening_time,closing_time,valid_from,valid_until\n\
             2026-06-15,mk,official,09:00,21:00,2020-01-01T00:00:00+00:00,2024-01-01T00:00:00+00:00\n\
             2026-06-15,mk,predicted,10:00,20:00,2020-01-01T00:00:00+00:00,\n",
        );
        let as_of = DateTime::parse_from_rfc3339("2026-01-01T00:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        let lookup =
            load_park_hours(&dir.path().join("dimparkhours_versioned.csv"), as_of).expect("load");
        let hours = lookup
            .get("mk", NaiveDate::from_ymd_opt(2026, 6, 15).unwrap())
            .expect("hours");
        // The official version expired; the open-ended predicted row wins.
        assert_eq!(hours.open_minutes, 600);
    }

    #[test]
    fn same_priority_newest_created_wins() {
        let dir = TempDir::new().expect("tempdir");
        write(
            dir.path(),
            "dimparkhours_versioned.csv",
            "park_date,park_code,version_type,opening_time,closing_time,created_at\n\
             2026-06-15,mk,official,08:00,22:00,2026-01-01T00:00:00+00:00\n\
             2026-06-15,mk,official,09:00,21:00,2025-06-01T00:00:00+00:00\n",
        );
        let lookup =
            load_park_hours(&dir.path().join("dimparkhours_versioned.csv"), Utc::now())
                .expect("load");
        let hours = lookup
            .get("mk", NaiveDate::from_ymd_opt(2026, 6, 15).unwrap())
            .expect("hours");
        assert_eq!(hours.open_minutes, 480);
    }
}
