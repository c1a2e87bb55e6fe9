//! The canonical wait-time observation and its validation rules.
//!
//! Every fact row in the pipeline is one [`Observation`]: an entity code,
//! an instant with an explicit park-local offset, a wait-time kind, and a
//! signed minute count. Derived attributes (park code, park date) are never
//! stored inline; they are recomputed from these four fields.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Sentinel minute value for a sold-out PRIORITY observation.
pub const SOLD_OUT_MINUTES: i32 = 8888;

/// POSTED/ACTUAL observations at or above this value are flagged as outliers.
pub const OUTLIER_THRESHOLD_MINUTES: i32 = 300;

/// Timestamp format used in every CSV the pipeline writes.
///
/// The offset is always explicit (`-05:00`, `+09:00`); a `Z` suffix never
/// appears because the offset is the park's local zone.
pub const OBSERVED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// The three kinds of wait-time observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitTimeType {
    /// The wait time posted at the attraction entrance.
    Posted,
    /// A timed actual wait submitted by a rider.
    Actual,
    /// Minutes until a priority (return-window) reservation opens.
    Priority,
}

impl WaitTimeType {
    /// Returns the canonical uppercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Posted => "POSTED",
            Self::Actual => "ACTUAL",
            Self::Priority => "PRIORITY",
        }
    }
}

impl fmt::Display for WaitTimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaitTimeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "POSTED" => Ok(Self::Posted),
            "ACTUAL" => Ok(Self::Actual),
            "PRIORITY" => Ok(Self::Priority),
            other => Err(Error::parse(format!("unknown wait_time_type: {other}"))),
        }
    }
}

/// One canonical fact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Uppercase entity identifier, e.g. `MK101`.
    pub entity_code: String,
    /// Observation instant with the park's local offset.
    pub observed_at: DateTime<FixedOffset>,
    /// Which kind of wait time this row records.
    pub wait_time_type: WaitTimeType,
    /// Signed wait minutes; `8888` is the PRIORITY sold-out sentinel.
    pub wait_time_minutes: i32,
}

impl Observation {
    /// Creates an observation, normalizing the entity code to uppercase.
    #[must_use]
    pub fn new(
        entity_code: impl Into<String>,
        observed_at: DateTime<FixedOffset>,
        wait_time_type: WaitTimeType,
        wait_time_minutes: i32,
    ) -> Self {
        let mut entity_code = entity_code.into();
        entity_code.make_ascii_uppercase();
        Self {
            entity_code: entity_code.trim().to_string(),
            observed_at,
            wait_time_type,
            wait_time_minutes,
        }
    }

    /// Returns whether the minute value is inside the documented range for
    /// this observation's wait-time kind.
    ///
    /// POSTED/ACTUAL are valid in `[0, 1000]`; PRIORITY in
    /// `[-100, 2000]` plus the sold-out sentinel.
    #[must_use]
    pub fn in_valid_range(&self) -> bool {
        match self.wait_time_type {
            WaitTimeType::Posted | WaitTimeType::Actual => {
                (0..=1000).contains(&self.wait_time_minutes)
            }
            WaitTimeType::Priority => {
                (-100..=2000).contains(&self.wait_time_minutes)
                    || self.wait_time_minutes == SOLD_OUT_MINUTES
            }
        }
    }

    /// Returns whether the value is an in-range outlier (POSTED/ACTUAL ≥ 300).
    #[must_use]
    pub fn is_outlier(&self) -> bool {
        matches!(
            self.wait_time_type,
            WaitTimeType::Posted | WaitTimeType::Actual
        ) && self.wait_time_minutes >= OUTLIER_THRESHOLD_MINUTES
            && self.in_valid_range()
    }

    /// Returns whether this is a sold-out PRIORITY observation.
    #[must_use]
    pub fn is_sold_out(&self) -> bool {
        self.wait_time_type == WaitTimeType::Priority
            && self.wait_time_minutes == SOLD_OUT_MINUTES
    }

    /// The stable string serialization of `observed_at` (offset, never `Z`).
    #[must_use]
    pub fn observed_at_string(&self) -> String {
        self.observed_at.format(OBSERVED_AT_FORMAT).to_string()
    }

    /// The deduplication key of this row.
    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            entity_code: self.entity_code.clone(),
            observed_at: self.observed_at_string(),
            wait_time_type: self.wait_time_type,
            wait_time_minutes: self.wait_time_minutes,
        }
    }
}

/// The 4-tuple identity of a fact row, as stored in the dedup set.
///
/// The timestamp component is the canonical serialized form so that two
/// instants with the same wall time but different offsets remain distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    /// Uppercase entity identifier.
    pub entity_code: String,
    /// Serialized `observed_at` with offset.
    pub observed_at: String,
    /// Wait-time kind.
    pub wait_time_type: WaitTimeType,
    /// Minute value.
    pub wait_time_minutes: i32,
}

/// Parses an `observed_at` string, requiring an explicit offset.
///
/// # Errors
///
/// Returns a parse error if the string is not an RFC 3339-style timestamp
/// with an offset.
pub fn parse_observed_at(s: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s.trim())
        .or_else(|_| DateTime::parse_from_str(s.trim(), OBSERVED_AT_FORMAT))
        .map_err(|e| Error::parse(format!("bad observed_at {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).expect("timestamp")
    }

    #[test]
    fn entity_code_is_normalized() {
        let obs = Observation::new(" mk101 ", at("2024-01-15T10:30:00-05:00"), WaitTimeType::Posted, 35);
        assert_eq!(obs.entity_code, "MK101");
    }

    #[test]
    fn observed_at_never_serializes_z() {
        let tz = FixedOffset::east_opt(9 * 3600).expect("offset");
        let obs = Observation::new(
            "TDL05",
            tz.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap(),
            WaitTimeType::Actual,
            20,
        );
        assert_eq!(obs.observed_at_string(), "2024-07-01T12:00:00+09:00");
    }

    #[test]
    fn posted_range_bounds() {
        let mk = |m| Observation::new("MK101", at("2024-01-15T10:30:00-05:00"), WaitTimeType::Posted, m);
        assert!(mk(0).in_valid_range());
        assert!(mk(1000).in_valid_range());
        assert!(!mk(-1).in_valid_range());
        assert!(!mk(1001).in_valid_range());
        assert!(mk(300).is_outlier());
        assert!(!mk(299).is_outlier());
    }

    #[test]
    fn priority_sentinel_is_valid_but_8001_is_not() {
        let mk = |m| Observation::new("EP09", at("2024-01-15T10:30:00-05:00"), WaitTimeType::Priority, m);
        assert!(mk(SOLD_OUT_MINUTES).in_valid_range());
        assert!(mk(SOLD_OUT_MINUTES).is_sold_out());
        assert!(mk(1999).in_valid_range());
        assert!(!mk(8001).in_valid_range());
        assert!(mk(-100).in_valid_range());
        assert!(!mk(-101).in_valid_range());
    }

    #[test]
    fn round_trip_observed_at() {
        let s = "2024-03-11T03:15:00-04:00";
        let parsed = parse_observed_at(s).expect("parse");
        let obs = Observation::new("EP09", parsed, WaitTimeType::Actual, 12);
        assert_eq!(obs.observed_at_string(), s);
    }

    #[test]
    fn wait_type_parse_rejects_unknown() {
        assert!("POSTED".parse::<WaitTimeType>().is_ok());
        assert!("posted".parse::<WaitTimeType>().is_err());
    }
}
