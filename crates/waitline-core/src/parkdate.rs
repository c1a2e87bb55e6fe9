//! The 6 AM operational-date rule.
//!
//! A park's operational date extends past midnight: an observation before
//! 06:00 local time belongs to the previous calendar day. Because every
//! stored `observed_at` carries the park-local offset, the rule needs no
//! timezone lookup — the wall clock of the timestamp is already local.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Derives the park operational date from a park-local instant.
#[must_use]
pub fn park_date(observed_at: &DateTime<FixedOffset>) -> NaiveDate {
    let date = observed_at.date_naive();
    if observed_at.hour() < 6 {
        date.pred_opt().unwrap_or(date)
    } else {
        date
    }
}

/// Derives the park operational date for an arbitrary instant in a zone.
///
/// Used where only a UTC instant and the park's zone are at hand (the live
/// poller's window gate, the morning merge's notion of "yesterday").
#[must_use]
pub fn park_date_in_zone(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    let local = instant.with_timezone(&tz);
    let date = local.date_naive();
    if local.hour() < 6 {
        date.pred_opt().unwrap_or(date)
    } else {
        date
    }
}

/// Minutes since 06:00 local, wrapping the overnight hours onto the end of
/// the operational day: `((h·60 + m) − 360 + 1440) mod 1440`.
#[must_use]
pub fn mins_since_6am(observed_at: &DateTime<FixedOffset>) -> i32 {
    let h = i32::try_from(observed_at.hour()).unwrap_or(0);
    let m = i32::try_from(observed_at.minute()).unwrap_or(0);
    (h * 60 + m - 360).rem_euclid(1440)
}

/// The calendar-month folder name (`YYYY-MM`) for a park date.
#[must_use]
pub fn month_folder(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Stamps a naive park-local wall time with the zone's offset at that time.
///
/// Ambiguous times (the repeated DST hour) resolve to the earlier offset;
/// nonexistent times (the spring-forward gap) shift forward to the first
/// valid instant.
#[must_use]
pub fn localize(naive: chrono::NaiveDateTime, tz: Tz) -> DateTime<FixedOffset> {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.fixed_offset()
        }
        chrono::LocalResult::None => {
            // Spring-forward gap: step forward until the wall time exists.
            let mut probe = naive;
            loop {
                probe += chrono::Duration::minutes(1);
                if let chrono::LocalResult::Single(dt) = tz.from_local_datetime(&probe) {
                    return dt.fixed_offset();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).expect("timestamp")
    }

    #[test]
    fn six_am_rule_boundary() {
        // 05:59:59 belongs to the previous day; 06:00:00 to the same day.
        assert_eq!(
            park_date(&at("2024-03-11T05:59:59-04:00")),
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
        );
        assert_eq!(
            park_date(&at("2024-03-11T06:00:00-04:00")),
            NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
        );
    }

    #[test]
    fn early_morning_flips_date() {
        assert_eq!(
            park_date(&at("2024-03-11T03:15:00-04:00")),
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
        );
    }

    #[test]
    fn mins_since_6am_wraps_overnight() {
        assert_eq!(mins_since_6am(&at("2024-01-15T06:00:00-05:00")), 0);
        assert_eq!(mins_since_6am(&at("2024-01-15T10:30:00-05:00")), 270);
        // 01:00 local is 19 hours into the operational day.
        assert_eq!(mins_since_6am(&at("2024-01-15T01:00:00-05:00")), 1140);
    }

    #[test]
    fn localize_applies_offset() {
        let naive = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        let dt = localize(naive, chrono_tz::America::New_York);
        assert_eq!(dt.to_rfc3339(), "2024-01-15T10:30:00-05:00");
    }

    #[test]
    fn localize_handles_spring_forward_gap() {
        // 02:30 on 2024-03-10 does not exist in New York.
        let naive = NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(2, 30, 0)
            .unwrap();
        let dt = localize(naive, chrono_tz::America::New_York);
        assert_eq!(dt.offset().local_minus_utc(), -4 * 3600);
    }

    #[test]
    fn month_folder_format() {
        assert_eq!(
            month_folder(NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()),
            "2026-01"
        );
    }
}
