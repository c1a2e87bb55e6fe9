//! Fastpass (priority) file parsers.
//!
//! Both fastpass variants emit one PRIORITY record per input row, with
//! `wait_time_minutes` = minutes from the observation to the return-window
//! open. A raw return-hour value of 8000 or more is the sold-out encoding
//! and yields the 8888 sentinel verbatim.
//!
//! The new format has named columns and compact time encodings: a time
//! field may hold a plain hour, `HHMM`, or `HHMMSS`. The legacy format is
//! headerless — row 0 is an inter-file header, and the first eight
//! positional columns map to `FATTID, FDAY, FMONTH, FYEAR, FHOUR, FMIN,
//! FWINHR, FWINMIN`, with hours and minutes already separate. Dates are
//! day/month/year integers; a year outside 2000–2100 marks the wrong
//! convention and fails the row rather than producing a silent bad value.

use bytes::Bytes;
use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;

use waitline_core::observation::{Observation, WaitTimeType, SOLD_OUT_MINUTES};
use waitline_core::parkdate::localize;

use crate::error::{IngestError, Result};
use crate::standby::ParsedChunk;

/// Named fastpass columns in positional order.
const PRIO_COLS: [&str; 8] = [
    "FATTID", "FDAY", "FMONTH", "FYEAR", "FHOUR", "FMIN", "FWINHR", "FWINMIN",
];

/// Raw return-hour values at or above this encode a sold-out window.
const SOLD_OUT_RAW: i64 = 8000;

/// Return windows more than this far behind the observation roll to the
/// next day.
const ROLLOVER_SLACK_MINUTES: i64 = 15;

/// Streams a new-format (named-column) fastpass file.
///
/// # Errors
///
/// Returns an unparseable error if the header lacks the minimal columns.
pub fn parse_fastpass_new(data: &Bytes, tz: Tz, chunksize: usize) -> Result<FastpassChunks> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(std::io::Cursor::new(data.clone()));

    let headers = reader
        .headers()
        .map_err(|e| IngestError::unparseable(format!("fastpass header: {e}")))?;
    let mut columns = [None; 8];
    for (i, name) in PRIO_COLS.iter().enumerate() {
        columns[i] = headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name));
    }
    // FMIN and FWINMIN may be folded into the compact hour fields.
    let minimal = [0usize, 1, 2, 3, 4, 6];
    if minimal.iter().any(|&i| columns[i].is_none()) {
        return Err(IngestError::unparseable(
            "fastpass file missing required columns",
        ));
    }

    Ok(FastpassChunks {
        reader,
        tz,
        chunksize: chunksize.max(1),
        columns,
        legacy: false,
        done: false,
    })
}

/// Streams a legacy headerless fastpass file.
///
/// # Errors
///
/// Returns an unparseable error if the byte stream cannot be opened as CSV.
pub fn parse_fastpass_legacy(data: &Bytes, tz: Tz, chunksize: usize) -> Result<FastpassChunks> {
    let reader = csv::ReaderBuilder::new()
        // Row 0 is the inter-file header; telling the reader it is a
        // header row skips it without naming columns.
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(std::io::Cursor::new(data.clone()));

    Ok(FastpassChunks {
        reader,
        tz,
        chunksize: chunksize.max(1),
        columns: [
            Some(0),
            Some(1),
            Some(2),
            Some(3),
            Some(4),
            Some(5),
            Some(6),
            Some(7),
        ],
        legacy: true,
        done: false,
    })
}

/// Iterator over parsed fastpass chunks.
pub struct FastpassChunks {
    reader: csv::Reader<std::io::Cursor<Bytes>>,
    tz: Tz,
    chunksize: usize,
    /// Indices for `PRIO_COLS`, in that order.
    columns: [Option<usize>; 8],
    legacy: bool,
    done: bool,
}

impl Iterator for FastpassChunks {
    type Item = Result<ParsedChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = ParsedChunk::default();
        let mut consumed = 0usize;
        let mut record = csv::StringRecord::new();
        while consumed < self.chunksize {
            match self.reader.read_record(&mut record) {
                Ok(true) => {
                    consumed += 1;
                    self.parse_row(&record, &mut chunk);
                }
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "fastpass row read error");
                    chunk.parse_errors += 1;
                    consumed += 1;
                }
            }
        }
        if consumed == 0 {
            return None;
        }
        collapse_priority_keep_last(&mut chunk.rows);
        Some(Ok(chunk))
    }
}

impl FastpassChunks {
    fn parse_row(&self, record: &csv::StringRecord, chunk: &mut ParsedChunk) {
        match self.row_to_observation(record) {
            Ok(Some(row)) => chunk.rows.push(row),
            Ok(None) => chunk.dropped += 1,
            Err(_) => chunk.parse_errors += 1,
        }
    }

    fn field<'r>(&self, record: &'r csv::StringRecord, col: usize) -> Option<&'r str> {
        self.columns[col]
            .and_then(|i| record.get(i))
            .filter(|s| !s.is_empty())
    }

    fn int_field(&self, record: &csv::StringRecord, col: usize) -> Option<i64> {
        self.field(record, col)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .map(|v| v.round() as i64)
    }

    #[allow(clippy::similar_names)]
    fn row_to_observation(
        &self,
        record: &csv::StringRecord,
    ) -> std::result::Result<Option<Observation>, ()> {
        let Some(entity) = self.field(record, 0) else {
            return Ok(None);
        };

        let day = self.int_field(record, 1).ok_or(())?;
        let month = self.int_field(record, 2).ok_or(())?;
        let year = self.int_field(record, 3).ok_or(())?;
        // A year like 2813 means the positional convention is wrong.
        if !(2000..=2100).contains(&year) {
            return Err(());
        }
        let date = NaiveDate::from_ymd_opt(
            i32::try_from(year).map_err(|_| ())?,
            u32::try_from(month).map_err(|_| ())?,
            u32::try_from(day).map_err(|_| ())?,
        )
        .ok_or(())?;

        let raw_obs_hour = self.int_field(record, 4).unwrap_or(0);
        let raw_ret_hour = self.int_field(record, 6).unwrap_or(0);
        let fallback_obs_min = self.int_field(record, 5);
        let fallback_ret_min = self.int_field(record, 7);

        let (obs_hour, obs_min) = if self.legacy {
            (raw_obs_hour, fallback_obs_min.unwrap_or(0))
        } else {
            split_compact_time(raw_obs_hour, fallback_obs_min)
        };
        let (ret_hour, ret_min) = if self.legacy {
            (raw_ret_hour, fallback_ret_min.unwrap_or(0))
        } else {
            split_compact_time(raw_ret_hour, fallback_ret_min)
        };

        let obs_naive = date
            .and_hms_opt(
                u32::try_from(obs_hour.clamp(0, 23)).map_err(|_| ())?,
                u32::try_from(obs_min.clamp(0, 59)).map_err(|_| ())?,
                0,
            )
            .ok_or(())?;
        let observed_at = localize(obs_naive, self.tz);

        let minutes = if raw_ret_hour >= SOLD_OUT_RAW {
            SOLD_OUT_MINUTES
        } else {
            let mut ret_naive = date
                .and_hms_opt(
                    u32::try_from(ret_hour.clamp(0, 23)).map_err(|_| ())?,
                    u32::try_from(ret_min.clamp(0, 59)).map_err(|_| ())?,
                    0,
                )
                .ok_or(())?;
            // Return windows shortly before the observation are clock noise;
            // anything earlier means the window opens tomorrow.
            if ret_naive - obs_naive < Duration::minutes(-ROLLOVER_SLACK_MINUTES) {
                ret_naive += Duration::days(1);
            }
            i32::try_from((ret_naive - obs_naive).num_minutes()).map_err(|_| ())?
        };

        Ok(Some(Observation::new(
            entity,
            observed_at,
            WaitTimeType::Priority,
            minutes,
        )))
    }
}

/// Splits a compact time value into hour and minute.
///
/// `HHMMSS` (≥ 10000) and `HHMM` (≥ 100) carry their own minutes; a plain
/// hour falls back to the separate minute column.
fn split_compact_time(value: i64, fallback_minute: Option<i64>) -> (i64, i64) {
    if value >= 10_000 {
        (value / 10_000, (value % 10_000) / 100)
    } else if value >= 100 {
        (value / 100, value % 100)
    } else {
        (value, fallback_minute.unwrap_or(0))
    }
}

/// Keeps the last PRIORITY row per `(entity_code, observed_at)`.
///
/// Later submissions supersede earlier ones inside a chunk; ordering of
/// the survivors follows `(entity, observed_at)`.
fn collapse_priority_keep_last(rows: &mut Vec<Observation>) {
    if rows.len() < 2 {
        return;
    }
    let mut last: std::collections::BTreeMap<(String, String), Observation> =
        std::collections::BTreeMap::new();
    for row in rows.drain(..) {
        last.insert(
            (row.entity_code.clone(), row.observed_at_string()),
            row,
        );
    }
    rows.extend(last.into_values());
}

#[cfg(test)]
mod tests {
    use super::*;

    const TZ: Tz = chrono_tz::America::New_York;

    fn parse_all(chunks: FastpassChunks) -> ParsedChunk {
        let mut total = ParsedChunk::default();
        for chunk in chunks {
            let chunk = chunk.expect("chunk");
            total.rows.extend(chunk.rows);
            total.dropped += chunk.dropped;
            total.invalid += chunk.invalid;
            total.parse_errors += chunk.parse_errors;
        }
        total
    }

    #[test]
    fn new_format_basic_window() {
        let text = "FATTID,FDAY,FMONTH,FYEAR,FHOUR,FMIN,FWINHR,FWINMIN\n\
                    MK101,15,1,2024,10,30,11,15\n";
        let out = parse_all(parse_fastpass_new(&Bytes::from(text.to_string()), TZ, 10).unwrap());
        assert_eq!(out.rows.len(), 1);
        let row = &out.rows[0];
        assert_eq!(row.wait_time_type, WaitTimeType::Priority);
        assert_eq!(row.wait_time_minutes, 45);
        assert_eq!(row.observed_at_string(), "2024-01-15T10:30:00-05:00");
    }

    #[test]
    fn sold_out_sentinel_at_8000() {
        let text = "FATTID,FDAY,FMONTH,FYEAR,FHOUR,FMIN,FWINHR,FWINMIN\n\
                    MK101,15,1,2024,10,30,8001,0\n\
                    MK102,15,1,2024,10,30,7,59\n";
        let out = parse_all(parse_fastpass_new(&Bytes::from(text.to_string()), TZ, 10).unwrap());
        assert_eq!(out.rows[0].wait_time_minutes, SOLD_OUT_MINUTES);
        // 07:59 is a plain early-morning window, not a sentinel: it rolls
        // over to the next day because it precedes the observation.
        assert!(out.rows[1].wait_time_minutes > 0);
        assert_ne!(out.rows[1].wait_time_minutes, SOLD_OUT_MINUTES);
    }

    #[test]
    fn compact_hhmm_times() {
        let text = "FATTID,FDAY,FMONTH,FYEAR,FHOUR,FMIN,FWINHR,FWINMIN\n\
                    EP09,15,1,2024,1030,0,1130,0\n";
        let out = parse_all(parse_fastpass_new(&Bytes::from(text.to_string()), TZ, 10).unwrap());
        assert_eq!(out.rows[0].observed_at_string(), "2024-01-15T10:30:00-05:00");
        assert_eq!(out.rows[0].wait_time_minutes, 60);
    }

    #[test]
    fn compact_hhmmss_times() {
        let text = "FATTID,FDAY,FMONTH,FYEAR,FHOUR,FMIN,FWINHR,FWINMIN\n\
                    EP09,15,1,2024,103045,0,113000,0\n";
        let out = parse_all(parse_fastpass_new(&Bytes::from(text.to_string()), TZ, 10).unwrap());
        assert_eq!(out.rows[0].observed_at_string(), "2024-01-15T10:30:00-05:00");
        assert_eq!(out.rows[0].wait_time_minutes, 60);
    }

    #[test]
    fn day_rollover_for_next_morning_window() {
        // Observed 23:30, window opens 09:00 — that is tomorrow morning.
        let text = "FATTID,FDAY,FMONTH,FYEAR,FHOUR,FMIN,FWINHR,FWINMIN\n\
                    MK101,15,1,2024,23,30,9,0\n";
        let out = parse_all(parse_fastpass_new(&Bytes::from(text.to_string()), TZ, 10).unwrap());
        assert_eq!(out.rows[0].wait_time_minutes, 9 * 60 + 30);
    }

    #[test]
    fn keep_last_collapses_duplicate_timestamps() {
        let text = "FATTID,FDAY,FMONTH,FYEAR,FHOUR,FMIN,FWINHR,FWINMIN\n\
                    MK101,15,1,2024,10,30,11,0\n\
                    MK101,15,1,2024,10,30,12,0\n";
        let out = parse_all(parse_fastpass_new(&Bytes::from(text.to_string()), TZ, 10).unwrap());
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].wait_time_minutes, 90);
    }

    #[test]
    fn legacy_positional_format() {
        // Headerless: row 0 is the inter-file header and is skipped.
        let text = "h0,h1,h2,h3,h4,h5,h6,h7\n\
                    AK01,10,6,2016,9,15,10,0\n";
        let out = parse_all(parse_fastpass_legacy(&Bytes::from(text.to_string()), TZ, 10).unwrap());
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].entity_code, "AK01");
        assert_eq!(out.rows[0].wait_time_minutes, 45);
        assert_eq!(out.rows[0].observed_at_string(), "2016-06-10T09:15:00-04:00");
    }

    #[test]
    fn legacy_does_not_normalize_compact_times() {
        // Hour column 1030 in the legacy layout is not a compact HHMM; it
        // clamps to 23 and therefore the row is suspect but still bounded.
        let text = "h0,h1,h2,h3,h4,h5,h6,h7\n\
                    AK01,10,6,2016,1030,0,11,0\n";
        let out = parse_all(parse_fastpass_legacy(&Bytes::from(text.to_string()), TZ, 10).unwrap());
        assert_eq!(out.rows.len(), 1);
        assert!(out.rows[0].observed_at_string().starts_with("2016-06-10T23:00:00"));
    }

    #[test]
    fn pathological_year_is_a_row_error() {
        let text = "h0,h1,h2,h3,h4,h5,h6,h7\n\
                    AK01,10,6,2813,9,15,10,0\n\
                    AK01,10,6,2016,9,15,10,0\n";
        let out = parse_all(parse_fastpass_legacy(&Bytes::from(text.to_string()), TZ, 10).unwrap());
        assert_eq!(out.parse_errors, 1);
        assert_eq!(out.rows.len(), 1);
    }

    #[test]
    fn bad_month_is_a_row_error() {
        let text = "FATTID,FDAY,FMONTH,FYEAR,FHOUR,FMIN,FWINHR,FWINMIN\n\
                    MK101,15,13,2024,10,30,11,0\n";
        let out = parse_all(parse_fastpass_new(&Bytes::from(text.to_string()), TZ, 10).unwrap());
        assert_eq!(out.parse_errors, 1);
        assert!(out.rows.is_empty());
    }
}
