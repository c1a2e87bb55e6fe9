//! Standby file parser.
//!
//! Standby files carry one row per observation with separate posted and
//! actual columns. Rows where both numerics are missing are dropped; a
//! surviving row emits up to two canonical records, one POSTED and one
//! ACTUAL, for whichever values are present and inside `[0, 1000]`.
//! Values outside the range are counted as invalid and dropped.

use bytes::Bytes;
use chrono::NaiveDateTime;
use chrono_tz::Tz;

use waitline_core::observation::{parse_observed_at, Observation, WaitTimeType};
use waitline_core::parkdate::localize;

use crate::error::{IngestError, Result};

/// One parsed chunk of canonical rows plus its parse accounting.
#[derive(Debug, Default)]
pub struct ParsedChunk {
    /// Canonical rows produced from the chunk.
    pub rows: Vec<Observation>,
    /// Input rows dropped because no usable value was present.
    pub dropped: u64,
    /// Values dropped for being outside the documented range.
    pub invalid: u64,
    /// Rows that failed to parse.
    pub parse_errors: u64,
}

/// Streams a standby file as chunks of canonical observations.
///
/// # Errors
///
/// Returns an unparseable error if the file has no usable header.
pub fn parse_standby(data: &Bytes, tz: Tz, chunksize: usize) -> Result<StandbyChunks> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(std::io::Cursor::new(data.clone()));

    let headers = reader
        .headers()
        .map_err(|e| IngestError::unparseable(format!("standby header: {e}")))?;
    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    };
    let entity_col = find("entity_code")
        .ok_or_else(|| IngestError::unparseable("standby file missing entity_code column"))?;
    let observed_col = find("observed_at")
        .ok_or_else(|| IngestError::unparseable("standby file missing observed_at column"))?;
    let posted_col = find("submitted_posted_time");
    let actual_col = find("submitted_actual_time");
    if posted_col.is_none() && actual_col.is_none() {
        return Err(IngestError::unparseable(
            "standby file has neither submitted_posted_time nor submitted_actual_time",
        ));
    }

    Ok(StandbyChunks {
        reader,
        tz,
        chunksize: chunksize.max(1),
        entity_col,
        observed_col,
        posted_col,
        actual_col,
        done: false,
    })
}

/// Iterator over parsed standby chunks.
pub struct StandbyChunks {
    reader: csv::Reader<std::io::Cursor<Bytes>>,
    tz: Tz,
    chunksize: usize,
    entity_col: usize,
    observed_col: usize,
    posted_col: Option<usize>,
    actual_col: Option<usize>,
    done: bool,
}

impl Iterator for StandbyChunks {
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
                    // A torn row is counted, not fatal to the file.
                    tracing::debug!(error = %e, "standby row read error");
                    chunk.parse_errors += 1;
                    consumed += 1;
                }
            }
        }
        if consumed == 0 {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}

impl StandbyChunks {
    fn parse_row(&self, record: &csv::StringRecord, chunk: &mut ParsedChunk) {
        let Some(entity) = record.get(self.entity_col).filter(|s| !s.is_empty()) else {
            chunk.dropped += 1;
            return;
        };
        let Some(observed_raw) = record.get(self.observed_col).filter(|s| !s.is_empty()) else {
            chunk.dropped += 1;
            return;
        };

        let posted = self
            .posted_col
            .and_then(|i| record.get(i))
            .and_then(parse_minutes);
        let actual = self
            .actual_col
            .and_then(|i| record.get(i))
            .and_then(parse_minutes);
        if posted.is_none() && actual.is_none() {
            chunk.dropped += 1;
            return;
        }

        let observed_at = match stamp_observed_at(observed_raw, self.tz) {
            Ok(dt) => dt,
            Err(_) => {
                chunk.parse_errors += 1;
                return;
            }
        };

        for (value, wait_type) in [
            (posted, WaitTimeType::Posted),
            (actual, WaitTimeType::Actual),
        ] {
            if let Some(minutes) = value {
                if (0..=1000).contains(&minutes) {
                    chunk
                        .rows
                        .push(Observation::new(entity, observed_at, wait_type, minutes));
                } else {
                    chunk.invalid += 1;
                }
            }
        }
    }
}

/// Parses a numeric wait value; empty or non-numeric yields `None`.
fn parse_minutes(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.round() as i32)
}

/// Stamps a raw timestamp with the park zone's offset.
///
/// Timestamps already carrying an offset are kept verbatim; naive wall
/// times are localized into the park zone.
pub fn stamp_observed_at(
    raw: &str,
    tz: Tz,
) -> waitline_core::Result<chrono::DateTime<chrono::FixedOffset>> {
    if let Ok(dt) = parse_observed_at(raw) {
        return Ok(dt);
    }
    let naive = parse_naive(raw)?;
    Ok(localize(naive, tz))
}

fn parse_naive(raw: &str) -> waitline_core::Result<NaiveDateTime> {
    let trimmed = raw.trim();
    for format in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(dt);
        }
    }
    Err(waitline_core::Error::parse(format!(
        "bad observed_at {trimmed:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TZ: Tz = chrono_tz::America::New_York;

    fn parse_all(text: &str) -> ParsedChunk {
        let mut total = ParsedChunk::default();
        for chunk in parse_standby(&Bytes::from(text.to_string()), TZ, 10).expect("open") {
            let chunk = chunk.expect("chunk");
            total.rows.extend(chunk.rows);
            total.dropped += chunk.dropped;
            total.invalid += chunk.invalid;
            total.parse_errors += chunk.parse_errors;
        }
        total
    }

    #[test]
    fn splits_posted_and_actual() {
        let out = parse_all(
            "entity_code,observed_at,submitted_posted_time,submitted_actual_time\n\
             MK101,2024-01-15T10:30:00,35,40\n",
        );
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0].wait_time_type, WaitTimeType::Posted);
        assert_eq!(out.rows[0].wait_time_minutes, 35);
        assert_eq!(out.rows[0].observed_at_string(), "2024-01-15T10:30:00-05:00");
        assert_eq!(out.rows[1].wait_time_type, WaitTimeType::Actual);
        assert_eq!(out.rows[1].wait_time_minutes, 40);
    }

    #[test]
    fn both_missing_drops_the_row() {
        let out = parse_all(
            "entity_code,observed_at,submitted_posted_time,submitted_actual_time\n\
             MK101,2024-01-15T10:30:00,,\n\
             MK101,2024-01-15T10:35:00,15,\n",
        );
        assert_eq!(out.dropped, 1);
        assert_eq!(out.rows.len(), 1);
    }

    #[test]
    fn out_of_range_counts_invalid() {
        let out = parse_all(
            "entity_code,observed_at,submitted_posted_time,submitted_actual_time\n\
             MK101,2024-01-15T10:30:00,1200,-5\n",
        );
        assert!(out.rows.is_empty());
        assert_eq!(out.invalid, 2);
    }

    #[test]
    fn header_case_is_insensitive() {
        let out = parse_all(
            "Entity_Code,Observed_At,Submitted_Posted_Time,Submitted_Actual_Time\n\
             mk101,2024-01-15T10:30:00,20,\n",
        );
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].entity_code, "MK101");
    }

    #[test]
    fn existing_offset_is_preserved() {
        let out = parse_all(
            "entity_code,observed_at,submitted_posted_time,submitted_actual_time\n\
             TDL05,2024-07-01T12:00:00+09:00,25,\n",
        );
        assert_eq!(out.rows[0].observed_at_string(), "2024-07-01T12:00:00+09:00");
    }

    #[test]
    fn chunking_respects_chunksize() {
        let mut text =
            String::from("entity_code,observed_at,submitted_posted_time,submitted_actual_time\n");
        for i in 0..5 {
            text.push_str(&format!("MK101,2024-01-15T10:3{i}:00,10,\n"));
        }
        let chunks: Vec<_> = parse_standby(&Bytes::from(text), TZ, 2)
            .expect("open")
            .collect::<Result<Vec<_>>>()
            .expect("chunks");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].rows.len(), 2);
        assert_eq!(chunks[2].rows.len(), 1);
    }

    #[test]
    fn missing_required_column_is_unparseable() {
        let err = parse_standby(
            &Bytes::from_static(b"foo,bar\n1,2\n"),
            TZ,
            10,
        )
        .err()
        .expect("error");
        assert!(!err.is_transient());
    }
}
