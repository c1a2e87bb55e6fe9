//! Canonical CSV reading and writing.
//!
//! Every fact and staging file shares one format: a header row
//! `entity_code,observed_at,wait_time_type,wait_time_minutes`, rows sorted
//! by `observed_at`, UTF-8, newline-terminated. `observed_at` always
//! carries an explicit offset and never contains commas.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use waitline_core::observation::{parse_observed_at, Observation};

use crate::error::{Result, StoreError};

/// The canonical header columns.
pub const HEADER: [&str; 4] = [
    "entity_code",
    "observed_at",
    "wait_time_type",
    "wait_time_minutes",
];

/// Reads all observations from a canonical CSV file.
///
/// # Errors
///
/// Returns a CSV error on malformed rows or an unreadable file.
pub fn read_fact_file(path: &Path) -> Result<Vec<Observation>> {
    let file = File::open(path)
        .map_err(|e| StoreError::csv(format!("open {}: {e}", path.display())))?;
    read_fact_rows(BufReader::new(file))
}

/// Reads observations from any canonical CSV reader.
///
/// # Errors
///
/// Returns a CSV error on malformed rows.
pub fn read_fact_rows<R: Read>(reader: R) -> Result<Vec<Observation>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        rows.push(row_from_record(&record)?);
    }
    Ok(rows)
}

fn row_from_record(record: &csv::StringRecord) -> Result<Observation> {
    let entity_code = record
        .get(0)
        .ok_or_else(|| StoreError::csv("missing entity_code"))?;
    let observed_at = record
        .get(1)
        .ok_or_else(|| StoreError::csv("missing observed_at"))?;
    let wait_type = record
        .get(2)
        .ok_or_else(|| StoreError::csv("missing wait_time_type"))?;
    let minutes = record
        .get(3)
        .ok_or_else(|| StoreError::csv("missing wait_time_minutes"))?;

    Ok(Observation::new(
        entity_code,
        parse_observed_at(observed_at).map_err(StoreError::Core)?,
        wait_type.parse().map_err(StoreError::Core)?,
        minutes
            .parse::<f64>()
            .map_err(|e| StoreError::csv(format!("bad wait_time_minutes {minutes:?}: {e}")))?
            .round() as i32,
    ))
}

/// Writes a header plus rows to any writer.
///
/// # Errors
///
/// Returns a CSV error on write failure.
pub fn write_fact_rows<W: Write>(writer: W, rows: &[Observation]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(HEADER)?;
    for row in rows {
        write_row(&mut csv_writer, row)?;
    }
    csv_writer.flush().map_err(|e| StoreError::csv(e))?;
    Ok(())
}

/// Writes a single observation row (no header).
///
/// # Errors
///
/// Returns a CSV error on write failure.
pub fn write_row<W: Write>(csv_writer: &mut csv::Writer<W>, row: &Observation) -> Result<()> {
    csv_writer.write_record([
        row.entity_code.as_str(),
        row.observed_at_string().as_str(),
        row.wait_time_type.as_str(),
        row.wait_time_minutes.to_string().as_str(),
    ])?;
    Ok(())
}
