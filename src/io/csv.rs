//! Delimited text decoding, plus the CSV encoder used for lookup-table bodies.
//!
//! The header row supplies keys. Cells are typed conservatively: integers,
//! floats and `true`/`false` become JSON numbers and booleans, empty cells
//! are left out of the record, everything else stays a string. Positions
//! reported to the [`DecodeContext`] are 1-based data row numbers.

use super::DecodeContext;
use crate::error::{IngestError, Result};
use crate::record::Record;
use anyhow::Context;
use serde_json::{Number, Value};
use std::io::Read;

/// Stream rows from `reader` into `sink` as records.
///
/// # Errors
/// A header that cannot be read fails the input; malformed rows go through
/// the decode policy.
pub fn decode<R: Read>(
    reader: R,
    delimiter: u8,
    ctx: &mut DecodeContext,
    sink: &mut dyn FnMut(Record) -> bool,
) -> Result<()> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);
    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| IngestError::Decode {
            source_name: ctx.source_name().to_string(),
            position: 0,
            message: format!("unreadable header row: {e}"),
        })?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut row = csv::StringRecord::new();
    let mut position: u64 = 0;
    loop {
        position += 1;
        match rdr.read_record(&mut row) {
            Ok(false) => return Ok(()),
            Ok(true) => {
                if row.len() > headers.len() {
                    ctx.reject(
                        position,
                        format!("row has {} fields, header has {}", row.len(), headers.len()),
                    )?;
                    continue;
                }
                if !sink(row_to_record(&headers, &row)) {
                    return Ok(());
                }
            }
            Err(e) if e.is_io_error() => {
                return Err(IngestError::io(ctx.source_name(), into_io(e)));
            }
            Err(e) => ctx.reject(position, format!("malformed row: {e}"))?,
        }
    }
}

/// Decode an in-memory CSV document.
///
/// # Errors
/// As for [`decode`].
pub fn decode_str(text: &str, delimiter: u8, ctx: &mut DecodeContext) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    decode(text.as_bytes(), delimiter, ctx, &mut |r| {
        out.push(r);
        true
    })?;
    Ok(out)
}

fn into_io(e: csv::Error) -> std::io::Error {
    match e.into_kind() {
        csv::ErrorKind::Io(io) => io,
        other => std::io::Error::other(format!("{other:?}")),
    }
}

fn row_to_record(headers: &[String], row: &csv::StringRecord) -> Record {
    let mut record = Record::new();
    for (key, cell) in headers.iter().zip(row.iter()) {
        if cell.is_empty() {
            continue;
        }
        record.insert(key.clone(), type_cell(cell));
    }
    record
}

/// Best-effort typing of one cell.
#[must_use]
pub fn type_cell(cell: &str) -> Value {
    match cell {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    // Leading zeros are identifiers (zip codes, account numbers), not numbers.
    let digits = cell.strip_prefix('-').unwrap_or(cell);
    let leading_zero = digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.");
    if !leading_zero {
        if let Ok(i) = cell.parse::<i64>() {
            return Value::Number(i.into());
        }
        if cell.bytes().any(|b| b.is_ascii_digit())
            && !cell.eq_ignore_ascii_case("nan")
            && !cell.to_ascii_lowercase().contains("inf")
            && let Ok(f) = cell.parse::<f64>()
            && let Some(n) = Number::from_f64(f)
        {
            return Value::Number(n);
        }
    }
    Value::String(cell.to_string())
}

/// True if `text` has a header and at least one data row with a consistent
/// field count under `delimiter`.
pub(crate) fn is_csv(text: &str, delimiter: u8) -> bool {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(text.as_bytes());
    let width = match rdr.headers() {
        Ok(h) if h.len() > 1 => h.len(),
        _ => return false,
    };
    let mut rows = 0usize;
    for row in rdr.records() {
        match row {
            Ok(r) if r.len() == width => rows += 1,
            _ => return false,
        }
    }
    rows > 0
}

/// Encode records as CSV with a header row taken from the union of keys in
/// first-seen order. Nested values are written as compact JSON.
///
/// # Errors
/// Fails only if the CSV writer fails, which for an in-memory buffer means a
/// serialization bug.
pub fn encode_records(records: &[Record]) -> anyhow::Result<String> {
    let mut columns: Vec<&str> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }
    let mut wtr = csv::WriterBuilder::new().from_writer(Vec::new());
    wtr.write_record(&columns).context("write CSV header")?;
    for (i, record) in records.iter().enumerate() {
        let row: Vec<String> = columns
            .iter()
            .map(|c| match record.get(*c) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            })
            .collect();
        wtr.write_record(&row)
            .with_context(|| format!("write CSV row #{}", i + 1))?;
    }
    let bytes = wtr.into_inner().context("flush CSV writer")?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}
