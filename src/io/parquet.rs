//! Parquet decoding with JSON-safe value sanitization.
//!
//! Parquet needs random access to its footer, so a forward-only stream (a
//! cloud object, a compressed file) is buffered into [`Bytes`] first; local
//! files are read directly, one record batch of row groups at a time.
//!
//! Column values are made JSON-safe as they are converted:
//!
//! | Arrow type                    | JSON                                      |
//! |-------------------------------|-------------------------------------------|
//! | null                          | `null`                                    |
//! | boolean, ≤32-bit integers     | boolean / number                          |
//! | 64-bit integers               | number if `|v| ≤ 2^53`, otherwise string  |
//! | floats                        | number (`NaN`/`inf` become `null`)        |
//! | strings                       | string                                    |
//! | binary                        | lossy UTF-8 string                        |
//! | timestamps, dates, times      | ISO-8601 string                           |
//! | decimals, lists, structs, ... | their display string                      |

use super::DecodeContext;
use crate::error::{IngestError, Result};
use crate::record::Record;
use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type, Int64Type, UInt8Type,
    UInt16Type, UInt32Type, UInt64Type,
};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::reader::ChunkReader;
use serde_json::{Number, Value};
use std::fs::File;
use std::path::Path;

/// Largest integer magnitude a JSON consumer can hold exactly in a double.
pub const MAX_SAFE_INTEGER: i128 = 1 << 53;

const READ_BATCH_ROWS: usize = 8 * 1024;

/// Decode a local Parquet file.
///
/// # Errors
/// Fails if the file cannot be opened or is not valid Parquet.
pub fn decode_file(
    path: &Path,
    ctx: &mut DecodeContext,
    sink: &mut dyn FnMut(Record) -> bool,
) -> Result<()> {
    let file = File::open(path).map_err(|e| IngestError::io(path, e))?;
    decode_chunks(file, ctx, sink)
}

/// Decode a fully buffered Parquet object.
///
/// # Errors
/// Fails if the buffer is not valid Parquet.
pub fn decode_bytes(
    data: Bytes,
    ctx: &mut DecodeContext,
    sink: &mut dyn FnMut(Record) -> bool,
) -> Result<()> {
    decode_chunks(data, ctx, sink)
}

fn decode_chunks<T: ChunkReader + 'static>(
    input: T,
    ctx: &mut DecodeContext,
    sink: &mut dyn FnMut(Record) -> bool,
) -> Result<()> {
    let corrupt = |ctx: &DecodeContext, position: u64, e: &dyn std::fmt::Display| {
        IngestError::Decode {
            source_name: ctx.source_name().to_string(),
            position,
            message: format!("invalid parquet: {e}"),
        }
    };
    let reader = ParquetRecordBatchReaderBuilder::try_new(input)
        .and_then(|b| b.with_batch_size(READ_BATCH_ROWS).build())
        .map_err(|e| corrupt(ctx, 0, &e))?;

    let mut position: u64 = 0;
    for batch in reader {
        let batch = batch.map_err(|e| corrupt(ctx, position + 1, &e))?;
        let keep_going = emit_batch(&batch, &mut position, sink)
            .map_err(|e| corrupt(ctx, position + 1, &e))?;
        if !keep_going {
            return Ok(());
        }
    }
    Ok(())
}

/// Returns `Ok(false)` once the sink refuses a record.
fn emit_batch(
    batch: &RecordBatch,
    position: &mut u64,
    sink: &mut dyn FnMut(Record) -> bool,
) -> std::result::Result<bool, arrow::error::ArrowError> {
    let options = FormatOptions::default();
    let schema = batch.schema();
    let formatters = batch
        .columns()
        .iter()
        .map(|c| ArrayFormatter::try_new(c.as_ref(), &options))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for row in 0..batch.num_rows() {
        *position += 1;
        let mut record = Record::new();
        for (i, column) in batch.columns().iter().enumerate() {
            let value = sanitize(column.as_ref(), &formatters[i], row);
            record.insert(schema.field(i).name().clone(), value);
        }
        if !sink(record) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn wide_int(v: i128) -> Value {
    if v.abs() <= MAX_SAFE_INTEGER {
        // Both i64 and u64 inputs within 2^53 fit an i64.
        Value::Number(Number::from(v as i64))
    } else {
        Value::String(v.to_string())
    }
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn sanitize(array: &dyn Array, formatter: &ArrayFormatter<'_>, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }
    match array.data_type() {
        DataType::Null => Value::Null,
        DataType::Boolean => Value::Bool(array.as_boolean().value(row)),
        DataType::Int8 => array.as_primitive::<Int8Type>().value(row).into(),
        DataType::Int16 => array.as_primitive::<Int16Type>().value(row).into(),
        DataType::Int32 => array.as_primitive::<Int32Type>().value(row).into(),
        DataType::UInt8 => array.as_primitive::<UInt8Type>().value(row).into(),
        DataType::UInt16 => array.as_primitive::<UInt16Type>().value(row).into(),
        DataType::UInt32 => array.as_primitive::<UInt32Type>().value(row).into(),
        DataType::Int64 => wide_int(i128::from(array.as_primitive::<Int64Type>().value(row))),
        DataType::UInt64 => wide_int(i128::from(array.as_primitive::<UInt64Type>().value(row))),
        DataType::Float32 => float(f64::from(array.as_primitive::<Float32Type>().value(row))),
        DataType::Float64 => float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => Value::String(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::String(array.as_string::<i64>().value(row).to_string()),
        DataType::Utf8View => Value::String(array.as_string_view().value(row).to_string()),
        DataType::Binary => lossy(array.as_binary::<i32>().value(row)),
        DataType::LargeBinary => lossy(array.as_binary::<i64>().value(row)),
        DataType::BinaryView => lossy(array.as_binary_view().value(row)),
        DataType::FixedSizeBinary(_) => lossy(array.as_fixed_size_binary().value(row)),
        _ => Value::String(formatter.value(row).to_string()),
    }
}

fn lossy(bytes: &[u8]) -> Value {
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}
