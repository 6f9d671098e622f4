use std::collections::BTreeMap;

use arrow::array::{Array, AsArray, UInt64Array};
use arrow::compute::{self, CastOptions};
use arrow::datatypes::{DataType, Schema, UInt64Type};
use arrow::record_batch::RecordBatch;

use crate::{Error, Result};

/// The only column the engine interprets.
pub const BLOCK_NUMBER: &str = "block_number";

/// Extract the `block_number` column of `batch` as `u64`s.
///
/// `offset` is the position of the batch's first row in its file, used to report malformed rows.
pub fn block_numbers(batch: &RecordBatch, offset: u64) -> Result<UInt64Array> {
    let column = batch
        .column_by_name(BLOCK_NUMBER)
        .ok_or_else(|| Error::malformed(offset, format!("missing `{BLOCK_NUMBER}` column")))?;

    let options = CastOptions {
        safe: false,
        ..Default::default()
    };

    let column = compute::cast_with_options(column, &DataType::UInt64, &options).map_err(|err| {
        // strict casts only report the offending value, find its row for a useful error
        let row = first_invalid_row(column.as_ref()).unwrap_or(0);
        Error::malformed(offset + row as u64, err.to_string())
    })?;

    let numbers = column.as_primitive::<UInt64Type>();

    if numbers.null_count() > 0 {
        let row = (0..numbers.len()).find(|&i| numbers.is_null(i)).unwrap_or(0);
        return Err(Error::malformed(offset + row as u64, format!("null `{BLOCK_NUMBER}`")));
    }

    Ok(numbers.clone())
}

/// Locate the first value of `column` that does not cast to `u64`.
fn first_invalid_row(column: &dyn Array) -> Option<usize> {
    let options = CastOptions {
        safe: true,
        ..Default::default()
    };

    // with safe casts, invalid values become nulls
    let lenient = compute::cast_with_options(column, &DataType::UInt64, &options).ok()?;

    (0..column.len()).find(|&i| lenient.is_null(i) && !column.is_null(i))
}

/// Column name to data type mapping, ignoring order and nullability.
pub fn column_set(schema: &Schema) -> BTreeMap<&str, &DataType> {
    schema.fields().iter().map(|field| (field.name().as_str(), field.data_type())).collect()
}

/// Check that `fetched` rows can be merged into a cache with the `cached` schema.
pub fn ensure_compatible(cached: &Schema, fetched: &Schema) -> Result<()> {
    if column_set(cached) == column_set(fetched) {
        return Ok(());
    }

    let names = |schema: &Schema| -> Vec<String> { schema.fields().iter().map(|field| field.name().clone()).collect() };

    Err(Error::SchemaMismatch {
        cached: names(cached),
        fetched: names(fetched),
    })
}

/// Reorder the columns of `batch` to follow `schema`.
pub fn conform(batch: &RecordBatch, schema: &Schema) -> Result<RecordBatch> {
    let source = batch.schema();

    let indices = schema
        .fields()
        .iter()
        .map(|field| source.index_of(field.name()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(batch.project(&indices)?)
}
