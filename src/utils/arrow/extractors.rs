//! Column extraction utilities for Arrow record batches
//!
//! Subject tables arrive with whatever types the CSV or Parquet reader
//! inferred. These helpers cast to the types the matching code works with.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema};

use crate::algorithm::matching::types::PERSON_ID;
use crate::error::{PsmError, Result};

/// Extract a column as optional `f64` values
///
/// Any numeric, boolean or string column is cast to `Float64`. Values that
/// cannot be parsed, nulls, NaN and infinities all come back as `None`.
pub fn float_values(array: &ArrayRef) -> Result<Vec<Option<f64>>> {
    let cast_array = cast(array, &DataType::Float64)?;
    let floats = cast_array
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| {
            PsmError::InvalidInput(format!(
                "Column of type {} could not be read as Float64",
                array.data_type()
            ))
        })?;

    Ok(floats
        .iter()
        .map(|value| value.filter(|v| v.is_finite()))
        .collect())
}

/// Extract the `person_id` column as `i64` values
///
/// # Errors
/// Returns `InvalidInput` if the column is missing, cannot be cast to an
/// integer, or contains nulls.
pub fn person_ids(batch: &RecordBatch, table: &str) -> Result<Vec<i64>> {
    let column = batch.column_by_name(PERSON_ID).ok_or_else(|| {
        PsmError::InvalidInput(format!("{table} table is missing the {PERSON_ID} column"))
    })?;

    let cast_array = cast(column, &DataType::Int64)?;
    let ids = cast_array
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| {
            PsmError::InvalidInput(format!(
                "{table} {PERSON_ID} column of type {} is not an integer column",
                column.data_type()
            ))
        })?;

    if ids.null_count() > 0 {
        return Err(PsmError::InvalidInput(format!(
            "{table} table has {} rows without a usable {PERSON_ID}",
            ids.null_count()
        )));
    }

    Ok(ids.values().to_vec())
}

/// Return a copy of `batch` with `field` set to `array`
///
/// An existing column of the same name is replaced in place; otherwise the
/// column is appended.
pub fn with_column(batch: &RecordBatch, field: Field, array: ArrayRef) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<Arc<Field>> = schema.fields().iter().cloned().collect();
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();

    match schema.index_of(field.name()) {
        Ok(idx) => {
            fields[idx] = Arc::new(field);
            columns[idx] = array;
        }
        Err(_) => {
            fields.push(Arc::new(field));
            columns.push(array);
        }
    }

    let schema = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));
    Ok(RecordBatch::try_new(schema, columns)?)
}
