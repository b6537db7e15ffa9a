//! Filtering utilities for the matching pipeline
//!
//! Selects the matched rows of a scored table by `person_id`.

use arrow::array::BooleanArray;
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashSet;

use crate::error::Result;
use crate::utils::arrow::person_ids;

/// Keep the rows whose `person_id` is in `keep`, preserving table order
///
/// # Errors
/// Returns an error if the batch has no usable `person_id` column or the
/// filter kernel fails
pub fn filter_by_person_ids(
    batch: &RecordBatch,
    keep: &FxHashSet<i64>,
    table: &str,
) -> Result<RecordBatch> {
    let ids = person_ids(batch, table)?;
    let mask: BooleanArray = ids.iter().map(|id| Some(keep.contains(id))).collect();
    Ok(filter_record_batch(batch, &mask)?)
}
