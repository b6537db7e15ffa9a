//! Validation functions for the matching pipeline
//!
//! Structural checks on the two input tables before any statistic is fit.

use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashSet;

use crate::algorithm::matching::types::{Arm, PERSON_ID};
use crate::error::{PsmError, Result};
use crate::utils::arrow::person_ids;

/// Validate the treated and control tables and return their `person_id`s
///
/// # Errors
/// * `EmptyInputError` if the treated table has no rows
/// * `InvalidInput` if `person_id` is missing, null, duplicated within an
///   arm, or shared between the arms
pub fn validate_arms(treated: &RecordBatch, control: &RecordBatch) -> Result<(Vec<i64>, Vec<i64>)> {
    let treated_ids = person_ids(treated, Arm::Treated.label())?;
    let control_ids = person_ids(control, Arm::Control.label())?;

    if treated_ids.is_empty() {
        return Err(PsmError::EmptyInputError(
            "Treated table has no rows; there is nothing to match".to_string(),
        ));
    }

    let treated_set = unique_ids(&treated_ids, Arm::Treated)?;
    let control_set = unique_ids(&control_ids, Arm::Control)?;

    if let Some(shared) = treated_set.intersection(&control_set).min() {
        return Err(PsmError::InvalidInput(format!(
            "{PERSON_ID} {shared} appears in both the treated and the control table"
        )));
    }

    Ok((treated_ids, control_ids))
}

fn unique_ids(ids: &[i64], arm: Arm) -> Result<FxHashSet<i64>> {
    let mut seen = FxHashSet::with_capacity_and_hasher(ids.len(), Default::default());
    for &id in ids {
        if !seen.insert(id) {
            return Err(PsmError::InvalidInput(format!(
                "{PERSON_ID} {id} appears more than once in the {} table",
                arm.label()
            )));
        }
    }
    Ok(seen)
}
