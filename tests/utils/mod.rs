use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use cohort_psm::{MatchingConfig, RecordBatch, StudyConfig};
use rand::prelude::*;

/// Covariates of the synthetic cohorts
pub const FEATURES: [&str; 3] = ["age", "bmi", "hba1c"];

/// Person ids of synthetic controls start here
pub const CONTROL_ID_OFFSET: i64 = 100_000;

/// Owned feature list for the matching API
#[must_use]
pub fn features() -> Vec<String> {
    FEATURES.iter().map(ToString::to_string).collect()
}

/// Matching configuration without a progress bar
#[must_use]
pub fn quiet_config() -> MatchingConfig {
    MatchingConfig::builder().show_progress(false).build()
}

/// Build a subject table from ids and nullable float columns
#[must_use]
pub fn cohort_batch(ids: &[i64], columns: &[(&str, Vec<Option<f64>>)]) -> RecordBatch {
    let mut fields = vec![Field::new("person_id", DataType::Int64, false)];
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(ids.to_vec()))];
    for (name, values) in columns {
        fields.push(Field::new(*name, DataType::Float64, true));
        arrays.push(Arc::new(Float64Array::from(values.clone())));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap()
}

/// Single-covariate table
#[must_use]
pub fn single_covariate(ids: &[i64], name: &str, values: &[f64]) -> RecordBatch {
    cohort_batch(ids, &[(name, values.iter().copied().map(Some).collect())])
}

/// Seeded treated and control cohorts with overlapping covariates
///
/// Treated covariates are shifted up by 40% of each covariate's range; about
/// 5% of values are missing.
#[must_use]
pub fn synthetic_cohorts(seed: u64, n_treated: usize, n_control: usize) -> (RecordBatch, RecordBatch) {
    let mut rng = StdRng::seed_from_u64(seed);

    let treated_ids: Vec<i64> = (1..=n_treated as i64).collect();
    let control_ids: Vec<i64> = (0..n_control as i64).map(|i| CONTROL_ID_OFFSET + i).collect();

    let treated = synthetic_arm(&mut rng, &treated_ids, 0.4);
    let control = synthetic_arm(&mut rng, &control_ids, 0.0);
    (treated, control)
}

fn synthetic_arm(rng: &mut StdRng, ids: &[i64], shift: f64) -> RecordBatch {
    let mut draw = |low: f64, high: f64| -> Vec<Option<f64>> {
        ids.iter()
            .map(|_| {
                if rng.random_bool(0.05) {
                    None
                } else {
                    Some(rng.random_range(low..high) + shift * (high - low))
                }
            })
            .collect()
    };

    let age = draw(30.0, 80.0);
    let bmi = draw(20.0, 40.0);
    let hba1c = draw(5.0, 10.0);
    cohort_batch(ids, &[("age", age), ("bmi", bmi), ("hba1c", hba1c)])
}

/// Study configuration rooted at `dir` with the synthetic features
#[must_use]
pub fn study_config(dir: &Path, cohort: &str) -> StudyConfig {
    let json = format!(
        r#"{{
            "cohort_name": "{cohort}",
            "output_dir": {},
            "matching_features": ["age", "bmi", "hba1c"],
            "matching": {{ "show_progress": false }}
        }}"#,
        serde_json::to_string(&dir.to_string_lossy()).unwrap()
    );
    StudyConfig::from_json_str(&json).unwrap()
}

/// Values of an integer column
#[must_use]
pub fn int_column(batch: &RecordBatch, name: &str) -> Vec<i64> {
    let column = arrow::compute::cast(batch.column_by_name(name).unwrap(), &DataType::Int64).unwrap();
    column
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap()
        .values()
        .to_vec()
}

/// Values of a float column; nulls become NaN
#[must_use]
pub fn float_column(batch: &RecordBatch, name: &str) -> Vec<f64> {
    let column =
        arrow::compute::cast(batch.column_by_name(name).unwrap(), &DataType::Float64).unwrap();
    let floats = column.as_any().downcast_ref::<Float64Array>().unwrap();
    (0..floats.len())
        .map(|i| if floats.is_null(i) { f64::NAN } else { floats.value(i) })
        .collect()
}

/// Header line of a CSV file
#[must_use]
pub fn csv_header(path: &Path) -> String {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}
