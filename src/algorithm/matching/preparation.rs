//! Feature preparation for propensity score matching
//!
//! Resolves the configured covariates against the columns actually present,
//! fills missing values with medians computed over both arms together, and
//! tags every row with its treatment flag.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int32Array};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema};
use itertools::Itertools;
use log::{info, warn};
use serde::Serialize;

use crate::algorithm::matching::types::{
    Arm, CovariateSchema, Diagnostic, RESERVED_COLUMNS, TREATMENT,
};
use crate::error::{PsmError, Result};
use crate::utils::arrow::{float_values, with_column};
use crate::utils::stats;

/// Median per covariate, computed once over the combined population
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImputationFit {
    medians: Vec<(String, f64)>,
}

impl ImputationFit {
    /// Median used to fill a covariate, if it is part of the fit
    #[must_use]
    pub fn median(&self, feature: &str) -> Option<f64> {
        self.medians
            .iter()
            .find(|(name, _)| name == feature)
            .map(|(_, median)| *median)
    }

    /// Iterate over (covariate, median) in schema order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.medians.iter().map(|(name, median)| (name.as_str(), *median))
    }
}

/// Treated and control tables ready for propensity modelling
#[derive(Debug, Clone)]
pub struct PreparedCohorts {
    /// Treated rows with imputed `Float64` covariates and `treatment = 1`
    pub treated: RecordBatch,
    /// Control rows with imputed `Float64` covariates and `treatment = 0`
    pub control: RecordBatch,
    /// Covariates available for matching
    pub schema: CovariateSchema,
    /// Medians used for imputation
    pub imputation: ImputationFit,
    /// Covariates dropped along the way
    pub diagnostics: Vec<Diagnostic>,
}

impl PreparedCohorts {
    /// The prepared table of one arm
    #[must_use]
    pub const fn arm(&self, arm: Arm) -> &RecordBatch {
        match arm {
            Arm::Treated => &self.treated,
            Arm::Control => &self.control,
        }
    }
}

/// Resolve configured covariate names against the columns of both tables
///
/// A covariate is available when it exists in at least one arm; the arm
/// lacking it is treated as entirely missing and imputed. Configured names
/// that exist nowhere are dropped silently, duplicates are ignored, and the
/// pipeline's own columns are never covariates.
///
/// # Errors
/// Returns `ConfigurationError` if nothing remains.
pub fn resolve_covariates(
    configured: &[String],
    treated: &Schema,
    control: &Schema,
) -> Result<CovariateSchema> {
    let mut names = Vec::with_capacity(configured.len());

    for name in configured.iter().unique() {
        if RESERVED_COLUMNS.contains(&name.as_str()) {
            warn!("Ignoring reserved column {name} in matching features");
            continue;
        }
        if treated.index_of(name).is_ok() || control.index_of(name).is_ok() {
            names.push(name.clone());
        }
    }

    let missing = configured
        .iter()
        .filter(|name| !names.contains(*name) && !RESERVED_COLUMNS.contains(&name.as_str()))
        .unique()
        .collect_vec();
    if !missing.is_empty() {
        info!(
            "Skipping {} configured features not present in the input: {}",
            missing.len(),
            missing.iter().join(", ")
        );
    }

    if names.is_empty() {
        return Err(PsmError::ConfigurationError(format!(
            "None of the {} configured matching features is present in the input tables",
            configured.len()
        )));
    }

    Ok(CovariateSchema::new(names))
}

/// Prepare treated and control tables for propensity modelling
///
/// Both returned tables keep every original column, carry identical
/// `Float64` covariate columns with no missing values, and gain a
/// `treatment` column.
pub fn prepare_cohorts(
    treated: &RecordBatch,
    control: &RecordBatch,
    configured: &[String],
) -> Result<PreparedCohorts> {
    let resolved = resolve_covariates(configured, &treated.schema(), &control.schema())?;

    let mut names = Vec::with_capacity(resolved.len());
    let mut medians = Vec::with_capacity(resolved.len());
    let mut treated_columns = Vec::with_capacity(resolved.len());
    let mut control_columns = Vec::with_capacity(resolved.len());
    let mut diagnostics = Vec::new();

    for feature in resolved.iter() {
        let treated_values = column_values(treated, feature)?;
        let control_values = column_values(control, feature)?;

        let observed = treated_values
            .iter()
            .chain(control_values.iter())
            .flatten()
            .copied()
            .collect_vec();

        let Some(median) = stats::median(&observed) else {
            let diagnostic = Diagnostic::UnusableCovariate {
                feature: feature.to_string(),
            };
            warn!("{diagnostic}");
            diagnostics.push(diagnostic);
            continue;
        };

        let missing = treated_values.len() + control_values.len() - observed.len();
        if missing > 0 {
            info!("Imputed {missing} missing values of {feature} with median {median:.4}");
        }

        names.push(feature.to_string());
        medians.push((feature.to_string(), median));
        treated_columns.push(impute(&treated_values, median));
        control_columns.push(impute(&control_values, median));
    }

    if names.is_empty() {
        return Err(PsmError::ConfigurationError(
            "No matching feature has any observed value".to_string(),
        ));
    }

    info!("Using {} features for matching", names.len());

    let schema = CovariateSchema::new(names);
    let treated = tag_arm(treated, &schema, treated_columns, Arm::Treated)?;
    let control = tag_arm(control, &schema, control_columns, Arm::Control)?;

    Ok(PreparedCohorts {
        treated,
        control,
        schema,
        imputation: ImputationFit { medians },
        diagnostics,
    })
}

/// Read a covariate from a table; a column the table lacks is all missing
fn column_values(batch: &RecordBatch, feature: &str) -> Result<Vec<Option<f64>>> {
    match batch.column_by_name(feature) {
        Some(column) => float_values(column),
        None => Ok(vec![None; batch.num_rows()]),
    }
}

fn impute(values: &[Option<f64>], median: f64) -> ArrayRef {
    Arc::new(Float64Array::from(
        values.iter().map(|v| v.unwrap_or(median)).collect_vec(),
    ))
}

/// Write imputed covariates and the treatment flag into a copy of `batch`
fn tag_arm(
    batch: &RecordBatch,
    schema: &CovariateSchema,
    columns: Vec<ArrayRef>,
    arm: Arm,
) -> Result<RecordBatch> {
    let mut tagged = batch.clone();
    for (feature, column) in schema.iter().zip(columns) {
        tagged = with_column(
            &tagged,
            Field::new(feature, DataType::Float64, false),
            column,
        )?;
    }

    let flags = Int32Array::from(vec![arm.treatment_flag(); batch.num_rows()]);
    with_column(
        &tagged,
        Field::new(TREATMENT, DataType::Int32, false),
        Arc::new(flags),
    )
}
