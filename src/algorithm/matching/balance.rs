//! Balance assessment for propensity score matching
//!
//! This module provides functions and structures for assessing the balance
//! of covariates between the treated and control groups, before and after
//! matching.

use std::fmt;

use arrow::datatypes::FieldRef;
use arrow::record_batch::RecordBatch;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_arrow::schema::{SchemaLike, TracingOptions};

use crate::algorithm::matching::types::{CovariateSchema, Diagnostic};
use crate::config::DEFAULT_IMBALANCE_THRESHOLD;
use crate::error::Result;
use crate::utils::arrow::float_values;
use crate::utils::stats;

/// Number of imbalanced covariates spelled out in the log
const MAX_LOGGED_IMBALANCED: usize = 5;

/// Balance between the arms for a single covariate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceMetric {
    /// Name of the covariate (column)
    pub feature: String,

    /// Mean in the treated group
    pub user_mean: f64,

    /// Mean in the control group
    pub non_user_mean: f64,

    /// Sample standard deviation in the treated group
    pub user_std: f64,

    /// Sample standard deviation in the control group
    pub non_user_std: f64,

    /// Absolute standardized mean difference
    pub smd: f64,
}

/// One row of the persisted balance table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    /// Covariate name
    pub feature: String,
    /// Mean in the treated group
    pub user_mean: f64,
    /// Mean in the control group
    pub non_user_mean: f64,
    /// Absolute standardized mean difference
    pub smd: f64,
}

impl From<&BalanceMetric> for BalanceRow {
    fn from(metric: &BalanceMetric) -> Self {
        Self {
            feature: metric.feature.clone(),
            user_mean: metric.user_mean,
            non_user_mean: metric.non_user_mean,
            smd: metric.smd,
        }
    }
}

/// Summary statistics for a balance report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSummary {
    /// Number of covariates with SMD above the threshold
    pub imbalanced_covariates: usize,

    /// Maximum SMD
    pub max_smd: f64,

    /// Mean SMD
    pub mean_smd: f64,

    /// Total number of covariates assessed
    pub total_covariates: usize,

    /// Threshold the summary was computed against
    pub threshold: f64,
}

/// Balance metrics ordered from most to least imbalanced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceReport {
    /// Balance metrics, descending by SMD
    pub metrics: Vec<BalanceMetric>,

    /// Summary statistics
    pub summary: BalanceSummary,
}

impl BalanceReport {
    /// Covariates whose SMD exceeds the threshold, worst first
    pub fn imbalanced(&self) -> impl Iterator<Item = &BalanceMetric> {
        let threshold = self.summary.threshold;
        self.metrics.iter().filter(move |m| m.smd > threshold)
    }

    /// One `ImbalancedCovariate` diagnostic per imbalanced covariate
    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.imbalanced()
            .map(|m| Diagnostic::ImbalancedCovariate {
                feature: m.feature.clone(),
                smd: m.smd,
            })
            .collect()
    }

    /// Log a warning naming the worst imbalanced covariates
    pub fn log_imbalance(&self) {
        let count = self.summary.imbalanced_covariates;
        if count == 0 {
            return;
        }

        warn!(
            "{count} covariates have SMD > {} after matching",
            self.summary.threshold
        );
        for metric in self.imbalanced().take(MAX_LOGGED_IMBALANCED) {
            warn!("  {}: SMD = {:.3}", metric.feature, metric.smd);
        }
    }

    /// The persisted table: `feature, user_mean, non_user_mean, smd`
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let rows: Vec<BalanceRow> = self.metrics.iter().map(BalanceRow::from).collect();
        let fields = Vec::<FieldRef>::from_type::<BalanceRow>(TracingOptions::default())?;
        Ok(serde_arrow::to_record_batch(&fields, &rows)?)
    }
}

impl fmt::Display for BalanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = &self.summary;
        writeln!(
            f,
            "Balance Summary:\n\
             - Total covariates: {}\n\
             - Imbalanced covariates (SMD > {}): {}\n\
             - Maximum SMD: {:.4}\n\
             - Mean SMD: {:.4}\n",
            summary.total_covariates,
            summary.threshold,
            summary.imbalanced_covariates,
            summary.max_smd,
            summary.mean_smd
        )?;

        writeln!(
            f,
            "{:<30} | {:>9} | {:>12} | {:>8} | {:>10} | {:>8}",
            "Covariate", "User Mean", "Non-user Mean", "User SD", "Non-user SD", "SMD"
        )?;
        writeln!(f, "{}", "-".repeat(92))?;

        for metric in &self.metrics {
            writeln!(
                f,
                "{:<30} | {:>9.4} | {:>12.4} | {:>8.4} | {:>10.4} | {:>8.4}",
                truncate_string(&metric.feature, 30),
                metric.user_mean,
                metric.non_user_mean,
                metric.user_std,
                metric.non_user_std,
                metric.smd
            )?;
        }

        Ok(())
    }
}

/// Calculator for balance metrics between treated and control groups
#[derive(Debug, Clone)]
pub struct BalanceCalculator {
    /// Threshold for marking a covariate as imbalanced
    imbalance_threshold: f64,
}

impl Default for BalanceCalculator {
    fn default() -> Self {
        Self {
            imbalance_threshold: DEFAULT_IMBALANCE_THRESHOLD,
        }
    }
}

impl BalanceCalculator {
    /// Create a new balance calculator with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set threshold for marking a covariate as imbalanced
    #[must_use]
    pub const fn with_imbalance_threshold(mut self, threshold: f64) -> Self {
        self.imbalance_threshold = threshold;
        self
    }

    /// Calculate balance for every schema covariate present in both tables
    ///
    /// Only non-missing values contribute. A covariate without a single
    /// observation in one of the arms is left out of the report, so two
    /// empty tables give an empty report.
    pub fn calculate_balance(
        &self,
        users: &RecordBatch,
        nonusers: &RecordBatch,
        schema: &CovariateSchema,
    ) -> Result<BalanceReport> {
        let mut metrics = Vec::with_capacity(schema.len());

        for feature in schema.iter() {
            let (Some(user_column), Some(nonuser_column)) = (
                users.column_by_name(feature),
                nonusers.column_by_name(feature),
            ) else {
                continue;
            };

            let user_values = observed(float_values(user_column)?);
            let nonuser_values = observed(float_values(nonuser_column)?);
            if user_values.is_empty() || nonuser_values.is_empty() {
                continue;
            }

            metrics.push(covariate_balance(feature, &user_values, &nonuser_values));
        }

        metrics.sort_by(|a, b| b.smd.total_cmp(&a.smd));

        let summary = self.calculate_summary_statistics(&metrics);
        Ok(BalanceReport { metrics, summary })
    }

    fn calculate_summary_statistics(&self, metrics: &[BalanceMetric]) -> BalanceSummary {
        let smds: Vec<f64> = metrics.iter().map(|m| m.smd).collect();

        BalanceSummary {
            imbalanced_covariates: smds
                .iter()
                .filter(|&&smd| smd > self.imbalance_threshold)
                .count(),
            max_smd: smds.iter().copied().fold(0.0, f64::max),
            mean_smd: stats::mean(&smds),
            total_covariates: metrics.len(),
            threshold: self.imbalance_threshold,
        }
    }
}

fn observed(values: Vec<Option<f64>>) -> Vec<f64> {
    values.into_iter().flatten().collect()
}

fn covariate_balance(feature: &str, users: &[f64], nonusers: &[f64]) -> BalanceMetric {
    let user_mean = stats::mean(users);
    let non_user_mean = stats::mean(nonusers);
    let user_var = stats::sample_variance(users);
    let non_user_var = stats::sample_variance(nonusers);

    let smd = match (user_var, non_user_var) {
        (Some(vt), Some(vc)) => standardized_difference(user_mean, non_user_mean, vt, vc),
        _ => 0.0,
    };

    BalanceMetric {
        feature: feature.to_string(),
        user_mean,
        non_user_mean,
        user_std: user_var.map_or(0.0, f64::sqrt),
        non_user_std: non_user_var.map_or(0.0, f64::sqrt),
        smd,
    }
}

/// |mean difference| over the pooled SD; 0 when the pooled SD is 0
fn standardized_difference(mean1: f64, mean2: f64, var1: f64, var2: f64) -> f64 {
    let pooled_std = ((var1 + var2) / 2.0).sqrt();

    if pooled_std > 0.0 {
        (mean1 - mean2).abs() / pooled_std
    } else {
        0.0
    }
}

/// Truncate a string to a maximum number of characters
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}
