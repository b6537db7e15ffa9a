//! Result assembly and persistence for a matching run
//!
//! Every artifact is rendered in memory first; files are only written once
//! all of them were produced, so a failed run leaves no partial output.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arrow::datatypes::FieldRef;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_arrow::schema::{SchemaLike, TracingOptions};

use crate::algorithm::matching::balance::{BalanceReport, BalanceSummary};
use crate::algorithm::matching::preparation::ImputationFit;
use crate::algorithm::matching::propensity::PropensityModel;
use crate::algorithm::matching::types::{CovariateSchema, Diagnostic, MatchedPair};
use crate::config::MatchingConfig;
use crate::error::{PsmError, Result};
use crate::utils::io::write_csv;
use crate::utils::logging::log_artifact_written;

/// Everything a matching run produces
#[derive(Debug, Clone)]
pub struct MatchingResult {
    /// Matched treated rows in treated table order
    pub matched_users: RecordBatch,
    /// Matched control rows in control table order
    pub matched_nonusers: RecordBatch,
    /// Accepted pairs in the order they were formed
    pub pairs: Vec<MatchedPair>,
    /// Post-match balance
    pub balance: BalanceReport,
    /// Balance of the full prepared arms
    pub prematch_balance: BalanceReport,
    /// Caliper in force
    pub caliper: f64,
    /// Treated subjects offered to the matcher
    pub treated_count: usize,
    /// Size of the control pool
    pub control_count: usize,
    /// Covariates the run matched on
    pub schema: CovariateSchema,
    /// Medians used to fill missing covariate values
    pub imputation: ImputationFit,
    /// Fitted propensity model; `None` for an empty control pool
    pub model: Option<PropensityModel>,
    /// Non-fatal findings in the order they occurred
    pub diagnostics: Vec<Diagnostic>,
    /// Wall time of the run
    pub matching_time: Duration,
}

impl MatchingResult {
    /// Share of treated subjects that found a partner
    #[must_use]
    pub fn match_rate(&self) -> f64 {
        if self.treated_count == 0 {
            0.0
        } else {
            self.pairs.len() as f64 / self.treated_count as f64
        }
    }

    /// The pair table: `user_person_id, nonuser_person_id, ps_distance`
    pub fn pairs_batch(&self) -> Result<RecordBatch> {
        let fields = Vec::<FieldRef>::from_type::<MatchedPair>(TracingOptions::default())?;
        Ok(serde_arrow::to_record_batch(&fields, &self.pairs)?)
    }
}

/// File locations of one cohort's matching artifacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPaths {
    /// Matched treated rows
    pub matched_users: PathBuf,
    /// Matched control rows
    pub matched_nonusers: PathBuf,
    /// Pair table
    pub pairs: PathBuf,
    /// Post-match balance
    pub balance: PathBuf,
    /// Pre-match balance
    pub balance_prematch: PathBuf,
    /// Run summary
    pub summary: PathBuf,
}

impl ArtifactPaths {
    /// Paths under `dir`, prefixed with the cohort name
    #[must_use]
    pub fn for_cohort(dir: &Path, cohort: &str) -> Self {
        let file = |suffix: &str| dir.join(format!("{cohort}_{suffix}"));
        Self {
            matched_users: file("matched_users.csv"),
            matched_nonusers: file("matched_nonusers.csv"),
            pairs: file("match_pairs.csv"),
            balance: file("balance_stats.csv"),
            balance_prematch: file("balance_prematch.csv"),
            summary: file("matching_summary.json"),
        }
    }
}

/// Machine-readable description of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Cohort the run belongs to
    pub cohort_name: String,
    /// When the summary was produced
    pub created_at: DateTime<Utc>,
    /// Treated subjects offered to the matcher
    pub treated_count: usize,
    /// Size of the control pool
    pub control_count: usize,
    /// Number of accepted pairs
    pub matched_pairs: usize,
    /// Share of treated subjects matched
    pub match_rate: f64,
    /// Caliper in force
    pub caliper: f64,
    /// Multiplier the caliper was derived from
    pub caliper_multiplier: f64,
    /// Covariates matched on
    pub features: CovariateSchema,
    /// Newton iterations of the propensity model
    pub model_iterations: Option<usize>,
    /// Whether the propensity model converged
    pub model_converged: Option<bool>,
    /// Imputation medians
    pub imputation: ImputationFit,
    /// Standardization and coefficients of the propensity model
    pub model: Option<PropensityModel>,
    /// Post-match balance summary
    pub balance: BalanceSummary,
    /// Pre-match balance summary
    pub prematch_balance: BalanceSummary,
    /// Diagnostic messages
    pub diagnostics: Vec<String>,
    /// Wall time in seconds
    pub elapsed_seconds: f64,
}

impl RunSummary {
    /// Summarize a run
    #[must_use]
    pub fn new(cohort_name: &str, result: &MatchingResult, config: &MatchingConfig) -> Self {
        Self {
            cohort_name: cohort_name.to_string(),
            created_at: Utc::now(),
            treated_count: result.treated_count,
            control_count: result.control_count,
            matched_pairs: result.pairs.len(),
            match_rate: result.match_rate(),
            caliper: result.caliper,
            caliper_multiplier: config.caliper_multiplier,
            features: result.schema.clone(),
            model_iterations: result.model.as_ref().map(|m| m.fit.iterations),
            model_converged: result.model.as_ref().map(|m| m.fit.converged),
            imputation: result.imputation.clone(),
            model: result.model.clone(),
            balance: result.balance.summary.clone(),
            prematch_balance: result.prematch_balance.summary.clone(),
            diagnostics: result.diagnostics.iter().map(ToString::to_string).collect(),
            elapsed_seconds: result.matching_time.as_secs_f64(),
        }
    }
}

/// Write every artifact of a run into `dir`
///
/// # Errors
/// Fails before touching the filesystem if any artifact cannot be rendered.
pub fn write_artifacts(
    result: &MatchingResult,
    cohort_name: &str,
    dir: &Path,
    config: &MatchingConfig,
) -> Result<ArtifactPaths> {
    let paths = ArtifactPaths::for_cohort(dir, cohort_name);

    let pairs = result.pairs_batch()?;
    let balance = result.balance.to_record_batch()?;
    let prematch = result.prematch_balance.to_record_batch()?;
    let summary = serde_json::to_string_pretty(&RunSummary::new(cohort_name, result, config))?;

    log::debug!("Writing matching results to {}", dir.display());
    fs::create_dir_all(dir).map_err(|e| PsmError::io(dir, e))?;

    let tables = [
        ("matched users", &paths.matched_users, &result.matched_users),
        ("matched non-users", &paths.matched_nonusers, &result.matched_nonusers),
        ("match pairs", &paths.pairs, &pairs),
        ("balance statistics", &paths.balance, &balance),
        ("pre-match balance", &paths.balance_prematch, &prematch),
    ];
    for (artifact, path, batch) in tables {
        write_csv(path, batch)?;
        log_artifact_written(artifact, path, Some(batch.num_rows()));
    }

    fs::write(&paths.summary, summary).map_err(|e| PsmError::io(&paths.summary, e))?;
    log_artifact_written("run summary", &paths.summary, None);

    Ok(paths)
}
