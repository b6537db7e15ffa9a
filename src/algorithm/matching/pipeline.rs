//! Orchestration of a propensity score matching run
//!
//! [`PropensityMatcher`] takes the treated and control tables through
//! validation, feature preparation, propensity estimation, caliper matching
//! and balance evaluation. [`execute`] wraps it with loading and persistence
//! for one configured cohort.

use std::time::Instant;

use arrow::record_batch::RecordBatch;
use log::{info, warn};
use rustc_hash::FxHashSet;

use crate::algorithm::matching::balance::BalanceCalculator;
use crate::algorithm::matching::filtering::filter_by_person_ids;
use crate::algorithm::matching::matcher::CaliperMatcher;
use crate::algorithm::matching::preparation::prepare_cohorts;
use crate::algorithm::matching::propensity::estimate_propensity;
use crate::algorithm::matching::results::{MatchingResult, write_artifacts};
use crate::algorithm::matching::types::{Arm, Diagnostic};
use crate::algorithm::matching::validation::validate_arms;
use crate::config::{MatchingConfig, StudyConfig};
use crate::error::Result;
use crate::utils::io::read_table;
use crate::utils::logging::log_stage;

/// Matcher for pairing treated subjects with controls on the propensity score
#[derive(Debug, Clone)]
pub struct PropensityMatcher {
    /// Matching configuration
    config: MatchingConfig,
}

impl PropensityMatcher {
    /// Create a new matcher with the given configuration
    #[must_use]
    pub const fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    /// The configuration this matcher runs with
    #[must_use]
    pub const fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Perform matching between treated and control subjects
    ///
    /// # Arguments
    ///
    /// * `users` - treated subjects, one row per `person_id`
    /// * `nonusers` - candidate controls, one row per `person_id`
    /// * `features` - covariates to match on, in order
    ///
    /// # Errors
    ///
    /// Invalid parameters, an empty treated table, structural problems with
    /// `person_id`, or a covariate list that resolves to nothing. Everything
    /// else is reported through [`MatchingResult::diagnostics`].
    pub fn perform_matching(
        &self,
        users: &RecordBatch,
        nonusers: &RecordBatch,
        features: &[String],
    ) -> Result<MatchingResult> {
        let start_time = Instant::now();
        self.config.validate()?;

        let (treated_ids, control_ids) = validate_arms(users, nonusers)?;
        info!(
            "Matching {} treated subjects with a control pool of {} candidates",
            treated_ids.len(),
            control_ids.len()
        );

        let prepared = prepare_cohorts(users, nonusers, features)?;
        let mut diagnostics = prepared.diagnostics.clone();

        let scores = estimate_propensity(&prepared, &self.config)?;
        diagnostics.extend(scores.diagnostics.iter().cloned());

        let treated = scores.subjects(Arm::Treated)?;
        let controls = scores.subjects(Arm::Control)?;
        let outcome = CaliperMatcher::new(&self.config).match_subjects(&treated, &controls);
        info!("Caliper: {:.4}", outcome.caliper);

        if outcome.pairs.is_empty() {
            let diagnostic = Diagnostic::NoMatchWarning {
                treated: treated.len(),
                controls: controls.len(),
                caliper: outcome.caliper,
            };
            warn!("{diagnostic}");
            diagnostics.push(diagnostic);
        }

        let matched_user_ids: FxHashSet<i64> =
            outcome.pairs.iter().map(|p| p.user_person_id).collect();
        let matched_nonuser_ids: FxHashSet<i64> =
            outcome.pairs.iter().map(|p| p.nonuser_person_id).collect();

        let matched_users =
            filter_by_person_ids(&scores.treated, &matched_user_ids, Arm::Treated.label())?;
        let matched_nonusers =
            filter_by_person_ids(&scores.control, &matched_nonuser_ids, Arm::Control.label())?;

        let calculator =
            BalanceCalculator::new().with_imbalance_threshold(self.config.imbalance_threshold);
        let prematch_balance =
            calculator.calculate_balance(&prepared.treated, &prepared.control, &prepared.schema)?;
        let balance =
            calculator.calculate_balance(&matched_users, &matched_nonusers, &prepared.schema)?;

        balance.log_imbalance();
        diagnostics.extend(balance.diagnostics());

        let result = MatchingResult {
            matched_users,
            matched_nonusers,
            pairs: outcome.pairs,
            balance,
            prematch_balance,
            caliper: outcome.caliper,
            treated_count: treated.len(),
            control_count: controls.len(),
            schema: prepared.schema,
            imputation: prepared.imputation,
            model: scores.model,
            diagnostics,
            matching_time: start_time.elapsed(),
        };

        info!(
            "Matched {} pairs ({:.1}% of treated subjects) in {:.2?}",
            result.pairs.len(),
            100.0 * result.match_rate(),
            result.matching_time
        );

        Ok(result)
    }
}

/// Load, match and persist one configured cohort
///
/// Nothing is written unless the whole run succeeds.
pub fn execute(study: &StudyConfig) -> Result<MatchingResult> {
    study.validate()?;
    log_stage(&format!(
        "PROPENSITY SCORE MATCHING: {}",
        study.cohort_name.to_uppercase()
    ));

    let users = read_table(&study.users_path())?;
    let nonusers = read_table(&study.nonusers_path())?;
    info!("Loaded {} users, {} non-users", users.num_rows(), nonusers.num_rows());

    let matcher = PropensityMatcher::new(study.matching.clone());
    let result = matcher.perform_matching(&users, &nonusers, &study.matching_features)?;

    write_artifacts(
        &result,
        &study.cohort_name,
        &study.matched_pairs_dir(),
        matcher.config(),
    )?;

    log_stage(&format!(
        "MATCHING COMPLETE: {} pairs for {}",
        result.pairs.len(),
        study.cohort_name
    ));

    Ok(result)
}
