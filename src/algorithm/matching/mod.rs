//! Propensity score matching of treated subjects to controls
//!
//! This module implements the matching core of the study flow:
//!
//! 1. Structural validation and feature preparation (median imputation)
//! 2. Propensity estimation with an L2-penalised logistic regression
//! 3. Greedy 1:1 nearest-neighbour matching within a caliper on the logit
//! 4. Covariate balance assessment before and after matching
//!
//! Matching is strictly sequential: the result depends on the order in which
//! treated subjects claim controls.

pub mod balance;
pub mod control_data;
pub mod filtering;
pub mod matcher;
pub mod pipeline;
pub mod preparation;
pub mod propensity;
pub mod results;
pub mod types;
pub mod validation;

// Re-export key types
pub use balance::{BalanceCalculator, BalanceMetric, BalanceReport, BalanceSummary};
pub use control_data::{ControlIndex, Neighbor};
pub use matcher::{CaliperMatcher, MatchOutcome, compute_caliper};
pub use pipeline::{PropensityMatcher, execute};
pub use preparation::{ImputationFit, PreparedCohorts, prepare_cohorts, resolve_covariates};
pub use propensity::{
    LogisticFit, LogisticRegression, PropensityModel, PropensityScores, Standardization,
    estimate_propensity, logit_clipped,
};
pub use results::{ArtifactPaths, MatchingResult, RunSummary, write_artifacts};
pub use types::{Arm, CovariateSchema, Diagnostic, MatchedPair, ScoredSubject};
