//! Type definitions for propensity score matching
//!
//! This module contains the column names, value objects and diagnostics
//! shared by every stage of a matching run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Subject identifier column
pub const PERSON_ID: &str = "person_id";
/// Treatment indicator column (1 = treated, 0 = control)
pub const TREATMENT: &str = "treatment";
/// Estimated probability of treatment
pub const PROPENSITY: &str = "propensity";
/// Logit of the clipped propensity
pub const LOGIT_PROPENSITY: &str = "logit_propensity";

/// Columns produced by the pipeline itself; never used as covariates
pub const RESERVED_COLUMNS: [&str; 4] = [PERSON_ID, TREATMENT, PROPENSITY, LOGIT_PROPENSITY];

/// Which side of the comparison a table belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arm {
    /// Exposed subjects (users)
    Treated,
    /// Unexposed subjects (non-users)
    Control,
}

impl Arm {
    /// Value of the `treatment` column for this arm
    #[must_use]
    pub const fn treatment_flag(self) -> i32 {
        match self {
            Self::Treated => 1,
            Self::Control => 0,
        }
    }

    /// Human-readable label used in logs and errors
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Treated => "treated",
            Self::Control => "control",
        }
    }
}

/// The covariates a run matches on, resolved once during preparation
///
/// Every later stage reads covariates through this value rather than
/// re-inspecting table columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovariateSchema {
    names: Vec<String>,
}

impl CovariateSchema {
    /// Create a schema from an ordered list of covariate names
    #[must_use]
    pub const fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Covariate names in matching order
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Iterate over covariate names
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Number of covariates
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the schema has no covariates
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A subject reduced to what the matcher needs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredSubject {
    /// Subject identifier
    pub person_id: i64,
    /// Logit of the clipped propensity score
    pub logit_propensity: f64,
}

impl ScoredSubject {
    /// Create a scored subject
    #[must_use]
    pub const fn new(person_id: i64, logit_propensity: f64) -> Self {
        Self {
            person_id,
            logit_propensity,
        }
    }
}

/// Accepted pair of a treated subject and a control subject
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    /// Treated subject
    pub user_person_id: i64,
    /// Control subject
    pub nonuser_person_id: i64,
    /// Absolute difference in logit propensity
    pub ps_distance: f64,
}

/// Non-fatal findings of a matching run
///
/// The core never decides how these are reported; the pipeline logs them
/// and returns them to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The propensity model stopped at the iteration cap
    ConvergenceWarning {
        /// Newton iterations performed
        iterations: usize,
        /// Max-norm of the gradient when stopped
        gradient_norm: f64,
    },
    /// No pair was accepted
    NoMatchWarning {
        /// Treated subjects offered to the matcher
        treated: usize,
        /// Size of the control pool
        controls: usize,
        /// Caliper in force
        caliper: f64,
    },
    /// Post-match SMD exceeds the imbalance threshold
    ImbalancedCovariate {
        /// Covariate name
        feature: String,
        /// Standardized mean difference
        smd: f64,
    },
    /// Configured covariate without a single observed value
    UnusableCovariate {
        /// Covariate name
        feature: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConvergenceWarning {
                iterations,
                gradient_norm,
            } => write!(
                f,
                "Propensity model did not converge after {iterations} iterations \
                 (gradient norm {gradient_norm:.3e}); using current estimate"
            ),
            Self::NoMatchWarning {
                treated,
                controls,
                caliper,
            } => write!(
                f,
                "No matches found for {treated} treated subjects against {controls} controls \
                 (caliper {caliper:.4}); check the caliper and covariate configuration"
            ),
            Self::ImbalancedCovariate { feature, smd } => {
                write!(f, "{feature}: SMD = {smd:.3}")
            }
            Self::UnusableCovariate { feature } => write!(
                f,
                "Covariate {feature} has no observed values in either arm and was dropped"
            ),
        }
    }
}
