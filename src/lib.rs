//! Propensity score matching for observational cohort studies.
//!
//! Treated (drug users) and control (non-users) subject tables are read as
//! Arrow record batches, matched 1:1 on the logit of an estimated propensity
//! score within a caliper, and checked for covariate balance.

pub mod algorithm;
pub mod config;
pub mod error;
pub mod utils;

// Re-export the most common types for easier use
pub use algorithm::matching::{
    BalanceReport, Diagnostic, MatchedPair, MatchingResult, PropensityMatcher, execute,
};
pub use config::{MatchingConfig, StudyConfig, TreatedOrder};
pub use error::{PsmError, Result};

// Arrow types
pub use arrow::record_batch::RecordBatch;
