//! Algorithm implementations for research study workflows
//!
//! Currently the propensity score matching step that follows cohort
//! construction and covariate extraction.

pub mod matching;
