//! Arrow utilities
//!
//! Typed column extraction and column replacement for record batches.

pub mod extractors;

pub use extractors::{float_values, person_ids, with_column};
