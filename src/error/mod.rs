//! Error handling for propensity score matching runs.
//!
//! Only population-level structural failures are errors. Per-row and
//! per-covariate anomalies are repaired locally and surfaced as
//! [`Diagnostic`](crate::algorithm::matching::Diagnostic) values instead.

use std::io;
use std::path::{Path, PathBuf};

use arrow::error::ArrowError;
use parquet::errors::ParquetError;

/// Errors that can abort a matching run
#[derive(Debug, thiserror::Error)]
pub enum PsmError {
    /// Required configuration is missing, malformed, or resolves to nothing usable
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An input arm has no rows to work with
    #[error("Empty input: {0}")]
    EmptyInputError(String),

    /// Input table violates a structural requirement
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Arrow error
    #[error("Arrow error: {0}")]
    ArrowError(#[from] ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    ParquetError(#[from] ParquetError),

    /// Error opening, reading or writing a file
    #[error("IO error on {}: {source}", path.display())]
    IoError {
        /// The file or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Error converting rows to Arrow arrays
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_arrow::Error),
}

impl PsmError {
    /// Wrap an IO error together with the path it occurred on
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::IoError {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for matching operations
pub type Result<T> = std::result::Result<T, PsmError>;
