//! Logging utilities for output and progress tracking

pub mod log;
pub mod progress;

// Re-export commonly used functions for convenience
pub use log::{log_artifact_written, log_stage, log_table_read};
pub use progress::{create_main_progress_bar, finish_progress_bar};
