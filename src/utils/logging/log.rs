//! Logging helpers shared by the pipeline stages
//!
//! Stage banners frame a cohort run in the log; table and artifact lines
//! keep the format of every read and write the same across cohorts.

use std::path::Path;
use std::time::Duration;

/// Log the banner of a pipeline stage
pub fn log_stage(title: &str) {
    log::info!("{}", "=".repeat(80));
    log::info!("{title}");
    log::info!("{}", "=".repeat(80));
}

/// Log a subject table that was read into memory
///
/// An empty table is logged as a warning: the run continues, but an empty
/// treated table fails later and an empty control pool yields no pairs.
pub fn log_table_read(format: &str, path: &Path, rows: usize, elapsed: Duration) {
    if rows == 0 {
        log::warn!("{format} table {} has no rows", path.display());
    } else {
        log::info!(
            "Read {rows} subjects from {format} table {} in {elapsed:.2?}",
            path.display()
        );
    }
}

/// Log one persisted artifact of a matching run
pub fn log_artifact_written(artifact: &str, path: &Path, rows: Option<usize>) {
    match rows {
        Some(rows) => log::info!("Saved {artifact} ({rows} rows) to {}", path.display()),
        None => log::info!("Saved {artifact} to {}", path.display()),
    }
}
