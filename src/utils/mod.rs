//! Utility functions shared by the matching pipeline
//!
//! Arrow column access, descriptive statistics, table I/O, and logging.

pub mod arrow;
pub mod io;
pub mod logging;
pub mod stats;

pub use io::{read_table, write_csv};
