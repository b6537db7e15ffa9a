//! Input/output utilities
//!
//! Reading subject tables from CSV or Parquet and writing result tables as CSV.

pub mod table;

pub use table::{read_csv, read_parquet, read_table, write_csv};
