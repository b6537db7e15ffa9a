//! Subject table reading and result table writing
//!
//! Tables are read whole into a single `RecordBatch`: the matching core
//! needs the entire treated and control population in memory anyway.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use arrow::compute::concat_batches;
use arrow::csv::reader::Format;
use arrow::csv::{ReaderBuilder, WriterBuilder};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::error::{PsmError, Result};
use crate::utils::logging::log_table_read;

/// Read a subject table, choosing the format from the file extension
///
/// `.parquet` files are read as Parquet; anything else is read as CSV with a
/// header row.
pub fn read_table(path: &Path) -> Result<RecordBatch> {
    if path.extension().is_some_and(|ext| ext == "parquet") {
        read_parquet(path)
    } else {
        read_csv(path)
    }
}

/// Read a CSV file with a header row, inferring column types
pub fn read_csv(path: &Path) -> Result<RecordBatch> {
    let start = Instant::now();
    log::debug!("Reading CSV file {}", path.display());

    let mut file = File::open(path).map_err(|e| PsmError::io(path, e))?;
    let (schema, _) = Format::default()
        .with_header(true)
        .infer_schema(&mut file, None)?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| PsmError::io(path, e))?;

    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(Arc::clone(&schema))
        .with_header(true)
        .build(file)?;
    let batches = reader.collect::<std::result::Result<Vec<_>, ArrowError>>()?;
    let batch = concat_batches(&schema, &batches)?;

    log_table_read("CSV", path, batch.num_rows(), start.elapsed());
    Ok(batch)
}

/// Read a Parquet file into a single record batch
pub fn read_parquet(path: &Path) -> Result<RecordBatch> {
    let start = Instant::now();
    log::debug!("Reading Parquet file {}", path.display());

    let file = File::open(path).map_err(|e| PsmError::io(path, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = Arc::clone(builder.schema());
    let reader = builder.build()?;
    let batches = reader.collect::<std::result::Result<Vec<_>, ArrowError>>()?;
    let batch = concat_batches(&schema, &batches)?;

    log_table_read("Parquet", path, batch.num_rows(), start.elapsed());
    Ok(batch)
}

/// Write a record batch as CSV with a header row
///
/// The header is written even when the batch has no rows. Parent
/// directories are created as needed.
pub fn write_csv(path: &Path, batch: &RecordBatch) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PsmError::io(parent, e))?;
    }

    let file = File::create(path).map_err(|e| PsmError::io(path, e))?;
    let mut writer = WriterBuilder::new().with_header(true).build(file);
    writer.write(batch)?;

    log::debug!("Wrote {} rows to {}", batch.num_rows(), path.display());
    Ok(())
}
