//! Temporary files in every input format.
//!
//! Writers pick compression from the file name (`events.jsonl.gz` is written
//! gzipped), so one helper covers plain and compressed fixtures.

use crate::io::compression::{DynWrite, writer_for_path};
use crate::io::csv::encode_records;
use crate::record::Record;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary directory that is deleted when dropped.
pub struct TempDirPath {
    #[allow(dead_code)]
    temp_dir: TempDir,
    path: PathBuf,
}

impl TempDirPath {
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().to_path_buf();
        Ok(Self { temp_dir, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A path inside this directory.
    #[must_use]
    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.path.join(filename)
    }
}

fn create(path: &Path) -> Result<DynWrite> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    writer_for_path(Box::new(file), path)
}

fn finish(mut w: DynWrite, path: &Path) -> Result<PathBuf> {
    w.flush().with_context(|| format!("flush {}", path.display()))?;
    drop(w);
    Ok(path.to_path_buf())
}

/// Write `records` one per line.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_jsonl(path: &Path, records: &[Record]) -> Result<PathBuf> {
    let mut w = create(path)?;
    for record in records {
        serde_json::to_writer(&mut w, record)?;
        w.write_all(b"\n")?;
    }
    finish(w, path)
}

/// Write `records` as one JSON array.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_json_array(path: &Path, records: &[Record]) -> Result<PathBuf> {
    let mut w = create(path)?;
    serde_json::to_writer(&mut w, records)?;
    finish(w, path)
}

/// Write `records` as CSV with the union of their keys as header.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_csv(path: &Path, records: &[Record]) -> Result<PathBuf> {
    write_text(path, &encode_records(records)?)
}

/// Write raw text (compressed if the name says so).
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_text(path: &Path, text: &str) -> Result<PathBuf> {
    let mut w = create(path)?;
    w.write_all(text.as_bytes())?;
    finish(w, path)
}
