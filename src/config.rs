//! Per-run configuration.
//!
//! [`RunConfig`] is built by whatever front end drives the run (a CLI, a
//! service, a test) and handed to [`Pipeline`](crate::Pipeline). Every section
//! deserializes with defaults, so a JSON document only has to name what it
//! changes:
//!
//! ```
//! use bulkflow::config::{RecordType, RunConfig};
//!
//! let cfg = RunConfig::from_json_str(r#"{
//!     "record_type": "user",
//!     "workers": 4,
//!     "auth": { "kind": "api_secret", "secret": "s3cr3t" }
//! }"#).unwrap();
//! assert_eq!(cfg.record_type, RecordType::User);
//! assert_eq!(cfg.records_per_batch, 2000);
//! ```

use crate::adaptive::AdaptiveConfig;
use crate::backpressure::ThrottleConfig;
use crate::dispatch::RetryConfig;
use crate::error::{IngestError, Result};
use crate::io::format::{Compression, Format};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_RECORDS_PER_BATCH: usize = 2000;
pub const DEFAULT_BYTES_PER_BATCH: usize = 9 * 1024 * 1024;
pub const DEFAULT_WORKERS: usize = 10;

/// What kind of record the run delivers; selects the endpoint and how the
/// response is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    #[default]
    Event,
    User,
    Group,
    Table,
}

impl RecordType {
    /// Profile types report a status flag rather than per-record detail.
    #[must_use]
    pub fn is_profile(self) -> bool {
        matches!(self, Self::User | Self::Group)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    #[default]
    Us,
    Eu,
    In,
}

/// Credentials, resolved into an `Authorization` header once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Auth {
    ServiceAccount { username: String, secret: String },
    ApiSecret { secret: String },
    Bearer { token: String },
}

/// What to do with a record that cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DecodePolicy {
    /// The first bad record fails the whole input.
    Strict,
    /// Bad records are skipped and counted; more than `max_errors` fails the input.
    Skip { max_errors: u64 },
}

impl Default for DecodePolicy {
    fn default() -> Self {
        Self::Skip { max_errors: 1000 }
    }
}

/// How inputs are read and decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputOptions {
    /// Declared format; wins over extension and content detection.
    pub format: Option<Format>,
    /// Declared compression; wins over extension detection and forces streaming.
    pub compression: Option<Compression>,
    /// Files up to `free_memory * memory_fraction` bytes are loaded whole.
    pub memory_fraction: f64,
    /// Always decode incrementally, whatever the size.
    pub force_stream: bool,
    pub decode_policy: DecodePolicy,
    /// CSV field delimiter; `.tsv` inputs default to a tab.
    pub csv_delimiter: Option<u8>,
}

impl Default for InputOptions {
    fn default() -> Self {
        Self {
            format: None,
            compression: None,
            memory_fraction: 0.75,
            force_stream: false,
            decode_policy: DecodePolicy::default(),
            csv_delimiter: None,
        }
    }
}

/// Immutable configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub record_type: RecordType,
    /// Lookup table id, required for [`RecordType::Table`].
    pub table_id: Option<String>,
    pub region: Region,
    /// Overrides the region's base URL (proxies, tests).
    pub api_base: Option<String>,
    pub auth: Option<Auth>,
    pub project_id: Option<String>,
    /// Ask the endpoint to validate every record (`strict=1`).
    pub strict: bool,
    /// Gzip request bodies.
    pub compress: bool,
    pub compression_level: u32,
    pub workers: usize,
    pub records_per_batch: usize,
    pub bytes_per_batch: usize,
    pub retry: RetryConfig,
    pub request_timeout_ms: u64,
    pub first_byte_timeout_ms: u64,
    /// Build batches but never send them; batches are kept for inspection.
    pub dry_run: bool,
    /// Upper bound on rejected records kept in the failure log.
    pub max_failure_log: usize,
    /// Fold top-level event keys into a `properties` object when it is missing.
    pub normalize: bool,
    pub input: InputOptions,
    pub throttle: ThrottleConfig,
    pub adaptive: AdaptiveConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            record_type: RecordType::Event,
            table_id: None,
            region: Region::Us,
            api_base: None,
            auth: None,
            project_id: None,
            strict: true,
            compress: false,
            compression_level: 6,
            workers: DEFAULT_WORKERS,
            records_per_batch: DEFAULT_RECORDS_PER_BATCH,
            bytes_per_batch: DEFAULT_BYTES_PER_BATCH,
            retry: RetryConfig::default(),
            request_timeout_ms: 120_000,
            first_byte_timeout_ms: 60_000,
            dry_run: false,
            max_failure_log: 10_000,
            normalize: true,
            input: InputOptions::default(),
            throttle: ThrottleConfig::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl RunConfig {
    /// Parse a JSON document, filling unspecified fields with defaults.
    ///
    /// # Errors
    /// Returns [`IngestError::Config`] if the document is not valid JSON for
    /// this shape.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| IngestError::Config(format!("parse config: {e}")))
    }

    /// Load a JSON config file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
        Self::from_json_str(&text)
    }

    /// Check cross-field constraints. Called before any record is read.
    ///
    /// # Errors
    /// Returns [`IngestError::Config`] naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(IngestError::Config(msg));
        if self.workers == 0 {
            return bad("workers must be at least 1".into());
        }
        if self.records_per_batch == 0 || self.bytes_per_batch == 0 {
            return bad("batch limits must be non-zero".into());
        }
        if self.record_type == RecordType::Table && self.table_id.is_none() {
            return bad("record_type \"table\" requires table_id".into());
        }
        if self.auth.is_none() && !self.dry_run {
            return bad("no credentials configured".into());
        }
        if let Some(base) = &self.api_base
            && reqwest::Url::parse(base).is_err()
        {
            return bad(format!("api_base is not a URL: {base}"));
        }
        if !(0.0..=1.0).contains(&self.input.memory_fraction) {
            return bad("input.memory_fraction must be within [0, 1]".into());
        }
        self.retry.validate()?;
        self.throttle.validate()?;
        self.adaptive.validate()?;
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.first_byte_timeout_ms)
    }
}
