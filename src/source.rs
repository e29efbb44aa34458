//! Resolving caller inputs into a [`RecordStream`].
//!
//! Anything a run can be pointed at goes through [`Resolver::resolve`]:
//!
//! | input                          | becomes                                      |
//! |--------------------------------|----------------------------------------------|
//! | a stream                       | itself                                       |
//! | a `Vec<Record>`                | a memory stream (moved, not copied)          |
//! | a small local file             | decoded whole, then a memory stream          |
//! | large / compressed / many files| blocking decoders feeding a throttled queue  |
//! | `scheme://bucket/key...`       | object-store readers feeding the same queue  |
//! | raw text                       | JSON, then JSONL, then CSV                   |
//! | a lookup-table payload         | passed through untouched                     |
//!
//! Multi-file inputs must agree on format and compression. The check is made
//! up front, before a single record is emitted.

use crate::backpressure::{BufferQueue, MemoryProbe};
use crate::error::{IngestError, Result};
use crate::io::cloud::{self, CloudUrl, ObjectStore, StoreRegistry};
use crate::io::compression::wrap_reader;
use crate::io::format::{self, Compression, Detected, Format};
use crate::io::{DecodeContext, csv, decode_reader, glob, json, jsonl, parquet};
use crate::record::Record;
use crate::state::{RunCounters, RunState};
use crate::stream::RecordStream;
use serde_json::Value;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Raw text shorter than this is never taken for CSV.
pub const MIN_CSV_TEXT_LEN: usize = 64;

/// Lookup-table CSV, uploaded as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePayload {
    csv: String,
}

impl TablePayload {
    #[must_use]
    pub fn from_csv(csv: impl Into<String>) -> Self {
        Self { csv: csv.into() }
    }

    /// Render records as CSV with the union of their keys as header.
    ///
    /// # Errors
    /// Fails if a value cannot be written.
    pub fn from_records(records: &[Record]) -> Result<Self> {
        Ok(Self {
            csv: csv::encode_records(records)?,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.csv
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.csv
    }

    /// Data rows, not counting the header.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.csv
            .lines()
            .skip(1)
            .filter(|l| !l.trim().is_empty())
            .count()
    }
}

/// What a run reads from.
#[derive(Debug)]
pub enum InputDescriptor {
    Path(PathBuf),
    Paths(Vec<PathBuf>),
    Records(Vec<Record>),
    Stream(RecordStream),
    /// A path, a cloud URL, a glob, or the data itself.
    Text(String),
    /// `scheme://bucket/key`, a prefix ending in `/`, or a key glob.
    Cloud(String),
    CloudList(Vec<String>),
    Table(TablePayload),
}

impl From<PathBuf> for InputDescriptor {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for InputDescriptor {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<Vec<PathBuf>> for InputDescriptor {
    fn from(paths: Vec<PathBuf>) -> Self {
        Self::Paths(paths)
    }
}

impl From<Vec<Record>> for InputDescriptor {
    fn from(records: Vec<Record>) -> Self {
        Self::Records(records)
    }
}

impl From<RecordStream> for InputDescriptor {
    fn from(stream: RecordStream) -> Self {
        Self::Stream(stream)
    }
}

impl From<String> for InputDescriptor {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for InputDescriptor {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<TablePayload> for InputDescriptor {
    fn from(table: TablePayload) -> Self {
        Self::Table(table)
    }
}

/// Output of [`Resolver::resolve`].
#[derive(Debug)]
pub enum Resolved {
    Stream(RecordStream),
    Passthrough(TablePayload),
}

impl Resolved {
    /// The stream, or `None` for a passthrough payload.
    #[must_use]
    pub fn into_stream(self) -> Option<RecordStream> {
        match self {
            Self::Stream(s) => Some(s),
            Self::Passthrough(_) => None,
        }
    }
}

/// One byte source feeding the queue.
enum Source {
    Local {
        path: PathBuf,
        detected: Detected,
    },
    Object {
        store: Arc<dyn ObjectStore>,
        url: CloudUrl,
        detected: Detected,
    },
}

impl Source {
    fn name(&self) -> String {
        match self {
            Self::Local { path, .. } => path.display().to_string(),
            Self::Object { url, .. } => url.to_string(),
        }
    }

    fn decode(&self, ctx: &mut DecodeContext, sink: &mut dyn FnMut(Record) -> bool) -> Result<()> {
        match self {
            Self::Local { path, detected } => {
                if detected.format == Format::Parquet && detected.compression == Compression::None {
                    return parquet::decode_file(path, ctx, sink);
                }
                let file = File::open(path).map_err(|e| IngestError::io(path, e))?;
                let reader = wrap_reader(Box::new(file), detected.compression)?;
                decode_reader(reader, *detected, ctx, sink)
            }
            Self::Object {
                store,
                url,
                detected,
            } => {
                if detected.format == Format::Parquet && detected.compression == Compression::None {
                    let bytes = store.fetch(&url.bucket, &url.key)?;
                    return parquet::decode_bytes(bytes, ctx, sink);
                }
                let reader = wrap_reader(store.open(&url.bucket, &url.key)?, detected.compression)?;
                decode_reader(reader, *detected, ctx, sink)
            }
        }
    }

    fn detected(&self) -> Detected {
        match self {
            Self::Local { detected, .. } | Self::Object { detected, .. } => *detected,
        }
    }
}

/// Turns an [`InputDescriptor`] into records for one run.
pub struct Resolver {
    state: Arc<RunState>,
    stores: StoreRegistry,
    probe: Arc<dyn MemoryProbe>,
}

impl Resolver {
    #[must_use]
    pub fn new(state: Arc<RunState>, stores: StoreRegistry, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            state,
            stores,
            probe,
        }
    }

    /// Resolve `input`. File inputs are checked for format agreement here;
    /// record-level decode errors surface later, in the stream.
    ///
    /// # Errors
    /// [`IngestError::UnrecognizedInput`], [`IngestError::FormatMismatch`],
    /// unknown cloud schemes, unreadable files, and decode errors from inputs
    /// that are decoded eagerly.
    pub async fn resolve(&self, input: InputDescriptor) -> Result<Resolved> {
        let stream = match input {
            InputDescriptor::Table(table) => return Ok(Resolved::Passthrough(table)),
            InputDescriptor::Stream(stream) => stream,
            InputDescriptor::Records(records) => RecordStream::from_records(records),
            InputDescriptor::Path(path) => self.resolve_paths(vec![path]).await?,
            InputDescriptor::Paths(paths) => self.resolve_paths(paths).await?,
            InputDescriptor::Cloud(url) => self.resolve_cloud(vec![url]).await?,
            InputDescriptor::CloudList(urls) => self.resolve_cloud(urls).await?,
            InputDescriptor::Text(text) => self.resolve_text(text).await?,
        };
        Ok(Resolved::Stream(stream))
    }

    async fn resolve_text(&self, text: String) -> Result<RecordStream> {
        let trimmed = text.trim();
        let single_line = !trimmed.contains('\n');
        if single_line && Path::new(trimmed).exists() {
            return self.resolve_paths(vec![PathBuf::from(trimmed)]).await;
        }
        if cloud::is_cloud_url(trimmed) {
            return self.resolve_cloud(vec![trimmed.to_string()]).await;
        }
        let pattern = (single_line && glob::has_glob_chars(trimmed)).then(|| trimmed.to_string());
        let preview: String = trimmed.chars().take(40).collect();

        let policy = self.state.config.input.decode_policy;
        let delimiter = self.state.config.input.csv_delimiter.unwrap_or(b',');
        let parsed = tokio::task::spawn_blocking(move || -> Result<Option<(Vec<Record>, u64)>> {
            let mut ctx = DecodeContext::new("<text>", policy);
            let body = text.trim_start_matches('\u{feff}');
            let records = if let Ok(value) = serde_json::from_str::<Value>(body) {
                json::from_value(value, &mut ctx)?
            } else if jsonl::is_jsonl(body) {
                Some(jsonl::decode_str(body, &mut ctx)?)
            } else if body.len() > MIN_CSV_TEXT_LEN && csv::is_csv(body, delimiter) {
                Some(csv::decode_str(body, delimiter, &mut ctx)?)
            } else {
                None
            };
            Ok(records.map(|r| (r, ctx.skipped())))
        })
        .await
        .map_err(|e| IngestError::Other(anyhow::Error::new(e).context("decode text input")))??;

        if let Some((records, skipped)) = parsed {
            RunCounters::add(&self.state.counters.decode_errors, skipped);
            debug!(records = records.len(), "decoded text input");
            return Ok(RecordStream::from_records(records));
        }
        if let Some(pattern) = pattern {
            let paths = glob::expand_glob(&pattern)?;
            if !paths.is_empty() {
                return self.resolve_paths(paths).await;
            }
        }
        Err(IngestError::UnrecognizedInput(format!(
            "text is not JSON, JSONL, CSV, a path or a URL: {preview:?}"
        )))
    }

    async fn resolve_paths(&self, paths: Vec<PathBuf>) -> Result<RecordStream> {
        let input = self.state.config.input.clone();
        let files = tokio::task::spawn_blocking(move || -> Result<Vec<(PathBuf, Detected)>> {
            let mut files = Vec::new();
            for path in paths {
                let as_str = path.to_string_lossy();
                if path.is_dir() {
                    files.extend(glob::list_dir(&path)?);
                } else if !path.exists() && glob::has_glob_chars(&as_str) {
                    files.extend(glob::expand_glob(&as_str)?);
                } else if path.is_file() {
                    files.push(path);
                } else {
                    return Err(IngestError::io(
                        &path,
                        std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                    ));
                }
            }
            let mut detected = Vec::with_capacity(files.len());
            for file in files {
                let mut d = format::detect_file(&file, input.format, input.compression)?;
                if let Some(delim) = input.csv_delimiter {
                    d.delimiter = delim;
                }
                detected.push((file, d));
            }
            Ok(detected)
        })
        .await
        .map_err(|e| IngestError::Other(anyhow::Error::new(e).context("list input files")))??;

        check_agreement(files.iter().map(|(p, d)| (p.display().to_string(), *d)))?;
        info!(files = files.len(), "resolved local input");

        if let [(path, detected)] = files.as_slice()
            && self.should_materialize(path, *detected)
        {
            return self.materialize(path.clone(), *detected).await;
        }
        let sources = files
            .into_iter()
            .map(|(path, detected)| Source::Local { path, detected })
            .collect();
        Ok(self.spawn_pump(sources))
    }

    fn should_materialize(&self, path: &Path, detected: Detected) -> bool {
        let input = &self.state.config.input;
        if input.force_stream
            || input.compression.is_some()
            || detected.compression != Compression::None
        {
            return false;
        }
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        let budget = self.probe.available_bytes() as f64 * input.memory_fraction;
        (meta.len() as f64) <= budget
    }

    async fn materialize(&self, path: PathBuf, detected: Detected) -> Result<RecordStream> {
        let policy = self.state.config.input.decode_policy;
        let (records, skipped) = tokio::task::spawn_blocking(move || -> Result<(Vec<Record>, u64)> {
            let mut ctx = DecodeContext::new(path.display().to_string(), policy);
            let records = match detected.format {
                Format::Jsonl => {
                    let bytes = std::fs::read(&path).map_err(|e| IngestError::io(&path, e))?;
                    jsonl::decode_bytes(&bytes, &mut ctx)?
                }
                Format::Json => {
                    let text = std::fs::read_to_string(&path).map_err(|e| IngestError::io(&path, e))?;
                    json::decode_str(&text, &mut ctx)?
                }
                Format::Csv => {
                    let text = std::fs::read_to_string(&path).map_err(|e| IngestError::io(&path, e))?;
                    csv::decode_str(&text, detected.delimiter, &mut ctx)?
                }
                Format::Parquet => {
                    let mut out = Vec::new();
                    parquet::decode_file(&path, &mut ctx, &mut |r| {
                        out.push(r);
                        true
                    })?;
                    out
                }
            };
            Ok((records, ctx.skipped()))
        })
        .await
        .map_err(|e| IngestError::Other(anyhow::Error::new(e).context("materialize input")))??;

        RunCounters::add(&self.state.counters.decode_errors, skipped);
        debug!(records = records.len(), format = %detected, "materialized input");
        Ok(RecordStream::from_records(records))
    }

    async fn resolve_cloud(&self, urls: Vec<String>) -> Result<RecordStream> {
        let input = self.state.config.input.clone();
        let mut targets = Vec::new();
        for raw in &urls {
            let url = CloudUrl::parse(raw)?;
            let store = self.stores.get(&url.scheme)?;
            targets.push((store, url));
        }

        let sources = tokio::task::spawn_blocking(move || -> Result<Vec<Source>> {
            let mut sources = Vec::new();
            for (store, url) in targets {
                let objects = if url.is_prefix() || url.is_pattern() {
                    cloud::expand(store.as_ref(), &url)?
                } else {
                    vec![url]
                };
                for object in objects {
                    let mut detected = format::detect_source(
                        &object.key,
                        input.format,
                        input.compression,
                        |compression| {
                            format::read_head(store.open(&object.bucket, &object.key)?, compression)
                        },
                    )?;
                    if let Some(delim) = input.csv_delimiter {
                        detected.delimiter = delim;
                    }
                    sources.push(Source::Object {
                        store: Arc::clone(&store),
                        url: object,
                        detected,
                    });
                }
            }
            Ok(sources)
        })
        .await
        .map_err(|e| IngestError::Other(anyhow::Error::new(e).context("list cloud objects")))??;

        if sources.is_empty() {
            return Err(IngestError::UnrecognizedInput(format!(
                "no objects match {}",
                urls.join(", ")
            )));
        }
        check_agreement(sources.iter().map(|s| (s.name(), s.detected())))?;
        info!(objects = sources.len(), "resolved cloud input");
        Ok(self.spawn_pump(sources))
    }

    /// Decode `sources` in order on the blocking pool, through a throttled
    /// queue.
    fn spawn_pump(&self, sources: Vec<Source>) -> RecordStream {
        let throttle = self.state.config.throttle.clone();
        let (producer, consumer) = BufferQueue::new(throttle.depth);
        if throttle.enabled {
            consumer
                .handle()
                .spawn_sampler(Arc::clone(&self.probe), throttle);
        }
        let state = Arc::clone(&self.state);
        let policy = state.config.input.decode_policy;
        tokio::task::spawn_blocking(move || {
            for source in sources {
                let mut ctx = DecodeContext::new(source.name(), policy);
                let result = source.decode(&mut ctx, &mut |record| producer.push(record));
                RunCounters::add(&state.counters.decode_errors, ctx.skipped());
                if let Err(e) = result {
                    producer.fail(e);
                    return;
                }
                if producer.is_closed() {
                    debug!("consumer gone, stopping decoders");
                    return;
                }
            }
        });
        RecordStream::Queue(consumer)
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("stores", &self.stores)
            .finish_non_exhaustive()
    }
}

/// Every input must share the first one's format and compression.
fn check_agreement(mut items: impl Iterator<Item = (String, Detected)>) -> Result<()> {
    let Some((first, expected)) = items.next() else {
        return Err(IngestError::UnrecognizedInput("no input files found".into()));
    };
    for (path, found) in items {
        if found.format != expected.format || found.compression != expected.compression {
            return Err(IngestError::FormatMismatch {
                first,
                expected: expected.to_string(),
                path,
                found: found.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(format: Format, compression: Compression) -> Detected {
        Detected {
            format,
            compression,
            delimiter: b',',
        }
    }

    #[test]
    fn agreement_names_the_odd_one_out() {
        let items = vec![
            ("a.jsonl".to_string(), d(Format::Jsonl, Compression::None)),
            ("b.jsonl".to_string(), d(Format::Jsonl, Compression::None)),
            ("c.csv".to_string(), d(Format::Csv, Compression::None)),
        ];
        match check_agreement(items.into_iter()) {
            Err(IngestError::FormatMismatch { path, found, .. }) => {
                assert_eq!(path, "c.csv");
                assert_eq!(found, "csv");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn compression_counts_towards_agreement() {
        let items = vec![
            ("a.json".to_string(), d(Format::Json, Compression::None)),
            ("b.json.gz".to_string(), d(Format::Json, Compression::Gzip)),
        ];
        assert!(check_agreement(items.into_iter()).is_err());
        assert!(matches!(
            check_agreement(std::iter::empty()),
            Err(IngestError::UnrecognizedInput(_))
        ));
    }

    #[test]
    fn table_rows_skip_header() {
        let t = TablePayload::from_csv("id,name\n1,a\n2,b\n");
        assert_eq!(t.rows(), 2);
    }
}
