//! # Bulkflow
//!
//! A **bulk record delivery engine**. Bulkflow reads record sets of any size
//! (JSON, JSONL, CSV or Parquet; plain, gzip or zstd; local files, directories,
//! globs, object stores, in-memory collections or raw text), packs them into
//! batches bounded by record count and serialized size, and delivers the
//! batches to a bulk-ingestion HTTP endpoint with bounded concurrency, retries
//! and a per-record failure log.
//!
//! ## Key Features
//!
//! - **One entry point for every input** - [`InputDescriptor`] covers paths,
//!   directories, globs, `scheme://bucket/key` URLs, records and raw text
//! - **Streaming decoders** - large and compressed inputs are never loaded whole
//! - **Memory throttle** - decoders pause while host memory is above a high
//!   water mark and resume below a low one, without dropping anything
//! - **Adaptive sizing** - worker count, batch size and buffer depth follow the
//!   average record size of a sampled head
//! - **Exact accounting** - every record read ends up delivered, rejected,
//!   dropped as oversized or filtered, and the [`RunSummary`] says which
//!
//! ## Quick Start
//!
//! ```no_run
//! use bulkflow::{Pipeline, RunConfig};
//! use bulkflow::config::Auth;
//!
//! # async fn demo() -> bulkflow::Result<()> {
//! bulkflow::logging::init();
//!
//! let config = RunConfig {
//!     auth: Some(Auth::ApiSecret { secret: "s3cr3t".into() }),
//!     workers: 20,
//!     ..RunConfig::default()
//! };
//! let summary = Pipeline::new(config).run("events/*.jsonl.gz").await?;
//! println!("{} delivered, {} failed", summary.counters.success, summary.counters.failed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Stages
//!
//! - [`source`] resolves the input and starts the decoders
//! - [`backpressure`] buffers decoded records under the memory throttle
//! - [`adaptive`] sizes the run from a sample of the head
//! - [`chunker`] packs records into [`Batch`]es
//! - [`dispatch`] sends batches with at most `workers` in flight
//! - [`metrics`] reports what happened
//!
//! ## Feature Flags
//!
//! - `compression-zstd` (default) - zstd inputs
//! - `parallel-io` (default) - parallel line parsing for materialized JSONL

pub mod adaptive;
pub mod backpressure;
pub mod chunker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod state;
pub mod stream;
pub mod testing;

pub use adaptive::{AdaptiveConfig, ScalingPlan};
pub use backpressure::{BufferQueue, MemoryProbe, QueueStats, SystemMemory, ThrottleConfig};
pub use chunker::{Batch, BatchAccumulator, BatchLimits, PushOutcome};
pub use config::{Auth, DecodePolicy, RecordType, Region, RunConfig};
pub use dispatch::{DispatchOutcome, RecordFailure, RetryConfig};
pub use error::{IngestError, Result};
pub use io::cloud::{MemoryObjectStore, ObjectStore};
pub use metrics::RunSummary;
pub use pipeline::Pipeline;
pub use record::Record;
pub use source::{InputDescriptor, TablePayload};
pub use state::{CounterSnapshot, FailedRecord};
pub use stream::RecordStream;
