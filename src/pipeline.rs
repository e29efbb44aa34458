//! The run driver.
//!
//! A [`Pipeline`] owns one run from configuration to summary:
//!
//! ```text
//! resolve input ─► (decoders ─► buffer queue) ─► chunker task ─► batch channel ─► dispatch loop
//!                                                      ▲
//!                          adaptive sample replayed ───┘
//! ```
//!
//! Configuration is validated and the HTTP transport is built before any
//! record is read, so bad settings fail fast. The adaptive controller samples
//! the head of the stream and replays the sample first, so no record is
//! delayed or reordered.
//!
//! ```no_run
//! use bulkflow::{Pipeline, RunConfig};
//!
//! # async fn demo() -> bulkflow::Result<()> {
//! let config = RunConfig::from_json_file("run.json")?;
//! let summary = Pipeline::new(config)
//!     .transform(|mut r| {
//!         r.remove("debug");
//!         Some(r)
//!     })
//!     .run("exports/2024-06/")
//!     .await?;
//! summary.print();
//! # Ok(())
//! # }
//! ```

use crate::adaptive::{self, ScalingInput, ScalingPlan};
use crate::backpressure::{MemoryProbe, SystemMemory};
use crate::chunker::{BatchLimits, Transform, run_chunker};
use crate::config::{RecordType, RunConfig};
use crate::dispatch::{DispatchOutcome, Dispatcher, Hooks};
use crate::error::{IngestError, Result};
use crate::io::cloud::{ObjectStore, StoreRegistry};
use crate::metrics::RunSummary;
use crate::record::{Record, serialized_len};
use crate::source::{InputDescriptor, Resolved, Resolver, TablePayload};
use crate::state::{RunCounters, RunState};
use crate::stream::RecordStream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Builder and entry point for one ingestion run.
pub struct Pipeline {
    config: RunConfig,
    stores: StoreRegistry,
    probe: Option<Arc<dyn MemoryProbe>>,
    transform: Option<Transform>,
    hooks: Hooks,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            stores: StoreRegistry::new(),
            probe: None,
            transform: None,
            hooks: Hooks::default(),
        }
    }

    /// Serve `scheme://` URLs from `store`.
    #[must_use]
    pub fn object_store(mut self, scheme: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.register(scheme, store);
        self
    }

    /// Replace the host memory probe used by the throttle, the materialize
    /// decision and the adaptive heap budget.
    #[must_use]
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Map every record before batching. Returning `None` drops the record
    /// and counts it as filtered.
    #[must_use]
    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Record) -> Option<Record> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    /// Called with every batch outcome, dry runs included.
    #[must_use]
    pub fn on_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&DispatchOutcome) + Send + Sync + 'static,
    {
        self.hooks.on_response = Some(Arc::new(f));
        self
    }

    /// Called with every failed send attempt and its attempt number.
    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&IngestError, u32) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(f));
        self
    }

    /// Run to completion.
    ///
    /// Batch-level failures never fail the run; they are counted and logged
    /// in the summary.
    ///
    /// # Errors
    /// Configuration errors, rejected credentials, unrecognized or
    /// inconsistent inputs, and decode errors the policy escalates. The
    /// summary is logged before a run-level error is returned.
    pub async fn run(self, input: impl Into<InputDescriptor>) -> Result<RunSummary> {
        let Self {
            config,
            stores,
            probe,
            transform,
            hooks,
        } = self;
        config.validate()?;

        let probe: Arc<dyn MemoryProbe> = probe.unwrap_or_else(|| Arc::new(SystemMemory::new()));
        let requested_workers = config.workers;
        let state = Arc::new(RunState::new(config));
        let dispatcher = Dispatcher::new(Arc::clone(&state), hooks, requested_workers)?;

        let resolver = Resolver::new(Arc::clone(&state), stores, Arc::clone(&probe));
        let mut stream = match resolver.resolve(input.into()).await? {
            Resolved::Passthrough(table) => return upload(&state, &dispatcher, table).await,
            Resolved::Stream(stream) => stream,
        };
        if state.config.record_type == RecordType::Table {
            let records = apply_transform(&state, transform.as_ref(), stream.collect_all().await?);
            let table = TablePayload::from_records(&records)?;
            return upload(&state, &dispatcher, table).await;
        }

        let mut workers = requested_workers;
        let mut records_per_batch = state.config.records_per_batch;
        let mut plan = None;
        let mut deferred = None;
        if state.config.adaptive.enabled {
            let (sampled, sample_error) = adapt(&state, &mut stream, probe.as_ref()).await;
            deferred = sample_error;
            if let Some(p) = sampled {
                workers = p.workers;
                records_per_batch = p.records_per_batch;
                if let Some(queue) = stream.buffer() {
                    queue.set_depth(p.buffer_depth);
                }
                plan = Some(p);
            }
        }
        let queue = stream.buffer();

        let limits = BatchLimits {
            max_records: records_per_batch,
            max_bytes: state.config.bytes_per_batch,
        };
        let (tx, rx) = mpsc::channel(workers.saturating_mul(2).max(1));
        let chunker = tokio::spawn(run_chunker(stream, limits, Arc::clone(&state), transform, tx));
        let dispatched = Arc::new(dispatcher).run(rx, workers).await;
        let chunked = match chunker.await {
            Ok(result) => result,
            Err(join) => Err(IngestError::Other(
                anyhow::Error::new(join).context("chunker task failed"),
            )),
        };

        let summary = RunSummary::collect(
            &state,
            workers,
            records_per_batch,
            plan,
            queue.map(|q| q.stats()),
        );
        summary.log();

        match (dispatched, chunked, deferred) {
            (Err(e), _, _) => Err(e),
            (Ok(()), Err(e), _) | (Ok(()), Ok(()), Some(e)) => {
                error!(error = %e, "run failed");
                Err(e)
            }
            (Ok(()), Ok(()), None) => Ok(summary),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("stores", &self.stores)
            .field("transform", &self.transform.is_some())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// Sample the head of `stream`, derive a plan, and put the sample back.
///
/// A terminal error met while sampling is returned alongside; the records
/// read before it are still delivered.
async fn adapt(
    state: &RunState,
    stream: &mut RecordStream,
    probe: &dyn MemoryProbe,
) -> (Option<ScalingPlan>, Option<IngestError>) {
    let cfg = &state.config.adaptive;
    let mut failure = None;
    let avg = match cfg.avg_record_size_hint {
        Some(hint) => Some(hint),
        None => {
            let mut head = Vec::with_capacity(cfg.sample_size);
            while head.len() < cfg.sample_size {
                match stream.next().await {
                    Some(Ok(record)) => head.push(record),
                    Some(Err(e)) => {
                        failure = Some(e);
                        break;
                    }
                    None => break,
                }
            }
            let sizes: Vec<usize> = head.iter().map(serialized_len).collect();
            let taken = std::mem::replace(stream, RecordStream::from_records(Vec::new()));
            *stream = if failure.is_some() {
                // The rest of a failed stream is not read.
                RecordStream::from_records(head)
            } else {
                taken.with_head(head)
            };
            adaptive::average(&sizes)
        }
    };
    let Some(avg) = avg else {
        info!("empty input, adaptive scaling skipped");
        return (None, failure);
    };
    let heap_budget = cfg
        .heap_budget_bytes
        .unwrap_or_else(|| (probe.available_bytes() as f64 * cfg.heap_fraction) as u64);
    let plan = adaptive::plan(
        cfg,
        ScalingInput {
            avg_record_size: avg,
            requested_workers: state.config.workers,
            records_per_batch: state.config.records_per_batch,
            bytes_per_batch: state.config.bytes_per_batch,
            heap_budget,
        },
    );
    (plan, failure)
}

fn apply_transform(
    state: &RunState,
    transform: Option<&Transform>,
    records: Vec<Record>,
) -> Vec<Record> {
    let Some(f) = transform else {
        return records;
    };
    let before = records.len();
    let kept: Vec<Record> = records.into_iter().filter_map(|r| f(r)).collect();
    // The upload counts kept rows into `total`; filtered ones were read too.
    let filtered = (before - kept.len()) as u64;
    RunCounters::add(&state.counters.filtered, filtered);
    RunCounters::add(&state.counters.total, filtered);
    kept
}

async fn upload(state: &RunState, dispatcher: &Dispatcher, table: TablePayload) -> Result<RunSummary> {
    let rows = table.rows();
    if rows == 0 {
        warn!("lookup table has no rows");
    }
    let outcome = dispatcher.upload_table(table.into_string(), rows).await;
    let summary = RunSummary::collect(state, 1, rows, None, None);
    summary.log();
    outcome.map(|_| summary)
}
