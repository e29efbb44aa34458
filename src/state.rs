//! Shared per-run state: configuration, counters and the failure log.

use crate::chunker::Batch;
use crate::config::RunConfig;
use crate::dispatch::DispatchOutcome;
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Run counters. Every field is only ever updated atomically.
#[derive(Debug, Default)]
pub struct RunCounters {
    /// Records read from the input.
    pub total: AtomicU64,
    /// Records the endpoint accepted.
    pub success: AtomicU64,
    /// Records rejected or lost with a failed batch.
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    /// HTTP attempts, retries included.
    pub requests: AtomicU64,
    pub rate_limited: AtomicU64,
    pub server_errors: AtomicU64,
    /// Serialized bytes of every dispatched batch.
    pub bytes: AtomicU64,
    pub batches: AtomicU64,
    pub dropped_oversized: AtomicU64,
    /// Records the transform hook discarded.
    pub filtered: AtomicU64,
    pub decode_errors: AtomicU64,
}

/// Plain copy of [`RunCounters`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub retries: u64,
    pub requests: u64,
    pub rate_limited: u64,
    pub server_errors: u64,
    pub bytes: u64,
    pub batches: u64,
    pub dropped_oversized: u64,
    pub filtered: u64,
    pub decode_errors: u64,
}

impl RunCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            total: get(&self.total),
            success: get(&self.success),
            failed: get(&self.failed),
            retries: get(&self.retries),
            requests: get(&self.requests),
            rate_limited: get(&self.rate_limited),
            server_errors: get(&self.server_errors),
            bytes: get(&self.bytes),
            batches: get(&self.batches),
            dropped_oversized: get(&self.dropped_oversized),
            filtered: get(&self.filtered),
            decode_errors: get(&self.decode_errors),
        }
    }
}

/// A record the endpoint rejected, kept with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub batch: u64,
    /// Position inside the batch.
    pub index: usize,
    pub message: String,
    pub record: Record,
}

/// A batch kept by a dry run, with the outcome it was given.
#[derive(Debug, Clone)]
pub struct DryRunEntry {
    pub batch: Batch,
    pub outcome: DispatchOutcome,
}

/// Everything one run shares between its stages.
#[derive(Debug)]
pub struct RunState {
    pub config: RunConfig,
    pub counters: RunCounters,
    started: Instant,
    failures: Mutex<Vec<FailedRecord>>,
    failures_truncated: AtomicU64,
    dry_run: Mutex<Vec<DryRunEntry>>,
}

impl RunState {
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            counters: RunCounters::default(),
            started: Instant::now(),
            failures: Mutex::new(Vec::new()),
            failures_truncated: AtomicU64::new(0),
            dry_run: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Append to the failure log, respecting `max_failure_log`.
    pub fn log_failure(&self, failure: FailedRecord) {
        let mut log = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if log.len() < self.config.max_failure_log {
            log.push(failure);
        } else {
            self.failures_truncated.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn failures(&self) -> Vec<FailedRecord> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Failures that did not fit in the log.
    #[must_use]
    pub fn failures_truncated(&self) -> u64 {
        self.failures_truncated.load(Ordering::Relaxed)
    }

    pub fn keep_dry_run(&self, batch: Batch, outcome: DispatchOutcome) {
        self.dry_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DryRunEntry { batch, outcome });
    }

    /// Dry-run batches in batch index order.
    #[must_use]
    pub fn take_dry_run(&self) -> Vec<DryRunEntry> {
        let mut entries =
            std::mem::take(&mut *self.dry_run.lock().unwrap_or_else(PoisonError::into_inner));
        entries.sort_by_key(|e| e.batch.index);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn failure_log_is_bounded() {
        let state = RunState::new(RunConfig {
            max_failure_log: 2,
            ..RunConfig::default()
        });
        for i in 0..5 {
            state.log_failure(FailedRecord {
                batch: 0,
                index: i,
                message: "bad".into(),
                record: Map::new(),
            });
        }
        assert_eq!(state.failures().len(), 2);
        assert_eq!(state.failures_truncated(), 3);
    }

    #[test]
    fn snapshot_reads_counters() {
        let state = RunState::new(RunConfig::default());
        RunCounters::add(&state.counters.success, 4);
        RunCounters::add(&state.counters.failed, 1);
        let snap = state.counters.snapshot();
        assert_eq!((snap.success, snap.failed), (4, 1));
    }
}
