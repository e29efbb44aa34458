//! End-of-run summary.
//!
//! A [`RunSummary`] is what [`Pipeline::run`](crate::Pipeline::run) hands
//! back: the final counters, timing, the scaling plan if one was applied,
//! buffer queue statistics for streamed inputs, the failure log, and (in dry
//! runs) every batch that would have been sent.
//!
//! ```no_run
//! # async fn demo(summary: bulkflow::RunSummary) -> anyhow::Result<()> {
//! summary.print();
//! summary.save_to_file("run-summary.json")?;
//! # Ok(())
//! # }
//! ```

use crate::adaptive::ScalingPlan;
use crate::backpressure::QueueStats;
use crate::state::{CounterSnapshot, DryRunEntry, FailedRecord, RunState};
use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Final report of one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub counters: CounterSnapshot,
    pub elapsed: Duration,
    pub workers: usize,
    pub records_per_batch: usize,
    pub plan: Option<ScalingPlan>,
    pub queue: Option<QueueStats>,
    pub failures: Vec<FailedRecord>,
    /// Failures that did not fit in the log.
    pub failures_truncated: u64,
    pub dry_run: Vec<DryRunEntry>,
}

impl RunSummary {
    pub(crate) fn collect(
        state: &RunState,
        workers: usize,
        records_per_batch: usize,
        plan: Option<ScalingPlan>,
        queue: Option<QueueStats>,
    ) -> Self {
        Self {
            counters: state.counters.snapshot(),
            elapsed: state.started().elapsed(),
            workers,
            records_per_batch,
            plan,
            queue,
            failures: state.failures(),
            failures_truncated: state.failures_truncated(),
            dry_run: state.take_dry_run(),
        }
    }

    /// Successfully delivered records per second.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.counters.success as f64 / secs
        } else {
            0.0
        }
    }

    /// Records read but neither delivered, rejected, dropped nor filtered.
    /// Non-zero only for an aborted run.
    #[must_use]
    pub fn unaccounted(&self) -> u64 {
        let c = &self.counters;
        c.total
            .saturating_sub(c.success + c.failed + c.dropped_oversized + c.filtered)
    }

    /// The summary as JSON. Failure records are included; dry-run batches are
    /// reduced to their size and outcome.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let dry_run: Vec<Value> = self
            .dry_run
            .iter()
            .map(|e| {
                json!({
                    "batch": e.batch.index,
                    "records": e.batch.len(),
                    "bytes": e.batch.bytes,
                    "outcome": e.outcome,
                })
            })
            .collect();
        json!({
            "counters": self.counters,
            "elapsed_ms": self.elapsed.as_millis() as u64,
            "throughput_per_sec": self.throughput(),
            "workers": self.workers,
            "records_per_batch": self.records_per_batch,
            "plan": self.plan,
            "queue": self.queue,
            "failures": self.failures,
            "failures_truncated": self.failures_truncated,
            "dry_run": dry_run,
        })
    }

    /// Emit the summary as one structured log event.
    pub fn log(&self) {
        let c = &self.counters;
        info!(
            total = c.total,
            success = c.success,
            failed = c.failed,
            dropped_oversized = c.dropped_oversized,
            filtered = c.filtered,
            decode_errors = c.decode_errors,
            retries = c.retries,
            rate_limited = c.rate_limited,
            server_errors = c.server_errors,
            batches = c.batches,
            elapsed_ms = self.elapsed.as_millis() as u64,
            throughput = format_args!("{:.1}", self.throughput()),
            "run finished"
        );
    }

    /// Print the summary to stdout in a human-readable form.
    pub fn print(&self) {
        let c = &self.counters;
        println!("\n============= Run Summary =============");
        println!(
            "Elapsed: {:.3}s ({:.1} records/s)",
            self.elapsed.as_secs_f64(),
            self.throughput()
        );
        println!(
            "Workers: {}  Records/batch: {}",
            self.workers, self.records_per_batch
        );
        if let Some(plan) = &self.plan {
            println!(
                "Adaptive tier: {} (avg {} B/record, buffer depth {})",
                plan.tier, plan.avg_record_size, plan.buffer_depth
            );
        }
        println!("---------------------------------------");
        for (name, value) in [
            ("total", c.total),
            ("success", c.success),
            ("failed", c.failed),
            ("dropped_oversized", c.dropped_oversized),
            ("filtered", c.filtered),
            ("decode_errors", c.decode_errors),
            ("batches", c.batches),
            ("requests", c.requests),
            ("retries", c.retries),
            ("rate_limited", c.rate_limited),
            ("server_errors", c.server_errors),
            ("bytes", c.bytes),
        ] {
            println!("{name}: {value}");
        }
        if let Some(q) = &self.queue {
            println!(
                "queue: {} pauses, {} resumes, {} processed",
                q.pauses, q.resumes, q.processed
            );
        }
        if !self.failures.is_empty() {
            println!(
                "failure log: {} kept, {} truncated",
                self.failures.len(),
                self.failures_truncated
            );
        }
        println!("=======================================\n");
    }

    /// Write [`to_json`](Self::to_json), pretty-printed, to `path`.
    ///
    /// # Errors
    /// Fails if the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file =
            File::create(path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}
