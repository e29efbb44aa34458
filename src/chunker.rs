//! Batch accumulation under byte and record-count limits.
//!
//! Records are appended to a pending list first and peeled off afterwards:
//! whenever the pending bytes exceed `max_bytes` or the pending count exceeds
//! `max_records`, the longest prefix that fits both limits is sealed as a
//! batch, repeatedly, until the pending list is back within limits. Batches
//! therefore fill close to the byte limit even when record sizes vary.
//!
//! Every sealed batch satisfies:
//!
//! - `len <= max_records`
//! - the sum of record sizes `<= max_bytes`
//! - no record larger than `max_bytes` (those are dropped on arrival)
//! - records keep their input order, within and across batches
//!
//! Sizes are the length of each record's compact JSON encoding.

use crate::error::{IngestError, Result};
use crate::record::{Record, normalize_event, serialized_len};
use crate::state::{RunCounters, RunState};
use crate::stream::RecordStream;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-record transform applied before batching. `None` discards the record.
pub type Transform = Arc<dyn Fn(Record) -> Option<Record> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_bytes: usize,
}

/// A sealed, ordered group of records sent as one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Position in emission order, starting at 0.
    pub index: u64,
    pub records: Vec<Record>,
    /// Sum of the records' serialized sizes.
    pub bytes: usize,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The request body: a compact JSON array of the records.
    ///
    /// # Errors
    /// Only fails if a record cannot be serialized, which a JSON map cannot.
    pub fn to_json_body(&self) -> serde_json::Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.bytes + self.records.len() + 2);
        serde_json::to_writer(&mut body, &self.records)?;
        Ok(body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The record alone exceeds the byte limit and was discarded.
    Dropped { size: usize },
}

/// Append-then-peel batch builder.
#[derive(Debug)]
pub struct BatchAccumulator {
    limits: BatchLimits,
    pending: VecDeque<(Record, usize)>,
    pending_bytes: usize,
    next_index: u64,
    dropped: u64,
}

impl BatchAccumulator {
    #[must_use]
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits: BatchLimits {
                max_records: limits.max_records.max(1),
                max_bytes: limits.max_bytes.max(1),
            },
            pending: VecDeque::new(),
            pending_bytes: 0,
            next_index: 0,
            dropped: 0,
        }
    }

    #[must_use]
    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    /// Records dropped for being oversized.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Add a record, handing any batches it seals to `emit`.
    pub fn push(&mut self, record: Record, emit: &mut impl FnMut(Batch)) -> PushOutcome {
        let size = serialized_len(&record);
        self.push_sized(record, size, emit)
    }

    /// [`push`](Self::push) with a size the caller already computed.
    pub fn push_sized(
        &mut self,
        record: Record,
        size: usize,
        emit: &mut impl FnMut(Batch),
    ) -> PushOutcome {
        if size > self.limits.max_bytes {
            self.dropped += 1;
            return PushOutcome::Dropped { size };
        }
        self.pending.push_back((record, size));
        self.pending_bytes += size;
        while self.pending_bytes > self.limits.max_bytes
            || self.pending.len() > self.limits.max_records
        {
            let batch = self.peel();
            emit(batch);
        }
        PushOutcome::Accepted
    }

    /// Seal whatever is pending as one final batch.
    pub fn finish(&mut self, emit: &mut impl FnMut(Batch)) {
        if self.pending.is_empty() {
            return;
        }
        let records: Vec<Record> = self.pending.drain(..).map(|(r, _)| r).collect();
        let bytes = std::mem::take(&mut self.pending_bytes);
        emit(self.seal(records, bytes));
    }

    /// Remove the longest prefix within both limits. Never empty, since
    /// every pending record fits the byte limit on its own.
    fn peel(&mut self) -> Batch {
        let mut take = 0;
        let mut bytes = 0;
        for (_, size) in &self.pending {
            if take == self.limits.max_records || bytes + size > self.limits.max_bytes {
                break;
            }
            take += 1;
            bytes += size;
        }
        let records: Vec<Record> = self.pending.drain(..take).map(|(r, _)| r).collect();
        self.pending_bytes -= bytes;
        self.seal(records, bytes)
    }

    fn seal(&mut self, records: Vec<Record>, bytes: usize) -> Batch {
        let index = self.next_index;
        self.next_index += 1;
        Batch {
            index,
            records,
            bytes,
        }
    }
}

/// Chunker stage: read `stream`, apply the transform and normalization,
/// and send sealed batches to `tx`.
///
/// Records read before a terminal stream error are still flushed.
///
/// # Errors
/// Returns the first terminal stream error, or [`IngestError::Closed`] if
/// the dispatcher stops receiving.
pub async fn run_chunker(
    mut stream: RecordStream,
    limits: BatchLimits,
    state: Arc<RunState>,
    transform: Option<Transform>,
    tx: mpsc::Sender<Batch>,
) -> Result<()> {
    let normalize = state.config.normalize && !state.config.record_type.is_profile();
    let counters = &state.counters;
    let mut acc = BatchAccumulator::new(limits);
    let mut sealed = Vec::new();
    let mut failure = None;

    while let Some(item) = stream.next().await {
        let mut record = match item {
            Ok(record) => record,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };
        RunCounters::add(&counters.total, 1);
        if let Some(f) = &transform {
            match f(record) {
                Some(r) => record = r,
                None => {
                    RunCounters::add(&counters.filtered, 1);
                    continue;
                }
            }
        }
        if normalize {
            normalize_event(&mut record);
        }
        if let PushOutcome::Dropped { size } = acc.push(record, &mut |b| sealed.push(b)) {
            RunCounters::add(&counters.dropped_oversized, 1);
            warn!(
                size,
                limit = limits.max_bytes,
                "dropping record larger than the batch byte limit"
            );
        }
        for batch in sealed.drain(..) {
            send(&tx, batch).await?;
        }
    }
    acc.finish(&mut |b| sealed.push(b));
    for batch in sealed.drain(..) {
        send(&tx, batch).await?;
    }
    failure.map_or(Ok(()), Err)
}

async fn send(tx: &mpsc::Sender<Batch>, batch: Batch) -> Result<()> {
    debug!(
        batch = batch.index,
        records = batch.len(),
        bytes = batch.bytes,
        "batch sealed"
    );
    tx.send(batch)
        .await
        .map_err(|_| IngestError::Closed("dispatcher"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect(limits: BatchLimits, sizes: &[usize]) -> (Vec<Batch>, u64) {
        let mut acc = BatchAccumulator::new(limits);
        let mut out = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let rec = json!({ "i": i }).as_object().cloned().unwrap();
            acc.push_sized(rec, size, &mut |b| out.push(b));
        }
        acc.finish(&mut |b| out.push(b));
        (out, acc.dropped())
    }

    #[test]
    fn peels_longest_fitting_prefix() {
        let limits = BatchLimits {
            max_records: 10,
            max_bytes: 100,
        };
        let (batches, dropped) = collect(limits, &[40, 40, 30, 50, 10]);
        let lens: Vec<_> = batches.iter().map(Batch::len).collect();
        assert_eq!(lens, [2, 3]);
        assert_eq!(batches[0].bytes, 80);
        assert_eq!(batches[1].bytes, 90);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn indices_are_sequential() {
        let limits = BatchLimits {
            max_records: 2,
            max_bytes: 1000,
        };
        let (batches, _) = collect(limits, &[1; 7]);
        let idx: Vec<_> = batches.iter().map(|b| b.index).collect();
        assert_eq!(idx, [0, 1, 2, 3]);
    }

    #[test]
    fn exact_fit_is_not_split() {
        let limits = BatchLimits {
            max_records: 5,
            max_bytes: 100,
        };
        let (batches, _) = collect(limits, &[50, 50]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].bytes, 100);
    }

    #[test]
    fn body_is_a_json_array() {
        let batch = Batch {
            index: 0,
            records: vec![json!({"a": 1}).as_object().cloned().unwrap()],
            bytes: 7,
        };
        assert_eq!(batch.to_json_body().unwrap(), br#"[{"a":1}]"#);
    }
}
