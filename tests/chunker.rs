use bulkflow::chunker::{Batch, BatchAccumulator, BatchLimits, PushOutcome, run_chunker};
use bulkflow::record::serialized_len;
use bulkflow::state::RunState;
use bulkflow::testing::*;
use bulkflow::{IngestError, Record, RecordStream, RunConfig};
use std::sync::Arc;
use tokio::sync::mpsc;

fn batch_all(limits: BatchLimits, records: Vec<Record>) -> (Vec<Batch>, u64) {
    let mut acc = BatchAccumulator::new(limits);
    let mut out = Vec::new();
    for r in records {
        acc.push(r, &mut |b| out.push(b));
    }
    acc.finish(&mut |b| out.push(b));
    (out, acc.dropped())
}

fn limits(max_records: usize, max_bytes: usize) -> BatchLimits {
    BatchLimits {
        max_records,
        max_bytes,
    }
}

#[test]
fn case_a_byte_limit_splits() {
    let (batches, dropped) = batch_all(limits(5, 1000), sized_records(4, 300));
    let lens: Vec<_> = batches.iter().map(Batch::len).collect();
    assert_eq!(lens, [3, 1]);
    assert_eq!(batches[0].bytes, 900);
    assert_eq!(dropped, 0);
}

#[test]
fn case_b_count_limit_splits() {
    let (batches, _) = batch_all(limits(5, 1000), sized_records(10, 20));
    let lens: Vec<_> = batches.iter().map(Batch::len).collect();
    assert_eq!(lens, [5, 5]);
}

#[test]
fn case_c_oversized_record_is_dropped() {
    let mut acc = BatchAccumulator::new(limits(5, 1000));
    let mut out = Vec::new();
    let outcome = acc.push(sized_record(0, 1100), &mut |b| out.push(b));
    assert_eq!(outcome, PushOutcome::Dropped { size: 1100 });
    acc.finish(&mut |b| out.push(b));
    assert!(out.is_empty());
    assert_eq!(acc.dropped(), 1);
}

#[test]
fn every_batch_respects_both_limits() {
    let sizes = [120, 40, 990, 300, 300, 300, 80, 15, 700, 1001, 60, 60, 60];
    let records: Vec<Record> = sizes
        .iter()
        .enumerate()
        .map(|(i, &s)| sized_record(i, s))
        .collect();
    let (batches, dropped) = batch_all(limits(4, 1000), records);

    assert_eq!(dropped, 1);
    for b in &batches {
        assert!(!b.is_empty());
        assert!(b.len() <= 4);
        assert!(b.bytes <= 1000);
        assert_eq!(b.bytes, b.records.iter().map(serialized_len).sum::<usize>());
    }
    // Order survives batching; only the oversized record (index 9) is missing.
    let flat: Vec<Record> = batches.into_iter().flat_map(|b| b.records).collect();
    let expected: Vec<u64> = (0..13u64).filter(|&i| i != 9).collect();
    assert_eq!(sequence_of(&flat), expected);
}

#[test]
fn remainder_flushes_as_one_batch() {
    let (batches, _) = batch_all(limits(100, 1_000_000), sized_records(7, 50));
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 7);
}

#[tokio::test]
async fn chunker_stage_counts_drops_and_filters() -> anyhow::Result<()> {
    let config = RunConfig {
        records_per_batch: 10,
        bytes_per_batch: 500,
        normalize: false,
        dry_run: true,
        ..RunConfig::default()
    };
    let state = Arc::new(RunState::new(config));
    let mut records = sized_records(30, 40);
    records.insert(5, sized_record(1000, 800));

    let (tx, mut rx) = mpsc::channel(4);
    let transform: bulkflow::chunker::Transform = Arc::new(|r: Record| {
        let keep = r.get("i").and_then(|v| v.as_u64()).is_some_and(|i| i % 3 != 0);
        keep.then_some(r)
    });
    let task = tokio::spawn(run_chunker(
        RecordStream::from_records(records),
        limits(10, 500),
        Arc::clone(&state),
        Some(transform),
        tx,
    ));

    let mut seen = Vec::new();
    while let Some(batch) = rx.recv().await {
        assert!(batch.len() <= 10 && batch.bytes <= 500);
        seen.extend(batch.records);
    }
    task.await??;

    let c = state.counters.snapshot();
    assert_eq!(c.total, 31);
    assert_eq!(c.filtered, 10);
    assert_eq!(c.dropped_oversized, 1);
    assert_eq!(seen.len(), 20);
    assert!(sequence_of(&seen).windows(2).all(|w| w[0] < w[1]));
    Ok(())
}

#[tokio::test]
async fn chunker_flushes_before_reporting_stream_error() {
    let state = Arc::new(RunState::new(RunConfig {
        dry_run: true,
        ..RunConfig::default()
    }));
    let (feed, stream) = RecordStream::channel(8);
    let (tx, mut rx) = mpsc::channel(4);
    let task = tokio::spawn(run_chunker(stream, limits(100, 10_000), state, None, tx));

    for r in sized_records(3, 30) {
        feed.send(Ok(r)).await.unwrap();
    }
    feed.send(Err(IngestError::Closed("decoder"))).await.unwrap();
    drop(feed);

    let batch = rx.recv().await.unwrap();
    assert_eq!(batch.len(), 3);
    assert!(matches!(
        task.await.unwrap(),
        Err(IngestError::Closed("decoder"))
    ));
}
