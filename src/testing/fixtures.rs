//! Generated record sets.

use crate::record::{Record, serialized_len};
use serde_json::{Value, json};

/// `n` events named `event-{i}` with a `distinct_id`, `time` and `$insert_id`.
#[must_use]
pub fn events(n: usize) -> Vec<Record> {
    (0..n).map(event).collect()
}

/// The `i`th record of [`events`].
#[must_use]
pub fn event(i: usize) -> Record {
    as_record(json!({
        "event": format!("event-{i}"),
        "properties": {
            "distinct_id": format!("user-{}", i % 17),
            "time": 1_700_000_000 + i as u64,
            "$insert_id": format!("ins-{i:08}"),
            "seq": i,
        }
    }))
}

/// `n` user profile updates.
#[must_use]
pub fn profiles(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            as_record(json!({
                "$distinct_id": format!("user-{i}"),
                "$set": { "plan": if i % 2 == 0 { "free" } else { "pro" }, "rank": i },
            }))
        })
        .collect()
}

/// `n` records, each padded so its serialized size is exactly `size` bytes
/// when `size` is large enough to hold the envelope.
#[must_use]
pub fn sized_records(n: usize, size: usize) -> Vec<Record> {
    (0..n).map(|i| sized_record(i, size)).collect()
}

/// One record of [`sized_records`].
#[must_use]
pub fn sized_record(i: usize, size: usize) -> Record {
    let mut record = as_record(json!({ "i": i, "pad": "" }));
    let envelope = serialized_len(&record);
    if size > envelope {
        record.insert("pad".into(), Value::String("x".repeat(size - envelope)));
    }
    record
}

/// The `seq` (events) or `i` (sized records) of each record, in order.
#[must_use]
pub fn sequence_of(records: &[Record]) -> Vec<u64> {
    records
        .iter()
        .filter_map(|r| {
            r.get("i")
                .or_else(|| r.get("properties").and_then(|p| p.get("seq")))
                .and_then(Value::as_u64)
        })
        .collect()
}

fn as_record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}
