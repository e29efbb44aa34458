//! The record value type and its thin normalization layer.
//!
//! A [`Record`] is an ordered JSON object. Nothing beyond structure is checked
//! locally; the remote endpoint decides whether a record is valid.

use serde_json::{Map, Value};

/// One event or profile mutation. Key order follows the source.
pub type Record = Map<String, Value>;

/// Length of the compact UTF-8 JSON encoding of `record`.
///
/// This is the size the batch limits are measured against.
#[must_use]
pub fn serialized_len(record: &Record) -> usize {
    // Map<String, Value> serialization cannot fail: keys are strings and
    // numbers are always finite.
    serde_json::to_vec(record).map_or(0, |v| v.len())
}

/// Ensure an event record carries a `properties` object.
///
/// When the container is missing, every top-level key other than `event` is
/// moved into a new `properties` object, keeping order. A non-object
/// `properties` value is left alone for the endpoint to reject.
pub fn normalize_event(record: &mut Record) {
    if record.contains_key("properties") {
        return;
    }
    let mut properties = Map::new();
    let keys: Vec<String> = record
        .keys()
        .filter(|k| k.as_str() != "event")
        .cloned()
        .collect();
    for key in keys {
        if let Some(value) = record.shift_remove(&key) {
            properties.insert(key, value);
        }
    }
    record.insert("properties".to_string(), Value::Object(properties));
}

/// Convert a decoded JSON value into a record, rejecting non-objects.
pub(crate) fn into_record(value: Value) -> Result<Record, String> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!(
            "expected a JSON object, found {}",
            value_kind(&other)
        )),
    }
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        into_record(v).unwrap()
    }

    #[test]
    fn serialized_len_matches_compact_json() {
        let r = rec(json!({"a": 1, "b": "xy"}));
        assert_eq!(serialized_len(&r), r#"{"a":1,"b":"xy"}"#.len());
    }

    #[test]
    fn normalize_folds_top_level_keys() {
        let mut r = rec(json!({"event": "click", "time": 1, "distinct_id": "u1"}));
        normalize_event(&mut r);
        assert_eq!(
            Value::Object(r),
            json!({"event": "click", "properties": {"time": 1, "distinct_id": "u1"}})
        );
    }

    #[test]
    fn normalize_keeps_existing_properties() {
        let mut r = rec(json!({"event": "x", "properties": {"a": 1}, "stray": 2}));
        normalize_event(&mut r);
        assert_eq!(r.get("stray"), Some(&json!(2)));
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(into_record(json!([1, 2])).is_err());
        assert!(into_record(json!("s")).is_err());
    }
}
