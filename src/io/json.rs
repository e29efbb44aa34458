//! Whole-document JSON decoding.
//!
//! A top-level array is walked element by element through a serde visitor, so
//! a multi-gigabyte array never has to exist in memory at once. A top-level
//! object is a single record. Anything else is a decode error.

use super::DecodeContext;
use crate::error::{IngestError, Result};
use crate::record::{Record, into_record};
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::io::Read;

/// Stream the records of a JSON document into `sink`.
///
/// # Errors
/// Malformed JSON fails the input regardless of policy (framing is lost);
/// non-object array elements go through the policy.
pub fn decode<R: Read>(
    reader: R,
    ctx: &mut DecodeContext,
    sink: &mut dyn FnMut(Record) -> bool,
) -> Result<()> {
    let mut de = serde_json::Deserializer::from_reader(reader);
    let mut state = WalkState {
        ctx,
        sink,
        position: 0,
        policy_error: None,
        stopped: false,
    };
    let walked = (&mut de).deserialize_any(TopLevel(&mut state));
    let WalkState {
        ctx,
        position,
        policy_error,
        stopped,
        ..
    } = state;
    if let Some(err) = policy_error {
        return Err(err);
    }
    if stopped {
        return Ok(());
    }
    walked.map_err(|e| IngestError::Decode {
        source_name: ctx.source_name().to_string(),
        position: position + 1,
        message: format!("malformed JSON document: {e}"),
    })?;
    de.end().map_err(|e| IngestError::Decode {
        source_name: ctx.source_name().to_string(),
        position: position + 1,
        message: format!("trailing content after JSON document: {e}"),
    })
}

/// Decode an in-memory JSON document into a vector.
///
/// # Errors
/// As for [`decode`].
pub fn decode_str(text: &str, ctx: &mut DecodeContext) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    decode(text.trim_start_matches('\u{feff}').as_bytes(), ctx, &mut |r| {
        out.push(r);
        true
    })?;
    Ok(out)
}

struct WalkState<'a, 'b> {
    ctx: &'a mut DecodeContext,
    sink: &'b mut dyn FnMut(Record) -> bool,
    position: u64,
    policy_error: Option<IngestError>,
    stopped: bool,
}

impl WalkState<'_, '_> {
    /// Returns false when the walk must end early.
    fn offer(&mut self, value: Value) -> bool {
        self.position += 1;
        match into_record(value) {
            Ok(record) => {
                if !(self.sink)(record) {
                    self.stopped = true;
                    return false;
                }
                true
            }
            Err(msg) => match self.ctx.reject(self.position, msg) {
                Ok(()) => true,
                Err(e) => {
                    self.policy_error = Some(e);
                    false
                }
            },
        }
    }
}

struct TopLevel<'s, 'a, 'b>(&'s mut WalkState<'a, 'b>);

impl<'de> Visitor<'de> for TopLevel<'_, '_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON array of objects or a single JSON object")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(value) = seq.next_element_seed(ElementSeed)? {
            if !self.0.offer(value) {
                return Err(de::Error::custom("walk stopped"));
            }
        }
        Ok(())
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<(), A::Error> {
        let record = Record::deserialize(de::value::MapAccessDeserializer::new(map))?;
        self.0.offer(Value::Object(record));
        Ok(())
    }
}

struct ElementSeed;

impl<'de> DeserializeSeed<'de> for ElementSeed {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }
}

/// Records from an already parsed document: an array of objects or a single
/// object. Returns `Ok(None)` for any other top-level value.
///
/// # Errors
/// Returns non-object array elements the policy escalates.
pub fn from_value(value: Value, ctx: &mut DecodeContext) -> Result<Option<Vec<Record>>> {
    match value {
        Value::Object(map) => Ok(Some(vec![map])),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                match into_record(item) {
                    Ok(record) => out.push(record),
                    Err(msg) => ctx.reject(i as u64 + 1, msg)?,
                }
            }
            Ok(Some(out))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecodePolicy;

    fn strict() -> DecodeContext {
        DecodeContext::new("mem", DecodePolicy::Strict)
    }

    #[test]
    fn array_elements_stream_in_order() {
        let recs = decode_str(r#"[{"i":1},{"i":2},{"i":3}]"#, &mut strict()).unwrap();
        let ids: Vec<_> = recs.iter().map(|r| r["i"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn single_object_is_one_record() {
        let recs = decode_str(r#" {"event":"x","properties":{}} "#, &mut strict()).unwrap();
        assert_eq!(recs.len(), 1);
    }

    #[test]
    fn non_object_elements_follow_policy() {
        let mut ctx = DecodeContext::new("mem", DecodePolicy::Skip { max_errors: 10 });
        let recs = decode_str(r#"[{"i":1}, 7, {"i":2}]"#, &mut ctx).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(ctx.skipped(), 1);

        let err = decode_str(r#"[{"i":1}, 7]"#, &mut strict()).unwrap_err();
        assert!(matches!(err, IngestError::Decode { position: 2, .. }));
    }

    #[test]
    fn early_stop_is_not_an_error() {
        let mut seen = 0;
        decode(r#"[{"i":1},{"i":2}]"#.as_bytes(), &mut strict(), &mut |_| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn parsed_values() {
        let mut ctx = strict();
        let v: Value = serde_json::from_str(r#"[{"a":1},{"a":2}]"#).unwrap();
        assert_eq!(from_value(v, &mut ctx).unwrap().unwrap().len(), 2);
        assert!(from_value(Value::from(42), &mut ctx).unwrap().is_none());
    }

    #[test]
    fn truncated_document_fails() {
        assert!(decode_str(r#"[{"i":1},"#, &mut strict()).is_err());
    }
}
