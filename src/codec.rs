//! Payload Codec (spec §4.1, component C1).
//!
//! Compresses a domain-object snapshot into an opaque, deterministic byte
//! blob and recovers it exactly, and computes a structural diff between two
//! snapshots for the merge algorithm (§4.5a) and the audit log (§4.2).

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ServiceError;

/// Bumped whenever the envelope or a per-entity payload shape changes in a
/// way that requires reader-side migration. Readers must tolerate payloads
/// written with an older tag (spec §6); this codec currently accepts any
/// tag `<= CURRENT_SCHEMA_VERSION` unchanged since no migration has been
/// needed yet.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),
}

impl From<CodecError> for ServiceError {
    fn from(err: CodecError) -> Self {
        crate::error::internal("codec", err)
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// The on-disk envelope: a schema version tag followed by the payload.
/// Declared as a struct (not a `serde_json::Map`) so field order in the
/// serialized JSON is `schema_version` then `data`, independent of how
/// `serde_json`'s internal map type orders keys (spec §6: "schema version
/// tag as the first field").
#[derive(Serialize, Deserialize)]
struct Envelope {
    schema_version: u32,
    data: Value,
}

/// Deterministically compresses `obj` into an opaque byte blob.
///
/// Stable for equal inputs: `serde_json::Map` is a `BTreeMap` (this crate
/// does not enable `serde_json`'s `preserve_order` feature), so nested
/// object keys are always emitted in sorted order regardless of the
/// insertion order the caller built them in.
pub fn encode<T: Serialize>(obj: &T) -> CodecResult<Vec<u8>> {
    let data = serde_json::to_value(obj)
        .map_err(|e| CodecError::CorruptPayload(format!("failed to serialize: {e}")))?;
    let envelope = Envelope { schema_version: CURRENT_SCHEMA_VERSION, data };
    let json = serde_json::to_vec(&envelope)
        .map_err(|e| CodecError::CorruptPayload(format!("failed to encode envelope: {e}")))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| CodecError::CorruptPayload(format!("gzip write failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| CodecError::CorruptPayload(format!("gzip finish failed: {e}")))
}

/// Inverse of [`encode`]. Fails with [`CodecError::CorruptPayload`] on
/// truncated or invalid input.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| CodecError::CorruptPayload(format!("gzip decompress failed: {e}")))?;

    let envelope: Envelope = serde_json::from_slice(&json)
        .map_err(|e| CodecError::CorruptPayload(format!("invalid envelope: {e}")))?;

    serde_json::from_value(envelope.data)
        .map_err(|e| CodecError::CorruptPayload(format!("payload does not match target type: {e}")))
}

/// A field-level structural diff between two snapshots (spec §4.1).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub added: serde_json::Map<String, Value>,
    pub modified: serde_json::Map<String, Value>,
    pub removed: serde_json::Map<String, Value>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Computes a structural diff between `prev` and `next`.
///
/// Top-level object fields are diffed recursively when both sides are
/// objects; arrays and scalars are compared by identity (replace-wholesale
/// semantics) — the same rule the three-way merge algorithm (§4.5a) uses
/// for leaf classification.
pub fn diff(prev: &Value, next: &Value) -> Diff {
    let mut out = Diff::default();
    diff_objects(prev, next, &mut out);
    out
}

fn diff_objects(prev: &Value, next: &Value, out: &mut Diff) {
    let (Value::Object(prev_map), Value::Object(next_map)) = (prev, next) else {
        return;
    };

    for (key, next_val) in next_map {
        match prev_map.get(key) {
            None => {
                out.added.insert(key.clone(), next_val.clone());
            }
            Some(prev_val) if prev_val != next_val => {
                if prev_val.is_object() && next_val.is_object() {
                    out.modified.insert(key.clone(), diff_to_value(prev_val, next_val));
                } else {
                    out.modified.insert(
                        key.clone(),
                        serde_json::json!({ "old": prev_val, "new": next_val }),
                    );
                }
            }
            _ => {}
        }
    }

    for (key, prev_val) in prev_map {
        if !next_map.contains_key(key) {
            out.removed.insert(key.clone(), prev_val.clone());
        }
    }
}

fn diff_to_value(prev: &Value, next: &Value) -> Value {
    let nested = diff(prev, next);
    serde_json::to_value(nested).expect("Diff always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        population: i64,
        tags: Vec<String>,
    }

    #[test]
    fn encode_decode_round_trips() {
        let obj = Sample { name: "Ford".into(), population: 1000, tags: vec!["coastal".into()] };
        let bytes = encode(&obj).unwrap();
        let back: Sample = decode(&bytes).unwrap();
        assert_eq!(obj, back);
    }

    #[test]
    fn encode_is_stable_for_equal_inputs() {
        let obj = Sample { name: "Ford".into(), population: 1000, tags: vec![] };
        assert_eq!(encode(&obj).unwrap(), encode(&obj).unwrap());
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let obj = Sample { name: "Ford".into(), population: 1000, tags: vec![] };
        let mut bytes = encode(&obj).unwrap();
        bytes.truncate(bytes.len() / 2);
        let result: CodecResult<Sample> = decode(&bytes);
        assert!(matches!(result, Err(CodecError::CorruptPayload(_))));
    }

    #[test]
    fn decode_rejects_garbage() {
        let result: CodecResult<Sample> = decode(b"not gzip at all");
        assert!(result.is_err());
    }

    #[test]
    fn diff_reports_added_removed_and_modified_top_level_fields() {
        let prev = serde_json::json!({"name": "Ford", "population": 1000});
        let next = serde_json::json!({"name": "Ford Reborn", "population": 1000, "mayor": "Alys"});

        let d = diff(&prev, &next);
        assert_eq!(d.added.get("mayor"), Some(&serde_json::json!("Alys")));
        assert!(d.removed.is_empty());
        assert_eq!(
            d.modified.get("name"),
            Some(&serde_json::json!({"old": "Ford", "new": "Ford Reborn"}))
        );
    }

    #[test]
    fn diff_recurses_into_nested_objects() {
        let prev = serde_json::json!({"stats": {"gold": 10, "wood": 5}});
        let next = serde_json::json!({"stats": {"gold": 20, "wood": 5}});

        let d = diff(&prev, &next);
        let nested = d.modified.get("stats").unwrap();
        let nested_diff: Diff = serde_json::from_value(nested.clone()).unwrap();
        assert_eq!(
            nested_diff.modified.get("gold"),
            Some(&serde_json::json!({"old": 10, "new": 20}))
        );
    }

    #[test]
    fn diff_treats_arrays_as_wholesale_replace() {
        let prev = serde_json::json!({"tags": ["a", "b"]});
        let next = serde_json::json!({"tags": ["a", "c"]});

        let d = diff(&prev, &next);
        assert_eq!(
            d.modified.get("tags"),
            Some(&serde_json::json!({"old": ["a", "b"], "new": ["a", "c"]}))
        );
    }

    #[test]
    fn identical_snapshots_produce_empty_diff() {
        let v = serde_json::json!({"name": "Ford"});
        assert!(diff(&v, &v).is_empty());
    }
}
