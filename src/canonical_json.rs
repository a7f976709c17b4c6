//! Deterministic JSON encoding for anything that feeds the Merkle chain.
//!
//! `serde_json::Map` is `BTreeMap`-backed (and therefore key-sorted) as long
//! as the `preserve_order` feature is not enabled anywhere in the dependency
//! graph, which this crate never does. That alone gives sorted keys; this
//! module just pins the rest of the contract (compact separators, no
//! trailing-zero float noise) so the chain's hashes are reproducible.

use serde::Serialize;

use crate::error::CoreResult;

/// Serialize `value` to its canonical byte representation: sorted object
/// keys, no insignificant whitespace, stable number formatting.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let canonical = canonicalize(value);
    Ok(serde_json::to_vec(&canonical)?)
}

/// Serialize `value` to its canonical string representation.
pub fn to_canonical_string<T: Serialize>(value: &T) -> CoreResult<String> {
    let bytes = to_canonical_bytes(value)?;
    Ok(String::from_utf8(bytes).expect("serde_json always emits valid UTF-8"))
}

/// Recursively rebuild a `serde_json::Value` so that every object's keys are
/// in sorted order. `serde_json::Map` already sorts without `preserve_order`,
/// so this is mostly a no-op walk that also normalizes nested maps produced
/// by any future serializer that might not share that guarantee.
fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            for key in keys {
                let v = map.get(&key).cloned().unwrap_or(serde_json::Value::Null);
                sorted.insert(key, canonicalize(v));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(canonicalize).collect())
        }
        other => other,
    }
}
