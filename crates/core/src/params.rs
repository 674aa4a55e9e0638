//! Job parameters and their canonical hash.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Free-form job parameters as submitted by the caller.
pub type Parameters = Map<String, Value>;

/// Rebuild `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hex SHA-256 over the job name and the canonical JSON of its parameters.
///
/// Key order in the submitted JSON does not change the hash.
pub fn params_hash(name: &str, params: &Parameters) -> String {
    let canonical = canonicalize(&Value::Object(params.clone()));
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn key_order_does_not_matter() {
        let a: Parameters = serde_json::from_str(r#"{"a":1,"b":{"y":2,"x":3}}"#).unwrap();
        let b: Parameters = serde_json::from_str(r#"{"b":{"x":3,"y":2},"a":1}"#).unwrap();
        assert_eq!(params_hash("SAMPLE", &a), params_hash("SAMPLE", &b));
    }

    #[test]
    fn name_and_values_matter() {
        let p = params(json!({"image": "busybox"}));
        let q = params(json!({"image": "alpine"}));
        assert_ne!(params_hash("SAMPLE", &p), params_hash("OTHER", &p));
        assert_ne!(params_hash("SAMPLE", &p), params_hash("SAMPLE", &q));
    }

    proptest! {
        #[test]
        fn hash_is_insertion_order_independent(entries in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..8)) {
            let mut forward = Parameters::new();
            for (k, v) in entries.iter() {
                forward.insert(k.clone(), json!(v));
            }
            let mut backward = Parameters::new();
            for (k, v) in entries.iter().rev() {
                backward.insert(k.clone(), json!(v));
            }
            prop_assert_eq!(params_hash("JOB", &forward), params_hash("JOB", &backward));
        }
    }
}
