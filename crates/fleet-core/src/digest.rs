//! Stable digests of lifecycle request payloads.
//!
//! Idempotency replay compares the digest stored with a token against the
//! digest of the incoming request, so the digest must not depend on map
//! ordering or whitespace.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Digest an operation name together with its payload.
///
/// The payload is converted to a `serde_json::Value` and rendered with
/// sorted object keys before hashing.
pub fn payload_digest<T: Serialize>(operation: &str, payload: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(&serde_json::to_value(payload)?);
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    let result = hasher.finalize();
    Ok(format!("sha256:{}", hex::encode(&result[..16])))
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| {
                    let key = serde_json::Value::String((*k).clone());
                    format!("{key}:{}", canonical_json(v))
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        // Scalars already have a single canonical rendering.
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn digest_is_stable_across_map_ordering() {
        let mut a = HashMap::new();
        a.insert("queue", 1);
        a.insert("compute", 2);
        a.insert("zeta", 3);
        let mut b = HashMap::new();
        b.insert("zeta", 3);
        b.insert("compute", 2);
        b.insert("queue", 1);

        assert_eq!(payload_digest("create", &a).unwrap(), payload_digest("create", &b).unwrap());
    }

    #[test]
    fn digest_depends_on_operation_and_payload() {
        let create = payload_digest("create", &"payload").unwrap();
        assert_ne!(create, payload_digest("update", &"payload").unwrap());
        assert_ne!(create, payload_digest("create", &"other").unwrap());
        assert!(create.starts_with("sha256:"));
        assert_eq!(create.len(), "sha256:".len() + 32);
    }
}
