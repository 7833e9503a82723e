// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable JSON canonicalization and replay-cache signature hashing.
//!
//! `stable_json` is not a full JCS implementation, but it is stable for the
//! values the orchestration core hashes: arrays preserve order, object keys
//! are sorted lexicographically (code-point order, inherited for free from
//! `serde_json::Value`'s `BTreeMap`-backed `Map` — this workspace does not
//! enable the `preserve_order` feature), and `null`/absent optional fields
//! are encoded as `serde_json` encodes them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Errors produced while canonicalizing a value.
#[derive(Debug, thiserror::Error)]
pub enum CanonError {
    /// The value could not be serialized to JSON.
    #[error("failed to serialize value: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for `value`.
///
/// Round-trips through [`serde_json::Value`] so that nested object keys are
/// sorted regardless of the insertion order the caller's type produced them
/// in. Two values that differ only in key-insertion order serialize to the
/// byte-identical string.
pub fn stable_json<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded (lowercase) SHA-256 digest of `bytes`.
///
/// Always 64 characters.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute a stable replay-cache signature hash for an agent action.
///
/// Canonicalizes as `"<action_type>:<project_id>:<source_session_id>:<turn_id>:<stable_json(payload)>"`
/// and hashes the UTF-8 bytes of that string with SHA-256. Sensitive to any
/// change in the scope components or in any payload value; insensitive to
/// payload key-insertion order.
pub fn signature_hash<T: Serialize>(
    action_type: &str,
    project_id: &str,
    source_session_id: &str,
    turn_id: &str,
    payload: &T,
) -> Result<String, CanonError> {
    let payload_json = stable_json(payload)?;
    let scope = format!("{action_type}:{project_id}:{source_session_id}:{turn_id}:{payload_json}");
    Ok(sha256_hex(scope.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stable_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"z": 1, "y": 2}});
        let b = json!({"a": {"y": 2, "z": 1}, "b": 1});
        assert_eq!(stable_json(&a).unwrap(), stable_json(&b).unwrap());
    }

    #[test]
    fn stable_json_preserves_array_order() {
        let a = json!({"xs": [3, 1, 2]});
        assert_eq!(stable_json(&a).unwrap(), r#"{"xs":[3,1,2]}"#);
    }

    #[test]
    fn sha256_hex_is_64_chars() {
        let h = sha256_hex(b"hello");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sha256_hex_is_deterministic() {
        assert_eq!(sha256_hex(b"hello"), sha256_hex(b"hello"));
        assert_ne!(sha256_hex(b"hello"), sha256_hex(b"world"));
    }

    #[test]
    fn signature_hash_insensitive_to_payload_key_order() {
        let p1 = json!({"key": "chat-1", "n": 2});
        let p2 = json!({"n": 2, "key": "chat-1"});
        let h1 = signature_hash("suggest_reply", "p1", "s1", "t1", &p1).unwrap();
        let h2 = signature_hash("suggest_reply", "p1", "s1", "t1", &p2).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn signature_hash_sensitive_to_scope_changes() {
        let payload = json!({"key": "chat-1"});
        let base = signature_hash("suggest_reply", "p1", "s1", "t1", &payload).unwrap();

        let diff_project = signature_hash("suggest_reply", "p2", "s1", "t1", &payload).unwrap();
        let diff_session = signature_hash("suggest_reply", "p1", "s2", "t1", &payload).unwrap();
        let diff_turn = signature_hash("suggest_reply", "p1", "s1", "t2", &payload).unwrap();
        let diff_action = signature_hash("other_action", "p1", "s1", "t1", &payload).unwrap();

        assert_ne!(base, diff_project);
        assert_ne!(base, diff_session);
        assert_ne!(base, diff_turn);
        assert_ne!(base, diff_action);
    }

    #[test]
    fn signature_hash_sensitive_to_payload_value_changes() {
        let p1 = json!({"key": "chat-1"});
        let p2 = json!({"key": "chat-2"});
        let h1 = signature_hash("suggest_reply", "p1", "s1", "t1", &p1).unwrap();
        let h2 = signature_hash("suggest_reply", "p1", "s1", "t1", &p2).unwrap();
        assert_ne!(h1, h2);
    }

    proptest::proptest! {
        #[test]
        fn stable_json_is_order_insensitive_for_arbitrary_maps(
            keys in proptest::collection::vec("[a-z]{1,5}", 1..6),
            vals in proptest::collection::vec(0i64..1000, 1..6),
        ) {
            let n = keys.len().min(vals.len());
            let mut forward = serde_json::Map::new();
            let mut reversed = serde_json::Map::new();
            for i in 0..n {
                forward.insert(keys[i].clone(), json!(vals[i]));
            }
            for i in (0..n).rev() {
                reversed.insert(keys[i].clone(), json!(vals[i]));
            }
            let a = stable_json(&serde_json::Value::Object(forward)).unwrap();
            let b = stable_json(&serde_json::Value::Object(reversed)).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
