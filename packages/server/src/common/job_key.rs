//! Deterministic job keys for idempotent job creation.
//!
//! Two logically identical submissions must collapse to one job. The key is
//! `SHA256("{org_id}:{type}:{canonical_payload}")` hex-encoded, where the
//! canonical payload serialization sorts object keys and emits no whitespace,
//! so key order in the incoming JSON never changes the hash.
//!
//! The caller decides which payload fields are idempotency-relevant;
//! transient fields (timestamps, correlation ids) must be stripped before
//! hashing. Unknown fields participate; the hasher is agnostic.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Serialize a JSON value to its canonical form: object keys sorted
/// lexicographically, compact separators, one encoding per primitive.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        // Scalars already have a single unambiguous serde_json encoding.
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

/// Compute the tenant-scoped idempotency fingerprint for a job.
pub fn job_key(org_id: Uuid, job_type: &str, payload: &Value) -> String {
    let canonical = format!("{}:{}:{}", org_id, job_type, canonical_json(payload));
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// SHA-256 of a text body, truncated to 16 hex chars. Used to key embedding
/// jobs on content without storing the content.
pub fn text_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)[..16].to_string()
}
