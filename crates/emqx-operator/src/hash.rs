//! Pod template revision hashing
//!
//! Produces the short, label-safe fingerprint stored in
//! [`POD_TEMPLATE_HASH_LABEL`](crate::crd::POD_TEMPLATE_HASH_LABEL) and used
//! as the suffix of replicant ReplicaSet names.

use crate::error::Result;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Alphabet without vowels or look-alike characters, so generated names
/// never spell words and stay valid in labels.
const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Length of the rendered hash
const HASH_LEN: usize = 10;

/// Compute the revision hash of a pod template.
///
/// The template is canonicalized (object keys sorted) before hashing, so two
/// semantically equal templates always hash the same. The collision count,
/// when present, is mixed in to derive a fresh name after a collision.
pub fn compute_hash(template: &PodTemplateSpec, collision_count: Option<i32>) -> Result<String> {
    let value = serde_json::to_value(template)?;
    let canonical = serde_json::to_vec(&canonicalize(value))?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    if let Some(count) = collision_count {
        hasher.update((count as u32).to_le_bytes());
    }
    let digest = hasher.finalize();

    let folded = digest
        .iter()
        .take(8)
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));

    Ok(encode_safe(folded))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn encode_safe(mut n: u64) -> String {
    let base = SAFE_ALPHABET.len() as u64;
    let mut out = String::with_capacity(HASH_LEN);
    for _ in 0..HASH_LEN {
        out.push(SAFE_ALPHABET[(n % base) as usize] as char);
        n /= base;
    }
    out
}
