//! Stable cache keys for backend requests

use crate::backend::Parameters;
use blake3::Hasher;
use formcalc_types::Value;
use std::borrow::Cow;
use std::fmt;

/// Namespace of every external data cache key
pub const KEY_PREFIX: &str = "external";

/// Fingerprint of a (method id, parameters) request
///
/// Rendered as `external:{method_id}:{blake3 hex}` so that prefix
/// invalidation can target a single method. `%` and `:` in the method id are
/// percent-encoded, so one method's prefix never matches another method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(method_id: &str, parameters: &Parameters) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(method_id.as_bytes());
        hasher.update(&[0]);
        for (name, value) in parameters {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hash_value(&mut hasher, value);
        }
        CacheKey(format!(
            "{}{}",
            Self::method_prefix(method_id),
            hasher.finalize().to_hex()
        ))
    }

    /// Prefix matching every key of one method
    pub fn method_prefix(method_id: &str) -> String {
        format!("{}:{}:", KEY_PREFIX, escape_method(method_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_method(method_id: &str) -> Cow<'_, str> {
    if !method_id.contains([':', '%']) {
        return Cow::Borrowed(method_id);
    }
    let mut escaped = String::with_capacity(method_id.len() + 4);
    for c in method_id.chars() {
        match c {
            ':' => escaped.push_str("%3A"),
            '%' => escaped.push_str("%25"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Feed a value into the hasher in a tagged, order-stable form
///
/// Numbers are normalized so `1.50` and `1.5` share a key.
fn hash_value(hasher: &mut Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(b"n");
        }
        Value::Bool(b) => {
            hasher.update(if *b { b"t" } else { b"f" });
        }
        Value::Number(n) => {
            hasher.update(b"d");
            hasher.update(n.normalize().to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::DateTime(dt) => {
            hasher.update(b"T");
            hasher.update(dt.and_utc().timestamp_micros().to_le_bytes().as_slice());
        }
        Value::Array(items) => {
            hasher.update(b"a");
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update(b"o");
            hasher.update(&(map.len() as u64).to_le_bytes());
            for (key, item) in map {
                hasher.update(&(key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                hash_value(hasher, item);
            }
        }
    }
}
