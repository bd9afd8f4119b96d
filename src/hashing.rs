//! Content-addressed identity for processable units.
//!
//! Every unit that flows through the pipeline is identified by the SHA-256 of
//! a canonical JSON rendering of its semantic content: object keys sorted at
//! every depth, no whitespace, arrays kept in order. Two payloads that differ
//! only in key order or formatting therefore hash identically, which is what
//! lets a conversation that was exported twice be recognised as already
//! processed.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::HashingError;

/// Hash any serializable content into its identity hash (lowercase hex).
pub fn identity_hash<T: Serialize + ?Sized>(content: &T) -> Result<String, HashingError> {
    let value =
        serde_json::to_value(content).map_err(|e| HashingError::NotSerializable(e.to_string()))?;
    Ok(hash_value(&value))
}

/// Hash an already-parsed JSON value.
pub fn hash_value(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    sha256_hex(canonical.as_bytes())
}

/// Hash a set of unit hashes into one corpus-level hash.
///
/// Order and duplicates do not matter: the input is sorted and deduplicated
/// before hashing.
pub fn corpus_hash<'a, I>(hashes: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sorted: Vec<&str> = hashes.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for h in sorted {
        hasher.update(h.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Bind a corpus hash to the settings the aggregate was computed with.
pub fn salted_corpus_hash(corpus: &str, salt: Option<&str>) -> String {
    match salt {
        Some(salt) => sha256_hex(format!("{}\n{}", salt, corpus).as_bytes()),
        None => corpus.to_string(),
    }
}

/// Reject vectors that cannot be hashed faithfully.
///
/// `serde_json` renders NaN and infinities as `null`, which would silently
/// collapse distinct vectors onto one hash.
pub fn ensure_finite(values: &[f32]) -> Result<(), HashingError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(HashingError::NonFiniteNumber)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a &str cannot fail.
    out.push_str(&serde_json::to_string(s).unwrap_or_default());
}
