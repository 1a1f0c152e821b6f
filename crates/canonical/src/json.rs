//! Canonical JSON serialization.

use serde_json::{Map, Value};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanonicalJsonError {
    #[error("Floats are not permitted in canonical JSON")]
    FloatRejected,
    #[error("JSON serialization failed: {0}")]
    Serialize(String),
}

/// Recursively normalize a JSON value into its canonical form.
///
/// String values are NFC-normalized, arrays preserve order, and any number
/// that is not an integer (including NaN/Inf, which serde_json already
/// refuses to represent) is rejected.
pub fn canonicalize(value: &Value) -> Result<Value, CanonicalJsonError> {
    match value {
        Value::Null | Value::Bool(_) => Ok(value.clone()),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Ok(value.clone())
            } else {
                Err(CanonicalJsonError::FloatRejected)
            }
        }
        Value::String(s) => Ok(Value::String(s.nfc().collect())),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(canonicalize(item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            // serde_json's default map is ordered by key, so inserting into a
            // fresh map yields sorted serialization.
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), canonicalize(item)?);
            }
            Ok(Value::Object(out))
        }
    }
}

/// Canonical JSON string: sorted keys, no whitespace, non-ASCII preserved.
pub fn to_canonical_string(value: &Value) -> Result<String, CanonicalJsonError> {
    let normalized = canonicalize(value)?;
    serde_json::to_string(&normalized).map_err(|e| CanonicalJsonError::Serialize(e.to_string()))
}

/// Canonical JSON as UTF-8 bytes.
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalJsonError> {
    Ok(to_canonical_string(value)?.into_bytes())
}
