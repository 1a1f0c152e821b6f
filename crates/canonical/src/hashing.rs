//! Deterministic hashing and text normalization.

use serde_json::Value;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::json::{to_canonical_bytes, CanonicalJsonError};

/// Version of [`normalize_text`]. Recorded on every derived text record so
/// downstream caches can be invalidated when normalization changes.
pub const TEXT_NORM_VERSION: u32 = 1;

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_bytes_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex-encoded SHA-256 of the UTF-8 bytes of a string.
pub fn sha256_text(text: &str) -> String {
    sha256_bytes_hex(text.as_bytes())
}

/// Hex-encoded SHA-256 of the canonical JSON form of a value.
pub fn sha256_canonical(value: &Value) -> Result<String, CanonicalJsonError> {
    Ok(sha256_bytes_hex(&to_canonical_bytes(value)?))
}

/// Hex-encoded BLAKE3 of raw bytes. Opportunistic file-level addressing
/// only; ledgers, citations, and manifests stay on SHA-256.
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// NFC normalization, whitespace collapse, and trim.
pub fn normalize_text(text: &str) -> String {
    let nfc: String = text.nfc().collect();
    nfc.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_hash_is_order_independent() {
        let a = json!({"x": 1, "y": "é"});
        let b = json!({"y": "e\u{0301}", "x": 1});
        assert_eq!(sha256_canonical(&a).unwrap(), sha256_canonical(&b).unwrap());
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  hello \t\n world  "), "hello world");
        assert_eq!(normalize_text("e\u{0301}"), "\u{00e9}");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn sha256_text_matches_bytes() {
        assert_eq!(sha256_text("hello"), sha256_bytes_hex(b"hello"));
    }
}
