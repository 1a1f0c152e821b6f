//! Run-scoped record IDs with URL-safe component encoding.

use std::sync::OnceLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use regex::Regex;
use uuid::Uuid;

const ENC_PREFIX: &str = "rid_";

fn kind_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_.-]*$").expect("static regex"))
}

/// Fresh run ID: UUIDv4 as 32 lowercase hex characters.
pub fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// `{run_id}/{kind}/{seq}` for capture-order records.
///
/// Panics on an invalid kind in debug builds only; callers pass literal
/// kind strings.
pub fn prefixed_id(run_id: &str, kind: &str, seq: u64) -> String {
    debug_assert!(kind_re().is_match(kind), "invalid id kind: {kind}");
    format!("{run_id}/{kind}/{seq}")
}

/// Prefix `value` with `{run_id}/` unless it already carries it.
pub fn ensure_prefixed(run_id: &str, value: &str) -> String {
    let prefix = format!("{run_id}/");
    if value.starts_with(&prefix) {
        value.to_string()
    } else {
        format!("{prefix}{value}")
    }
}

/// First `/`-separated token of a record ID.
pub fn run_id_of(record_id: &str) -> &str {
    record_id.split('/').next().unwrap_or(record_id)
}

/// Encode an arbitrary string as a path-safe ID component.
pub fn encode_component(value: &str) -> String {
    format!("{ENC_PREFIX}{}", URL_SAFE_NO_PAD.encode(value.as_bytes()))
}

/// Inverse of [`encode_component`]; strings without the `rid_` prefix (or
/// with undecodable payloads) pass through unchanged.
pub fn decode_component(value: &str) -> String {
    let Some(raw) = value.strip_prefix(ENC_PREFIX) else {
        return value.to_string();
    };
    match URL_SAFE_NO_PAD.decode(raw.as_bytes()) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| value.to_string()),
        Err(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        for s in ["", "plain", "run/evidence.capture.frame/12", "päth/∅"] {
            assert_eq!(decode_component(&encode_component(s)), s);
        }
    }

    #[test]
    fn encoded_components_are_path_safe() {
        let enc = encode_component("a/b/c");
        assert!(!enc.contains('/'));
        assert!(enc.starts_with("rid_"));
    }

    #[test]
    fn unknown_strings_pass_through_decode() {
        assert_eq!(decode_component("not-encoded"), "not-encoded");
        assert_eq!(decode_component("rid_!!!"), "rid_!!!");
    }

    #[test]
    fn prefixed_ids_are_stable() {
        assert_eq!(prefixed_id("r1", "ledger.commit", 7), "r1/ledger.commit/7");
        assert_eq!(ensure_prefixed("r1", "x"), "r1/x");
        assert_eq!(ensure_prefixed("r1", "r1/x"), "r1/x");
        assert_eq!(run_id_of("r1/kind/3"), "r1");
    }

    #[test]
    fn run_ids_are_hex_and_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
