//! # Canonical Serialization and Identity
//!
//! Deterministic building blocks shared by every store and verifier in the
//! provenance kernel:
//!
//! - **Canonical JSON**: NFC-normalized strings, sorted keys, no whitespace,
//!   floats rejected. Two semantically equal inputs always serialize to
//!   byte-identical UTF-8.
//! - **Hashing**: SHA-256 is the portable contract for ledgers, citations,
//!   and manifests; BLAKE3 is available for opportunistic file-level content
//!   addressing.
//! - **IDs**: run-scoped namespaced record IDs with URL-safe component
//!   encoding so arbitrary strings never leak path separators.

pub mod hashing;
pub mod ids;
pub mod json;
pub mod time;

pub use hashing::{
    blake3_hex, normalize_text, sha256_bytes_hex, sha256_canonical, sha256_text, TEXT_NORM_VERSION,
};
pub use ids::{
    decode_component, encode_component, ensure_prefixed, new_run_id, prefixed_id, run_id_of,
};
pub use json::{canonicalize, to_canonical_bytes, to_canonical_string, CanonicalJsonError};
pub use time::{now_ts_utc, parse_ts_utc, ts_utc_to_ms};
