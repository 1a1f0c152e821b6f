//! # Evidence Kernel
//!
//! The append-only record layer: schema validation for evidence and derived
//! records, the immutability gate over the encrypted metadata store,
//! derived-record builders, and the staged two-phase evidence write with
//! deterministic recovery.

mod derived;
mod error;
mod schema;
mod store;
mod writer;

pub use derived::{
    build_derivation_edge, build_span_ref, build_text_record, build_unavailable_record,
    derivation_edge_id, model_identity, persist_unavailable_record,
};
pub use error::EvidenceError;
pub use schema::{is_derived_record, is_evidence_record, validate_record, EVIDENCE_RECORD_TYPES};
pub use store::ImmutableMetadataStore;
pub use writer::{
    recover_incomplete_evidence_writes, write_evidence_staged, EvidenceWriteReport, RecoveryReport,
};
