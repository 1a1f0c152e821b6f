//! # Proof Bundles and Verification
//!
//! Export a self-contained, hash-verified, HMAC-signed ZIP of evidence,
//! derived records, ledger entries, anchors, and policy snapshots; verify
//! and replay it fully offline; validate citations against the provenance
//! chain; and re-scan store integrity.

mod bundle;
mod citation;
mod error;
mod integrity;
mod replay;
mod verify;

pub use bundle::{export_proof_bundle, ProofBundleReport};
pub use citation::{CitationContext, CitationResolution, CitationValidator, LedgerView};
pub use error::ProofError;
pub use integrity::{CheckReport, IntegrityReport, IntegrityScanner};
pub use replay::{replay_bundle, ReplayReport};
pub use verify::{verify_proof_bundle, BundleVerification};

/// HKDF info label for the bundle manifest signing key.
pub const MANIFEST_KEY_INFO: &str = "proof_bundle_manifest";
