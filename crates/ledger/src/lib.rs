//! # Ledger, Journal, Anchors
//!
//! The append-only provenance chain:
//!
//! - [`LedgerWriter`] - one-line-per-entry hash chain. Entry *n* commits to
//!   entry *n-1* via `prev_hash`; the head is the most recent `entry_hash`.
//! - [`JournalWriter`] - ordered NDJSON event journal, the begin-marker
//!   surface for staged evidence writes.
//! - [`AnchorWriter`] - periodic HMAC-signed commitments to the ledger head.
//! - [`EventBuilder`] - the single process-wide funnel that serializes
//!   journal/ledger emission, stamps the policy snapshot hash, and evaluates
//!   the anchor schedule.
//!
//! Verification never modifies files.

mod anchor;
mod error;
mod events;
mod journal;
mod ledger_file;
mod policy;

pub use anchor::{
    decode_anchor_line, read_anchors, verify_anchor_hmac, verify_anchors, AnchorVerification,
    AnchorWriter,
};
pub use error::LedgerError;
pub use events::{AnchorSchedule, EventBuilder};
pub use journal::{read_journal, JournalWriter};
pub use ledger_file::{
    read_ledger, strict_ledger_required, verify_entries, verify_ledger, LedgerVerification,
    LedgerWriter,
};
pub use policy::{
    persist_policy_snapshot, policy_snapshot_hash, policy_snapshot_payload,
    policy_snapshot_record_id, PolicySnapshotPersistResult,
};

/// Environment flag gating strict citation-time ledger-head matching.
pub const STRICT_LEDGER_ENV: &str = "AUTOCAPTURE_CITATION_REQUIRE_STRICT_LEDGER";
