//! # Compaction, Backup, and Exports
//!
//! Operator-facing maintenance surfaces of the provenance kernel:
//!
//! - **Compaction** deletes derived records and index files only; evidence
//!   and the ledger are never touched.
//! - **Backup bundles** are deterministic ZIPs of the provenance chain plus
//!   config, restored without ever deleting existing files.
//! - **Transcript export** writes a hash-chained NDJSON export of
//!   ChatGPT-related capture segments.
//! - **Operator ledger** records every operator mutation as journal and
//!   ledger entries.

mod backup;
mod compaction;
mod error;
mod operator;
mod transcript;

pub use backup::{create_backup_bundle, restore_backup_bundle, BackupOptions, BackupReport, RestoreReport};
pub use compaction::{compact_derived, CompactionResult};
pub use error::ArchiveError;
pub use operator::record_operator_action;
pub use transcript::{export_chatgpt_transcripts, Sanitizer, TranscriptExportReport};
