use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("Validation failed for {record_id}: {reason}")]
    Validation { record_id: String, reason: String },
    #[error("Refusing to overwrite immutable record {0}")]
    Immutable(String),
    #[error("Record already exists: {0}")]
    Conflict(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Refusing to delete non-derived record {0}")]
    DeletePolicy(String),
    #[error(transparent)]
    Store(#[from] storage::StoreError),
    #[error(transparent)]
    Ledger(#[from] ledger::LedgerError),
    #[error("Canonical JSON error: {0}")]
    Canonical(#[from] canonical::CanonicalJsonError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EvidenceError {
    pub fn validation(record_id: &str, reason: impl Into<String>) -> Self {
        EvidenceError::Validation {
            record_id: record_id.to_string(),
            reason: reason.into(),
        }
    }
}
