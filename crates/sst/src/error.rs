use thiserror::Error;

#[derive(Error, Debug)]
pub enum SstError {
    #[error("Unable to decode image bytes: {0}")]
    ImageDecode(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Provider {provider_id} failed: {reason}")]
    Provider { provider_id: String, reason: String },
    #[error("Aborted by caller")]
    Aborted,
    #[error("Deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Evidence(#[from] evidence::EvidenceError),
    #[error(transparent)]
    Ledger(#[from] ledger::LedgerError),
    #[error("Canonical JSON error: {0}")]
    Canonical(#[from] canonical::CanonicalJsonError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
