use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProofError {
    #[error("Missing evidence ids")]
    MissingEvidenceIds,
    #[error("Citation validation failed: {0}")]
    CitationInvalid(String),
    #[error("Bundle invalid: {0}")]
    BundleInvalid(String),
    #[error(transparent)]
    Evidence(#[from] evidence::EvidenceError),
    #[error(transparent)]
    Ledger(#[from] ledger::LedgerError),
    #[error(transparent)]
    Store(#[from] storage::StoreError),
    #[error(transparent)]
    Crypto(#[from] keyring::CryptoError),
    #[error("Canonical JSON error: {0}")]
    Canonical(#[from] canonical::CanonicalJsonError),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
