use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Output already exists: {0}")]
    OutputExists(String),
    #[error("Missing required path: {0}")]
    MissingRequiredPath(String),
    #[error("Bundle integrity check failed: {0:?}")]
    IntegrityCheckFailed(Vec<String>),
    #[error("Bundle invalid: {0}")]
    BundleInvalid(String),
    #[error("Missing keyring bundle passphrase")]
    MissingPassphrase,
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
