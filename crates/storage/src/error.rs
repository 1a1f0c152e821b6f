use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Record already exists: {0}")]
    Conflict(String),
    #[error("Decrypt failed for record {0}")]
    DecryptFailed(String),
    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
    #[error(transparent)]
    Crypto(#[from] keyring::CryptoError),
    #[error("Canonical JSON error: {0}")]
    Canonical(#[from] canonical::CanonicalJsonError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
