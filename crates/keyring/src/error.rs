use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("Encryption failed")]
    EncryptFailed,
    #[error("Decryption failed")]
    DecryptFailed,
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),
    #[error("Unknown key id: {0}")]
    UnknownKeyId(String),
    #[error("OS key protection required but unavailable")]
    ProtectionUnavailable,
    #[error("Unsupported keyring schema_version: {0}")]
    UnsupportedSchema(u64),
    #[error("Unsupported KDF for keyring bundle: {0}")]
    UnsupportedKdf(String),
    #[error("Invalid keyring payload: {0}")]
    InvalidPayload(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
