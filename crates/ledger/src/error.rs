use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger entry missing fields: {0:?}")]
    MissingFields(Vec<String>),
    #[error("Journal entry missing fields: {0:?}")]
    JournalMissingFields(Vec<String>),
    #[error("ledger_hash_mismatch at entry {0}")]
    HashMismatch(usize),
    #[error("ledger_chain_gap at entry {0}")]
    ChainGap(usize),
    #[error("anchor_hmac_mismatch at anchor_seq {0}")]
    AnchorHmacMismatch(u64),
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
    #[error(transparent)]
    Crypto(#[from] keyring::CryptoError),
    #[error("Canonical JSON error: {0}")]
    Canonical(#[from] canonical::CanonicalJsonError),
    #[error(transparent)]
    Store(#[from] storage::StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
