//! Purpose-scoped data keys derived from keyring roots.

use std::sync::Arc;

use keyring::{derive_key, Keyring, Purpose};

use crate::error::StoreError;

/// Derives the actual AEAD data key for one purpose from the keyring's root
/// keys. Each store owns one provider; rotation of the underlying purpose is
/// picked up on the next call.
#[derive(Clone)]
pub struct DerivedKeyProvider {
    keyring: Arc<Keyring>,
    purpose: Purpose,
}

impl DerivedKeyProvider {
    pub fn new(keyring: Arc<Keyring>, purpose: Purpose) -> Self {
        Self { keyring, purpose }
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    /// Active `(key_id, data key)`.
    pub fn active(&self) -> Result<(String, [u8; 32]), StoreError> {
        let (key_id, root) = self.keyring.active(self.purpose)?;
        Ok((key_id, derive_key(&root, self.purpose.as_str())?))
    }

    /// Data key for a specific root `key_id`.
    pub fn for_id(&self, key_id: &str) -> Result<[u8; 32], StoreError> {
        let root = self.keyring.key_for(self.purpose, key_id)?;
        Ok(derive_key(&root, self.purpose.as_str())?)
    }

    /// Ordered decryption candidates (preferred, active, rest).
    pub fn candidates(&self, preferred: Option<&str>) -> Vec<(String, [u8; 32])> {
        self.keyring
            .candidates(self.purpose, preferred)
            .into_iter()
            .filter_map(|(key_id, root)| {
                derive_key(&root, self.purpose.as_str())
                    .ok()
                    .map(|key| (key_id, key))
            })
            .collect()
    }

    pub fn key_version_for(&self, key_id: &str) -> Result<usize, StoreError> {
        Ok(self.keyring.key_version_for(self.purpose, key_id)?)
    }
}
