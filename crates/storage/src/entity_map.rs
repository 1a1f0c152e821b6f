//! Persisted entity-token map, sealed under the `entity_tokens` purpose.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use keyring::{decrypt_bytes, encrypt_bytes, EncryptedBlob};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;
use crate::provider::DerivedKeyProvider;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityTokenRecord {
    pub value: String,
    pub kind: String,
    pub key_id: String,
    pub key_version: u64,
    pub first_seen_ts: String,
}

/// Small encrypted map of `token -> entity value`. Rotation of the
/// `entity_tokens` purpose changes the token surface and is logged.
pub struct EntityTokenStore {
    path: PathBuf,
    provider: DerivedKeyProvider,
    persist: bool,
    data: RwLock<BTreeMap<String, EntityTokenRecord>>,
}

impl EntityTokenStore {
    pub fn open(
        root: impl AsRef<Path>,
        provider: DerivedKeyProvider,
        persist: bool,
    ) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let path = root.join("entity_map.json");
        let data = if persist && path.exists() {
            let blob: EncryptedBlob = serde_json::from_str(&fs::read_to_string(&path)?)?;
            let mut decoded = None;
            for (_id, key) in provider.candidates(blob.key_id.as_deref()) {
                if let Ok(plain) = decrypt_bytes(&key, &blob, None) {
                    decoded = Some(serde_json::from_slice(&plain)?);
                    break;
                }
            }
            decoded.ok_or_else(|| StoreError::DecryptFailed("entity_map".into()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            provider,
            persist,
            data: RwLock::new(data),
        })
    }

    pub fn put(&self, token: &str, value: &str, kind: &str) -> Result<(), StoreError> {
        let (key_id, _key) = self.provider.active()?;
        let key_version = self.provider.key_version_for(&key_id)? as u64;
        {
            let mut data = self.data.write().expect("entity lock");
            data.entry(token.to_string())
                .or_insert_with(|| EntityTokenRecord {
                    value: value.to_string(),
                    kind: kind.to_string(),
                    key_id,
                    key_version,
                    first_seen_ts: canonical::now_ts_utc(),
                });
        }
        if self.persist {
            self.save()?;
        }
        Ok(())
    }

    pub fn get(&self, token: &str) -> Option<EntityTokenRecord> {
        self.data.read().expect("entity lock").get(token).cloned()
    }

    pub fn items(&self) -> BTreeMap<String, EntityTokenRecord> {
        self.data.read().expect("entity lock").clone()
    }

    pub fn len(&self) -> usize {
        self.data.read().expect("entity lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-seal the map under the current active key.
    pub fn rewrap(&self) -> Result<usize, StoreError> {
        if !self.persist {
            return Ok(0);
        }
        self.save()?;
        info!(purpose = %self.provider.purpose(), "entity token map re-encrypted");
        Ok(1)
    }

    fn save(&self) -> Result<(), StoreError> {
        let payload = {
            let data = self.data.read().expect("entity lock");
            serde_json::to_vec(&*data)?
        };
        let (key_id, key) = self.provider.active()?;
        let blob = encrypt_bytes(&key, &payload, None, Some(&key_id))?;
        fs::write(&self.path, serde_json::to_string(&blob)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyring::{Keyring, LoadOptions, Purpose};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn tokens_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let ring = Arc::new(
            Keyring::load(dir.path().join("vault/keyring.json"), LoadOptions::default()).unwrap(),
        );
        let provider = DerivedKeyProvider::new(ring.clone(), Purpose::EntityTokens);
        {
            let store =
                EntityTokenStore::open(dir.path().join("entity_map"), provider.clone(), true)
                    .unwrap();
            store.put("tok_1", "alice@example.com", "email").unwrap();
        }
        let store = EntityTokenStore::open(dir.path().join("entity_map"), provider, true).unwrap();
        let record = store.get("tok_1").unwrap();
        assert_eq!(record.value, "alice@example.com");
        assert_eq!(record.kind, "email");
        assert_eq!(record.key_version, 1);
    }

    #[test]
    fn first_seen_wins() {
        let dir = TempDir::new().unwrap();
        let ring = Arc::new(
            Keyring::load(dir.path().join("vault/keyring.json"), LoadOptions::default()).unwrap(),
        );
        let provider = DerivedKeyProvider::new(ring, Purpose::EntityTokens);
        let store = EntityTokenStore::open(dir.path().join("entity_map"), provider, false).unwrap();
        store.put("tok", "first", "email").unwrap();
        store.put("tok", "second", "email").unwrap();
        assert_eq!(store.get("tok").unwrap().value, "first");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn readable_after_rotation() {
        let dir = TempDir::new().unwrap();
        let ring = Arc::new(
            Keyring::load(dir.path().join("vault/keyring.json"), LoadOptions::default()).unwrap(),
        );
        let provider = DerivedKeyProvider::new(ring.clone(), Purpose::EntityTokens);
        {
            let store =
                EntityTokenStore::open(dir.path().join("entity_map"), provider.clone(), true)
                    .unwrap();
            store.put("tok", "value", "hex").unwrap();
        }
        ring.rotate(Purpose::EntityTokens).unwrap();
        let store = EntityTokenStore::open(dir.path().join("entity_map"), provider, true).unwrap();
        assert_eq!(store.get("tok").unwrap().value, "value");
        assert_eq!(store.rewrap().unwrap(), 1);
    }
}
