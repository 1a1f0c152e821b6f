//! Encrypted JSON metadata store.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use canonical::decode_component;
use keyring::{decrypt_bytes, encrypt_bytes, EncryptedBlob};
use serde_json::Value;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::fsync::FsyncPolicy;
use crate::paths::{record_file_name, record_rel_path};
use crate::provider::DerivedKeyProvider;

/// Minimal record KV surface shared by the encrypted store and the
/// in-memory store used in tests and bundle replay.
pub trait RawStore: Send + Sync {
    fn get(&self, record_id: &str) -> Result<Option<Value>, StoreError>;
    fn put(&self, record_id: &str, value: &Value) -> Result<(), StoreError>;
    fn put_new(&self, record_id: &str, value: &Value) -> Result<(), StoreError>;
    fn delete(&self, record_id: &str) -> Result<bool, StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// File-per-record store. Each record is serialized JSON sealed into an
/// [`EncryptedBlob`] and written under the partitioned layout.
pub struct EncryptedJsonStore {
    root: PathBuf,
    provider: DerivedKeyProvider,
    require_decrypt: bool,
    fsync: FsyncPolicy,
    // Write-through location cache; get() falls back to a walk on miss.
    locations: RwLock<HashMap<String, PathBuf>>,
}

impl EncryptedJsonStore {
    pub fn new(
        root: impl AsRef<Path>,
        provider: DerivedKeyProvider,
        require_decrypt: bool,
        fsync: FsyncPolicy,
    ) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            provider,
            require_decrypt,
            fsync,
            locations: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn find_path(&self, record_id: &str) -> Option<PathBuf> {
        if let Some(path) = self.locations.read().expect("store lock").get(record_id) {
            if path.exists() {
                return Some(path.clone());
            }
        }
        let file_name = record_file_name(record_id, "json");
        // Flat legacy layout first, then the partitioned walk.
        let legacy = self.root.join(&file_name);
        let found = if legacy.exists() {
            Some(legacy)
        } else {
            WalkDir::new(&self.root)
                .into_iter()
                .filter_map(|e| e.ok())
                .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == file_name)
                .map(|e| e.path().to_path_buf())
        };
        if let Some(path) = &found {
            self.locations
                .write()
                .expect("store lock")
                .insert(record_id.to_string(), path.clone());
        }
        found
    }

    fn write_blob(&self, path: &Path, blob: &EncryptedBlob) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(serde_json::to_string(blob)?.as_bytes())?;
            self.fsync.sync(&file, true)?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn decrypt(&self, record_id: &str, blob: &EncryptedBlob) -> Result<Option<Value>, StoreError> {
        for (_key_id, key) in self.provider.candidates(blob.key_id.as_deref()) {
            if let Ok(plain) = decrypt_bytes(&key, blob, None) {
                return Ok(Some(serde_json::from_slice(&plain)?));
            }
        }
        if self.require_decrypt {
            return Err(StoreError::DecryptFailed(record_id.to_string()));
        }
        warn!(record_id, "metadata record undecryptable with all candidates");
        Ok(None)
    }

    /// Re-encrypt every record under the current active key. Returns the
    /// number of records rewrapped.
    pub fn rewrap(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        for record_id in self.keys()? {
            if let Some(value) = self.get(&record_id)? {
                self.put(&record_id, &value)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// The raw stored key_id of a record, for rotation audits.
    pub fn stored_key_id(&self, record_id: &str) -> Result<Option<String>, StoreError> {
        let Some(path) = self.find_path(record_id) else {
            return Ok(None);
        };
        let blob: EncryptedBlob = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(blob.key_id)
    }
}

impl RawStore for EncryptedJsonStore {
    fn get(&self, record_id: &str) -> Result<Option<Value>, StoreError> {
        let Some(path) = self.find_path(record_id) else {
            return Ok(None);
        };
        let blob: EncryptedBlob = serde_json::from_str(&fs::read_to_string(path)?)?;
        self.decrypt(record_id, &blob)
    }

    fn put(&self, record_id: &str, value: &Value) -> Result<(), StoreError> {
        let (key_id, key) = self.provider.active()?;
        let plain = serde_json::to_vec(value)?;
        let blob = encrypt_bytes(&key, &plain, None, Some(&key_id))?;
        let path = match self.find_path(record_id) {
            Some(existing) => existing,
            None => self.root.join(record_rel_path(record_id, Some(value), "json")),
        };
        self.write_blob(&path, &blob)?;
        self.locations
            .write()
            .expect("store lock")
            .insert(record_id.to_string(), path);
        Ok(())
    }

    fn put_new(&self, record_id: &str, value: &Value) -> Result<(), StoreError> {
        if self.find_path(record_id).is_some() {
            return Err(StoreError::Conflict(record_id.to_string()));
        }
        self.put(record_id, value)
    }

    fn delete(&self, record_id: &str) -> Result<bool, StoreError> {
        let Some(path) = self.find_path(record_id) else {
            return Ok(false);
        };
        fs::remove_file(path)?;
        self.locations.write().expect("store lock").remove(record_id);
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(decode_component(stem));
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// In-memory store used by tests and offline bundle replay.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: BTreeMap<String, Value>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }
}

impl RawStore for MemoryStore {
    fn get(&self, record_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.records.read().expect("store lock").get(record_id).cloned())
    }

    fn put(&self, record_id: &str, value: &Value) -> Result<(), StoreError> {
        self.records
            .write()
            .expect("store lock")
            .insert(record_id.to_string(), value.clone());
        Ok(())
    }

    fn put_new(&self, record_id: &str, value: &Value) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("store lock");
        if records.contains_key(record_id) {
            return Err(StoreError::Conflict(record_id.to_string()));
        }
        records.insert(record_id.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, record_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .write()
            .expect("store lock")
            .remove(record_id)
            .is_some())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records.read().expect("store lock").keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyring::{Keyring, LoadOptions, Purpose};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> (Arc<Keyring>, EncryptedJsonStore) {
        let ring = Arc::new(
            Keyring::load(dir.path().join("vault/keyring.json"), LoadOptions::default()).unwrap(),
        );
        let provider = DerivedKeyProvider::new(ring.clone(), Purpose::Metadata);
        let store = EncryptedJsonStore::new(
            dir.path().join("metadata"),
            provider,
            true,
            FsyncPolicy::Critical,
        )
        .unwrap();
        (ring, store)
    }

    #[test]
    fn put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let (_ring, store) = store(&dir);
        let record = json!({"record_type": "evidence.capture.frame", "ts_utc": "2026-01-02T00:00:00Z", "n": 1});
        store.put("run1/capture.frame/1", &record).unwrap();
        assert_eq!(store.get("run1/capture.frame/1").unwrap(), Some(record));
        assert_eq!(store.get("run1/capture.frame/2").unwrap(), None);
    }

    #[test]
    fn put_new_conflicts_on_existing() {
        let dir = TempDir::new().unwrap();
        let (_ring, store) = store(&dir);
        let record = json!({"record_type": "evidence.capture.frame", "ts_utc": "2026-01-02T00:00:00Z"});
        store.put_new("run1/capture.frame/1", &record).unwrap();
        assert!(matches!(
            store.put_new("run1/capture.frame/1", &record),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn on_disk_content_is_ciphertext() {
        let dir = TempDir::new().unwrap();
        let (_ring, store) = store(&dir);
        let record = json!({"record_type": "evidence.capture.frame", "ts_utc": "2026-01-02T00:00:00Z", "secret": "visible-text"});
        store.put("run1/capture.frame/1", &record).unwrap();
        for entry in WalkDir::new(store.root()).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                let raw = fs::read_to_string(entry.path()).unwrap();
                assert!(!raw.contains("visible-text"));
                assert!(raw.contains("ciphertext_b64"));
            }
        }
    }

    #[test]
    fn rotation_keeps_old_records_readable_and_rewrap_reencrypts() {
        let dir = TempDir::new().unwrap();
        let (ring, store) = store(&dir);
        let rec1 = json!({"record_type": "evidence.capture.frame", "ts_utc": "2026-01-02T00:00:00Z", "text": "hello"});
        store.put("run1/capture.frame/1", &rec1).unwrap();

        let new_key = ring.rotate(Purpose::Metadata).unwrap();
        let rec2 = json!({"record_type": "evidence.capture.frame", "ts_utc": "2026-01-02T00:00:01Z", "text": "world"});
        store.put("run1/capture.frame/2", &rec2).unwrap();

        assert_eq!(store.get("run1/capture.frame/1").unwrap(), Some(rec1));
        assert_eq!(store.get("run1/capture.frame/2").unwrap(), Some(rec2));

        store.rewrap().unwrap();
        for id in ["run1/capture.frame/1", "run1/capture.frame/2"] {
            assert_eq!(store.stored_key_id(id).unwrap().as_deref(), Some(new_key.as_str()));
        }
    }

    #[test]
    fn keys_walk_is_sorted() {
        let dir = TempDir::new().unwrap();
        let (_ring, store) = store(&dir);
        for n in [3u64, 1, 2] {
            let record = json!({"record_type": "evidence.capture.frame", "ts_utc": "2026-01-02T00:00:00Z", "n": n});
            store.put(&format!("run1/capture.frame/{n}"), &record).unwrap();
        }
        let keys = store.keys().unwrap();
        assert_eq!(
            keys,
            vec![
                "run1/capture.frame/1",
                "run1/capture.frame/2",
                "run1/capture.frame/3"
            ]
        );
    }
}
