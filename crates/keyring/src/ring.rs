//! The keyring proper: purpose key sets, rotation, persistence.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::crypto::random_key;
use crate::error::CryptoError;

/// Key purposes. Every keyring operation is scoped to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Purpose {
    Metadata,
    Media,
    EntityTokens,
    Anchor,
}

pub const PURPOSES: [Purpose; 4] = [
    Purpose::Metadata,
    Purpose::Media,
    Purpose::EntityTokens,
    Purpose::Anchor,
];

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Metadata => "metadata",
            Purpose::Media => "media",
            Purpose::EntityTokens => "entity_tokens",
            Purpose::Anchor => "anchor",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "metadata" => Ok(Purpose::Metadata),
            "media" => Ok(Purpose::Media),
            "entity_tokens" | "tokenization" | "tokens" => Ok(Purpose::EntityTokens),
            "anchor" => Ok(Purpose::Anchor),
            other => Err(CryptoError::InvalidPayload(format!(
                "unknown key purpose: {other}"
            ))),
        }
    }
}

/// One stored key. Material is base64, optionally OS-protected first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRecord {
    pub key_id: String,
    pub created_ts: String,
    pub key_b64: String,
    #[serde(default)]
    pub protected: bool,
}

impl KeyRecord {
    fn key_bytes(&self, protector: Option<&dyn Protector>) -> Result<Vec<u8>, CryptoError> {
        let raw = STANDARD
            .decode(&self.key_b64)
            .map_err(|e| CryptoError::InvalidPayload(format!("key_b64: {e}")))?;
        if !self.protected {
            return Ok(raw);
        }
        match protector {
            Some(p) => p.unprotect(&raw),
            None => Err(CryptoError::ProtectionUnavailable),
        }
    }
}

/// Platform hook for OS-local key wrapping (DPAPI equivalent). The portable
/// build ships none; `require_protection` then fails closed.
pub trait Protector: Send + Sync {
    fn protect(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn unprotect(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PurposeKeySetFile {
    active_key_id: String,
    keys: Vec<KeyRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyringFile {
    schema_version: u64,
    purposes: BTreeMap<String, PurposeKeySetFile>,
}

/// Legacy schema v1: one flat key list shared by all purposes.
#[derive(Debug, Clone, Deserialize)]
struct KeyringFileV1 {
    #[serde(default)]
    active_key_id: Option<String>,
    #[serde(default)]
    keys: Vec<KeyRecord>,
}

#[derive(Default)]
pub struct LoadOptions {
    pub require_protection: bool,
    pub protector: Option<Arc<dyn Protector>>,
}

struct State {
    purposes: BTreeMap<Purpose, PurposeKeySetFile>,
}

/// Purpose-scoped key store backed by a portable JSON file.
///
/// Readers and rotation share a [`RwLock`]; a reader during rotation sees
/// either the pre- or post-rotation record set, never a mix.
pub struct Keyring {
    path: PathBuf,
    require_protection: bool,
    protector: Option<Arc<dyn Protector>>,
    state: RwLock<State>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyringStatus {
    pub keyring_path: String,
    pub active_key_ids: BTreeMap<String, String>,
}

impl Keyring {
    /// Load the keyring, creating a fresh one (one key per purpose) when the
    /// file is absent. Schema v1 files are migrated to v2 and saved back.
    pub fn load(path: impl AsRef<Path>, options: LoadOptions) -> Result<Self, CryptoError> {
        let path = path.as_ref().to_path_buf();
        let protector = options.protector.clone();
        let ring = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            let schema = value
                .get("schema_version")
                .and_then(|v| v.as_u64())
                .unwrap_or(1);
            let purposes = match schema {
                1 => {
                    let legacy: KeyringFileV1 = serde_json::from_value(value)?;
                    let active = legacy
                        .active_key_id
                        .or_else(|| legacy.keys.first().map(|k| k.key_id.clone()))
                        .unwrap_or_default();
                    PURPOSES
                        .iter()
                        .map(|p| {
                            (
                                *p,
                                PurposeKeySetFile {
                                    active_key_id: active.clone(),
                                    keys: legacy.keys.clone(),
                                },
                            )
                        })
                        .collect()
                }
                2 => {
                    let file: KeyringFile = serde_json::from_value(value)?;
                    let mut purposes: BTreeMap<Purpose, PurposeKeySetFile> = BTreeMap::new();
                    for (name, set) in file.purposes {
                        let purpose = Purpose::from_str(&name)?;
                        purposes.insert(purpose, set);
                    }
                    purposes
                }
                other => return Err(CryptoError::UnsupportedSchema(other)),
            };
            let mut ring = Self {
                path,
                require_protection: options.require_protection,
                protector,
                state: RwLock::new(State { purposes }),
            };
            ring.fill_missing_purposes()?;
            ring
        } else {
            let mut purposes = BTreeMap::new();
            for purpose in PURPOSES {
                purposes.insert(
                    purpose,
                    new_keyset(options.require_protection, protector.as_deref())?,
                );
            }
            Self {
                path,
                require_protection: options.require_protection,
                protector,
                state: RwLock::new(State { purposes }),
            }
        };
        ring.verify_protection()?;
        ring.save()?;
        Ok(ring)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn purposes(&self) -> Vec<Purpose> {
        PURPOSES.to_vec()
    }

    pub fn active_key_id(&self, purpose: Purpose) -> String {
        let state = self.state.read().expect("keyring lock");
        state
            .purposes
            .get(&purpose)
            .map(|s| s.active_key_id.clone())
            .unwrap_or_default()
    }

    /// Active `(key_id, key material)` for a purpose.
    pub fn active(&self, purpose: Purpose) -> Result<(String, Vec<u8>), CryptoError> {
        let state = self.state.read().expect("keyring lock");
        let set = state
            .purposes
            .get(&purpose)
            .ok_or_else(|| CryptoError::UnknownKeyId(purpose.to_string()))?;
        let record = set
            .keys
            .iter()
            .find(|r| r.key_id == set.active_key_id)
            .ok_or_else(|| CryptoError::UnknownKeyId(set.active_key_id.clone()))?;
        Ok((
            record.key_id.clone(),
            record.key_bytes(self.protector.as_deref())?,
        ))
    }

    /// Key material for a known `key_id`.
    pub fn key_for(&self, purpose: Purpose, key_id: &str) -> Result<Vec<u8>, CryptoError> {
        let state = self.state.read().expect("keyring lock");
        let set = state
            .purposes
            .get(&purpose)
            .ok_or_else(|| CryptoError::UnknownKeyId(purpose.to_string()))?;
        let record = set
            .keys
            .iter()
            .find(|r| r.key_id == key_id)
            .ok_or_else(|| CryptoError::UnknownKeyId(key_id.to_string()))?;
        record.key_bytes(self.protector.as_deref())
    }

    /// 1-based position of `key_id` within its purpose set.
    pub fn key_version_for(&self, purpose: Purpose, key_id: &str) -> Result<usize, CryptoError> {
        let state = self.state.read().expect("keyring lock");
        let set = state
            .purposes
            .get(&purpose)
            .ok_or_else(|| CryptoError::UnknownKeyId(purpose.to_string()))?;
        set.keys
            .iter()
            .position(|r| r.key_id == key_id)
            .map(|idx| idx + 1)
            .ok_or_else(|| CryptoError::UnknownKeyId(key_id.to_string()))
    }

    /// Ordered decryption candidates: preferred key first, then active, then
    /// the remaining records. Used by stores for mixed-key reads during
    /// rotation windows.
    pub fn candidates(&self, purpose: Purpose, preferred: Option<&str>) -> Vec<(String, Vec<u8>)> {
        let state = self.state.read().expect("keyring lock");
        let Some(set) = state.purposes.get(&purpose) else {
            return Vec::new();
        };
        let mut out: Vec<(String, Vec<u8>)> = Vec::new();
        let mut push = |record: &KeyRecord| {
            if out.iter().any(|(id, _)| id == &record.key_id) {
                return;
            }
            match record.key_bytes(self.protector.as_deref()) {
                Ok(bytes) => out.push((record.key_id.clone(), bytes)),
                Err(err) => warn!(key_id = %record.key_id, %err, "skipping undecodable key record"),
            }
        };
        if let Some(preferred) = preferred {
            if let Some(record) = set.keys.iter().find(|r| r.key_id == preferred) {
                push(record);
            }
        }
        if let Some(record) = set.keys.iter().find(|r| r.key_id == set.active_key_id) {
            push(record);
        }
        for record in &set.keys {
            push(record);
        }
        out
    }

    /// Append a fresh 256-bit key, activate it, persist.
    pub fn rotate(&self, purpose: Purpose) -> Result<String, CryptoError> {
        let record = new_record(self.require_protection, self.protector.as_deref())?;
        let key_id = record.key_id.clone();
        {
            let mut state = self.state.write().expect("keyring lock");
            let set = state
                .purposes
                .entry(purpose)
                .or_insert_with(|| PurposeKeySetFile {
                    active_key_id: String::new(),
                    keys: Vec::new(),
                });
            set.keys.push(record);
            set.active_key_id = key_id.clone();
        }
        self.save()?;
        Ok(key_id)
    }

    pub fn set_active(&self, purpose: Purpose, key_id: &str) -> Result<(), CryptoError> {
        {
            let mut state = self.state.write().expect("keyring lock");
            let set = state
                .purposes
                .get_mut(&purpose)
                .ok_or_else(|| CryptoError::UnknownKeyId(purpose.to_string()))?;
            if !set.keys.iter().any(|r| r.key_id == key_id) {
                return Err(CryptoError::UnknownKeyId(key_id.to_string()));
            }
            set.active_key_id = key_id.to_string();
        }
        self.save()
    }

    pub fn records_for(&self, purpose: Purpose) -> Vec<KeyRecord> {
        let state = self.state.read().expect("keyring lock");
        state
            .purposes
            .get(&purpose)
            .map(|s| s.keys.clone())
            .unwrap_or_default()
    }

    pub fn status(&self) -> KeyringStatus {
        let state = self.state.read().expect("keyring lock");
        KeyringStatus {
            keyring_path: self.path.display().to_string(),
            active_key_ids: state
                .purposes
                .iter()
                .map(|(p, s)| (p.to_string(), s.active_key_id.clone()))
                .collect(),
        }
    }

    /// Persist the v2 file with sorted keys.
    pub fn save(&self) -> Result<(), CryptoError> {
        let file = {
            let state = self.state.read().expect("keyring lock");
            KeyringFile {
                schema_version: 2,
                purposes: state
                    .purposes
                    .iter()
                    .map(|(p, s)| (p.to_string(), s.clone()))
                    .collect(),
            }
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, text)?;
        harden_permissions(&self.path);
        Ok(())
    }

    /// Replace or merge purpose sets from a deserialized bundle payload.
    pub(crate) fn replace_purposes(
        &self,
        purposes: BTreeMap<Purpose, (String, Vec<KeyRecord>)>,
    ) -> Result<(), CryptoError> {
        {
            let mut state = self.state.write().expect("keyring lock");
            for (purpose, (active, keys)) in purposes {
                state
                    .purposes
                    .insert(purpose, PurposeKeySetFile { active_key_id: active, keys });
            }
        }
        self.verify_protection()?;
        self.save()
    }

    pub(crate) fn merge_records(
        &self,
        purpose: Purpose,
        records: Vec<KeyRecord>,
    ) -> Result<(), CryptoError> {
        {
            let mut state = self.state.write().expect("keyring lock");
            let set = state
                .purposes
                .entry(purpose)
                .or_insert_with(|| PurposeKeySetFile {
                    active_key_id: String::new(),
                    keys: Vec::new(),
                });
            for record in records {
                if !set.keys.iter().any(|r| r.key_id == record.key_id) {
                    set.keys.push(record);
                }
            }
            if set.active_key_id.is_empty() {
                if let Some(first) = set.keys.first() {
                    set.active_key_id = first.key_id.clone();
                }
            }
        }
        self.save()
    }

    pub(crate) fn protector(&self) -> Option<&dyn Protector> {
        self.protector.as_deref()
    }

    fn fill_missing_purposes(&mut self) -> Result<(), CryptoError> {
        let mut state = self.state.write().expect("keyring lock");
        for purpose in PURPOSES {
            if !state.purposes.contains_key(&purpose) {
                state.purposes.insert(
                    purpose,
                    new_keyset(self.require_protection, self.protector.as_deref())?,
                );
            }
        }
        Ok(())
    }

    fn verify_protection(&self) -> Result<(), CryptoError> {
        if !self.require_protection {
            return Ok(());
        }
        let state = self.state.read().expect("keyring lock");
        for set in state.purposes.values() {
            for record in &set.keys {
                if !record.protected {
                    return Err(CryptoError::ProtectionUnavailable);
                }
                record.key_bytes(self.protector.as_deref())?;
            }
        }
        Ok(())
    }
}

fn new_record(
    require_protection: bool,
    protector: Option<&dyn Protector>,
) -> Result<KeyRecord, CryptoError> {
    let key = random_key();
    let (material, protected) = match protector {
        Some(p) => (p.protect(&key)?, true),
        None => (key.to_vec(), false),
    };
    if require_protection && !protected {
        return Err(CryptoError::ProtectionUnavailable);
    }
    Ok(KeyRecord {
        key_id: Uuid::new_v4().to_string(),
        created_ts: canonical::now_ts_utc(),
        key_b64: STANDARD.encode(material),
        protected,
    })
}

fn new_keyset(
    require_protection: bool,
    protector: Option<&dyn Protector>,
) -> Result<PurposeKeySetFile, CryptoError> {
    let record = new_record(require_protection, protector)?;
    Ok(PurposeKeySetFile {
        active_key_id: record.key_id.clone(),
        keys: vec![record],
    })
}

#[cfg(unix)]
fn harden_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), %err, "failed to harden keyring permissions");
    }
}

#[cfg(not(unix))]
fn harden_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh_ring(dir: &TempDir) -> Keyring {
        Keyring::load(dir.path().join("keyring.json"), LoadOptions::default()).unwrap()
    }

    #[test]
    fn fresh_ring_has_all_purposes() {
        let dir = TempDir::new().unwrap();
        let ring = fresh_ring(&dir);
        for purpose in PURPOSES {
            let (key_id, key) = ring.active(purpose).unwrap();
            assert!(!key_id.is_empty());
            assert_eq!(key.len(), 32);
        }
    }

    #[test]
    fn rotate_changes_active_and_keeps_old_keys() {
        let dir = TempDir::new().unwrap();
        let ring = fresh_ring(&dir);
        let (old_id, old_key) = ring.active(Purpose::Metadata).unwrap();
        let new_id = ring.rotate(Purpose::Metadata).unwrap();
        assert_ne!(old_id, new_id);
        assert_eq!(ring.active_key_id(Purpose::Metadata), new_id);
        assert_eq!(ring.key_for(Purpose::Metadata, &old_id).unwrap(), old_key);
        assert_eq!(ring.key_version_for(Purpose::Metadata, &new_id).unwrap(), 2);
    }

    #[test]
    fn candidates_order_preferred_then_active() {
        let dir = TempDir::new().unwrap();
        let ring = fresh_ring(&dir);
        let (first, _) = ring.active(Purpose::Media).unwrap();
        let second = ring.rotate(Purpose::Media).unwrap();
        let third = ring.rotate(Purpose::Media).unwrap();

        let cands = ring.candidates(Purpose::Media, Some(&first));
        let ids: Vec<&str> = cands.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids[0], first);
        assert_eq!(ids[1], third);
        assert!(ids.contains(&second.as_str()));
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn reload_round_trips_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keyring.json");
        let active = {
            let ring = Keyring::load(&path, LoadOptions::default()).unwrap();
            ring.rotate(Purpose::Anchor).unwrap()
        };
        let ring = Keyring::load(&path, LoadOptions::default()).unwrap();
        assert_eq!(ring.active_key_id(Purpose::Anchor), active);
        assert_eq!(ring.records_for(Purpose::Anchor).len(), 2);
    }

    #[test]
    fn require_protection_fails_closed_without_protector() {
        let dir = TempDir::new().unwrap();
        let result = Keyring::load(
            dir.path().join("keyring.json"),
            LoadOptions {
                require_protection: true,
                protector: None,
            },
        );
        assert!(matches!(result, Err(CryptoError::ProtectionUnavailable)));
    }

    #[test]
    fn unknown_key_id_is_an_error() {
        let dir = TempDir::new().unwrap();
        let ring = fresh_ring(&dir);
        assert!(matches!(
            ring.key_for(Purpose::Metadata, "nope"),
            Err(CryptoError::UnknownKeyId(_))
        ));
    }
}
