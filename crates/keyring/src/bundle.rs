//! Portable keyring bundles and plain key export/import.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use scrypt::Params;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crypto::{decrypt_bytes, encrypt_bytes, EncryptedBlob};
use crate::error::CryptoError;
use crate::ring::{KeyRecord, Keyring, LoadOptions, Protector, Purpose};

const BUNDLE_AAD: &[u8] = b"autocapture.keyring.bundle.v1";
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SALT_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct BundleKdf {
    #[serde(rename = "type")]
    kdf_type: String,
    n: u64,
    r: u32,
    p: u32,
    salt_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BundleFile {
    schema_version: u64,
    kdf: BundleKdf,
    cipher: EncryptedBlob,
}

fn passphrase_key(passphrase: &str, salt: &[u8], log_n: u8, r: u32, p: u32) -> Result<[u8; 32], CryptoError> {
    let params =
        Params::new(log_n, r, p, 32).map_err(|e| CryptoError::KdfFailed(e.to_string()))?;
    let mut key = [0u8; 32];
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut key)
        .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;
    Ok(key)
}

fn serialize_unprotected(keyring: &Keyring) -> Result<serde_json::Value, CryptoError> {
    let mut purposes = serde_json::Map::new();
    for purpose in keyring.purposes() {
        let mut keys = Vec::new();
        for record in keyring.records_for(purpose) {
            let raw = keyring.key_for(purpose, &record.key_id)?;
            keys.push(json!({
                "key_id": record.key_id,
                "created_ts": record.created_ts,
                "key_b64": STANDARD.encode(raw),
                "protected": false,
            }));
        }
        purposes.insert(
            purpose.to_string(),
            json!({
                "active_key_id": keyring.active_key_id(purpose),
                "keys": keys,
            }),
        );
    }
    Ok(json!({"schema_version": 2, "purposes": purposes}))
}

/// Export the keyring as a passphrase-encrypted portable bundle.
///
/// Key material is unwrapped from any OS protection, sealed with AES-GCM
/// under an scrypt-derived key, and written as a small JSON file.
pub fn export_keyring_bundle(
    keyring: &Keyring,
    path: impl AsRef<Path>,
    passphrase: &str,
) -> Result<(), CryptoError> {
    let payload = serialize_unprotected(keyring)?;
    let encoded = serde_json::to_vec(&payload)?;

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = passphrase_key(passphrase, &salt, SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P)?;
    let cipher = encrypt_bytes(&key, &encoded, Some(BUNDLE_AAD), None)?;

    let bundle = BundleFile {
        schema_version: 1,
        kdf: BundleKdf {
            kdf_type: "scrypt".to_string(),
            n: 1u64 << SCRYPT_LOG_N,
            r: SCRYPT_R,
            p: SCRYPT_P,
            salt_b64: STANDARD.encode(salt),
        },
        cipher,
    };
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&bundle)?)?;
    Ok(())
}

/// Import a portable bundle, re-protect on this machine, and persist at
/// `keyring_path`.
pub fn import_keyring_bundle(
    bundle_path: impl AsRef<Path>,
    passphrase: &str,
    keyring_path: impl AsRef<Path>,
    require_protection: bool,
    protector: Option<Arc<dyn Protector>>,
) -> Result<Keyring, CryptoError> {
    let bundle: BundleFile = serde_json::from_str(&fs::read_to_string(bundle_path)?)?;
    if bundle.kdf.kdf_type != "scrypt" {
        return Err(CryptoError::UnsupportedKdf(bundle.kdf.kdf_type));
    }
    if !bundle.kdf.n.is_power_of_two() {
        return Err(CryptoError::KdfFailed("scrypt n must be a power of two".into()));
    }
    let log_n = bundle.kdf.n.trailing_zeros() as u8;
    let salt = STANDARD
        .decode(&bundle.kdf.salt_b64)
        .map_err(|e| CryptoError::InvalidPayload(format!("salt_b64: {e}")))?;
    let key = passphrase_key(passphrase, &salt, log_n, bundle.kdf.r, bundle.kdf.p)?;
    let plaintext = decrypt_bytes(&key, &bundle.cipher, Some(BUNDLE_AAD))?;
    let payload: serde_json::Value = serde_json::from_slice(&plaintext)?;

    let ring = Keyring::load(
        keyring_path,
        LoadOptions {
            require_protection,
            protector,
        },
    )?;
    let purposes = deserialize_purposes(&payload, ring.protector(), require_protection)?;
    ring.replace_purposes(purposes)?;
    Ok(ring)
}

fn deserialize_purposes(
    payload: &serde_json::Value,
    protector: Option<&dyn Protector>,
    require_protection: bool,
) -> Result<BTreeMap<Purpose, (String, Vec<KeyRecord>)>, CryptoError> {
    let raw = payload
        .get("purposes")
        .and_then(|v| v.as_object())
        .ok_or_else(|| CryptoError::InvalidPayload("missing purposes".into()))?;
    let mut out = BTreeMap::new();
    for (name, data) in raw {
        let purpose: Purpose = name.parse()?;
        let active = data
            .get("active_key_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut records = Vec::new();
        let empty = Vec::new();
        for item in data.get("keys").and_then(|v| v.as_array()).unwrap_or(&empty) {
            let raw_key = STANDARD
                .decode(item.get("key_b64").and_then(|v| v.as_str()).unwrap_or_default())
                .map_err(|e| CryptoError::InvalidPayload(format!("key_b64: {e}")))?;
            let (material, protected) = match protector {
                Some(p) => (p.protect(&raw_key)?, true),
                None => (raw_key, false),
            };
            if require_protection && !protected {
                return Err(CryptoError::ProtectionUnavailable);
            }
            records.push(KeyRecord {
                key_id: item
                    .get("key_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CryptoError::InvalidPayload("missing key_id".into()))?
                    .to_string(),
                created_ts: item
                    .get("created_ts")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                key_b64: STANDARD.encode(material),
                protected,
            });
        }
        let active = if active.is_empty() {
            records.first().map(|r| r.key_id.clone()).unwrap_or_default()
        } else {
            active
        };
        out.insert(purpose, (active, records));
    }
    Ok(out)
}

/// Plain (same-machine) key export: unencrypted v2 JSON with stored material.
pub fn export_keys(keyring: &Keyring, path: impl AsRef<Path>) -> Result<(), CryptoError> {
    let mut purposes = serde_json::Map::new();
    for purpose in keyring.purposes() {
        purposes.insert(
            purpose.to_string(),
            json!({
                "active_key_id": keyring.active_key_id(purpose),
                "keys": keyring.records_for(purpose),
            }),
        );
    }
    let payload = json!({"schema_version": 2, "purposes": purposes});
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

/// Merge keys from a plain export into an existing ring. Existing records
/// are never dropped or replaced; only unknown key_ids are appended.
pub fn import_keys(keyring: &Keyring, path: impl AsRef<Path>) -> Result<(), CryptoError> {
    let payload: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    let raw = payload
        .get("purposes")
        .and_then(|v| v.as_object())
        .ok_or_else(|| CryptoError::InvalidPayload("missing purposes".into()))?;
    for (name, data) in raw {
        let purpose: Purpose = name.parse()?;
        let records: Vec<KeyRecord> =
            serde_json::from_value(data.get("keys").cloned().unwrap_or(json!([])))?;
        keyring.merge_records(purpose, records)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bundle_round_trip_preserves_purpose_map() {
        let dir = TempDir::new().unwrap();
        let src = Keyring::load(dir.path().join("src.json"), LoadOptions::default()).unwrap();
        src.rotate(Purpose::Metadata).unwrap();
        let bundle_path = dir.path().join("keyring.bundle.json");
        export_keyring_bundle(&src, &bundle_path, "hunter2").unwrap();

        let dst = import_keyring_bundle(
            &bundle_path,
            "hunter2",
            dir.path().join("dst.json"),
            false,
            None,
        )
        .unwrap();
        for purpose in dst.purposes() {
            assert_eq!(dst.active_key_id(purpose), src.active_key_id(purpose));
            let (id, key) = src.active(purpose).unwrap();
            assert_eq!(dst.key_for(purpose, &id).unwrap(), key);
        }
        assert_eq!(dst.records_for(Purpose::Metadata).len(), 2);
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let dir = TempDir::new().unwrap();
        let src = Keyring::load(dir.path().join("src.json"), LoadOptions::default()).unwrap();
        let bundle_path = dir.path().join("keyring.bundle.json");
        export_keyring_bundle(&src, &bundle_path, "correct").unwrap();
        let result = import_keyring_bundle(
            &bundle_path,
            "wrong",
            dir.path().join("dst.json"),
            false,
            None,
        );
        assert!(matches!(result, Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn plain_import_merges_without_dropping() {
        let dir = TempDir::new().unwrap();
        let a = Keyring::load(dir.path().join("a.json"), LoadOptions::default()).unwrap();
        let b = Keyring::load(dir.path().join("b.json"), LoadOptions::default()).unwrap();
        let export_path = dir.path().join("keys.json");
        export_keys(&a, &export_path).unwrap();

        let before = b.records_for(Purpose::Media).len();
        import_keys(&b, &export_path).unwrap();
        let after = b.records_for(Purpose::Media).len();
        assert_eq!(after, before + a.records_for(Purpose::Media).len());
        // b's own active key survives the merge.
        assert!(b.active(Purpose::Media).is_ok());
    }
}
