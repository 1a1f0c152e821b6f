//! Proof bundle verification: signature first, then per-file hashes.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use canonical::sha256_bytes_hex;
use hmac::{Hmac, Mac};
use keyring::{derive_key, Keyring, Purpose};
use serde_json::Value;
use sha2::Sha256;
use zip::ZipArchive;

use crate::error::ProofError;
use crate::MANIFEST_KEY_INFO;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleVerification {
    pub ok: bool,
    pub error: Option<String>,
    pub manifest_sha256: Option<String>,
    pub key_id: Option<String>,
}

impl BundleVerification {
    fn fail(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            manifest_sha256: None,
            key_id: None,
        }
    }
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>, ProofError> {
    let mut entry = archive.by_name(name)?;
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    Ok(data)
}

/// Verify a proof bundle: the HMAC signature over `manifest.json`, then the
/// SHA-256 and size of every listed bundle file.
pub fn verify_proof_bundle(
    bundle_path: &Path,
    keyring: Option<&Keyring>,
) -> Result<BundleVerification, ProofError> {
    if !bundle_path.exists() {
        return Ok(BundleVerification::fail("bundle_missing"));
    }
    let mut archive = ZipArchive::new(File::open(bundle_path)?)?;
    let manifest_bytes = match read_entry(&mut archive, "manifest.json") {
        Ok(bytes) => bytes,
        Err(_) => return Ok(BundleVerification::fail("manifest_missing")),
    };
    let sig_bytes = match read_entry(&mut archive, "manifest.sig.json") {
        Ok(bytes) => bytes,
        Err(_) => return Ok(BundleVerification::fail("signature_missing")),
    };
    let manifest: Value = match serde_json::from_slice(&manifest_bytes) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => return Ok(BundleVerification::fail("manifest_invalid_shape")),
        Err(_) => return Ok(BundleVerification::fail("manifest_invalid_json")),
    };
    let sig: Value = match serde_json::from_slice(&sig_bytes) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => return Ok(BundleVerification::fail("signature_invalid_shape")),
        Err(_) => return Ok(BundleVerification::fail("signature_invalid_json")),
    };
    if sig.get("algo").and_then(Value::as_str) != Some("hmac-sha256") {
        return Ok(BundleVerification::fail("signature_algo_unsupported"));
    }
    let manifest_sha = sha256_bytes_hex(&manifest_bytes);
    if sig.get("manifest_sha256").and_then(Value::as_str) != Some(manifest_sha.as_str()) {
        return Ok(BundleVerification::fail("manifest_sha256_mismatch"));
    }
    let Some(keyring) = keyring else {
        return Ok(BundleVerification::fail("keyring_missing"));
    };
    let key_id = sig
        .get("key_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let signature_hex = sig
        .get("signature_hex")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if key_id.is_empty() || signature_hex.is_empty() {
        return Ok(BundleVerification::fail("signature_missing_fields"));
    }
    let Ok(root) = keyring.key_for(Purpose::Anchor, &key_id) else {
        return Ok(BundleVerification::fail("signature_key_unavailable"));
    };
    let key = derive_key(&root, MANIFEST_KEY_INFO)?;
    let Ok(signature) = hex::decode(signature_hex) else {
        return Ok(BundleVerification::fail("signature_mismatch"));
    };
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|_| ProofError::BundleInvalid("hmac key".into()))?;
    mac.update(manifest_sha.as_bytes());
    if mac.verify_slice(&signature).is_err() {
        return Ok(BundleVerification::fail("signature_mismatch"));
    }

    let Some(bundle_files) = manifest.get("bundle_files").and_then(Value::as_array) else {
        return Ok(BundleVerification::fail("bundle_files_missing"));
    };
    for row in bundle_files {
        let Some(path) = row.get("path").and_then(Value::as_str).filter(|p| !p.is_empty()) else {
            continue;
        };
        let data = match read_entry(&mut archive, path) {
            Ok(data) => data,
            Err(_) => return Ok(BundleVerification::fail(format!("bundle_file_missing:{path}"))),
        };
        let expected_sha = row.get("sha256").and_then(Value::as_str).unwrap_or_default();
        if sha256_bytes_hex(&data) != expected_sha {
            return Ok(BundleVerification::fail(format!(
                "bundle_file_sha256_mismatch:{path}"
            )));
        }
        let expected_bytes = row.get("bytes").and_then(Value::as_u64).unwrap_or(0);
        if data.len() as u64 != expected_bytes {
            return Ok(BundleVerification::fail(format!(
                "bundle_file_size_mismatch:{path}"
            )));
        }
    }
    Ok(BundleVerification {
        ok: true,
        error: None,
        manifest_sha256: Some(manifest_sha),
        key_id: Some(key_id),
    })
}
