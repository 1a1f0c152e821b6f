//! Anchor log: periodic signed commitments to the ledger head.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use canonical::{now_ts_utc, sha256_text, to_canonical_bytes, to_canonical_string};
use hmac::{Hmac, Mac};
use keyring::{derive_key, Keyring, Purpose};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::warn;

use crate::error::LedgerError;

type HmacSha256 = Hmac<Sha256>;

/// HKDF info label for the anchor signing key.
const ANCHOR_KEY_INFO: &str = "anchor";

struct AnchorState {
    path: PathBuf,
    seq: u64,
    sign: bool,
}

/// Appends anchor records to `anchors.ndjson`. When a keyring is available
/// the canonical anchor payload (minus `anchor_hmac` and `anchor_key_id`) is
/// HMAC-signed under a key derived from the `anchor` purpose.
pub struct AnchorWriter {
    keyring: Option<Arc<Keyring>>,
    state: Mutex<AnchorState>,
}

impl AnchorWriter {
    pub fn open(
        path: impl AsRef<Path>,
        keyring: Option<Arc<Keyring>>,
        sign: bool,
    ) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let seq = if path.exists() {
            fs::read_to_string(&path)?
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count() as u64
        } else {
            0
        };
        Ok(Self {
            keyring,
            state: Mutex::new(AnchorState { path, seq, sign }),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.state.lock().expect("anchor lock").path.clone()
    }

    /// Append one anchor for the given ledger head. Returns the record.
    pub fn anchor(&self, ledger_head_hash: &str) -> Result<Value, LedgerError> {
        let mut state = self.state.lock().expect("anchor lock");
        let mut record = json!({
            "record_type": "system.anchor",
            "schema_version": 1,
            "anchor_seq": state.seq,
            "ts_utc": now_ts_utc(),
            "ledger_head_hash": ledger_head_hash,
        });
        if state.sign {
            match self.signing_key() {
                Some((key_id, key)) => {
                    let payload = to_canonical_bytes(&record)?;
                    let mut mac = HmacSha256::new_from_slice(&key)
                        .map_err(|_| LedgerError::InvalidEntry("hmac key".into()))?;
                    mac.update(&payload);
                    let signature = hex::encode(mac.finalize().into_bytes());
                    record["anchor_key_id"] = Value::String(key_id);
                    record["anchor_hmac"] = Value::String(signature);
                }
                None => {
                    // Availability wins over signing on hosts without the key.
                    state.sign = false;
                    warn!("anchor signing disabled: anchor key unavailable");
                }
            }
        }
        let line = to_canonical_string(&record)?;
        if let Err(err) = append_line(&state.path, &line) {
            if err.kind() != std::io::ErrorKind::PermissionDenied {
                return Err(err.into());
            }
            let fallback = shadow_anchor_path(&state.path);
            warn!(path = %state.path.display(), fallback = %fallback.display(),
                "anchor path unwritable, falling back to shadow path");
            fs::create_dir_all(fallback.parent().expect("shadow parent"))?;
            append_line(&fallback, &line)?;
            state.path = fallback;
        }
        state.seq += 1;
        Ok(record)
    }

    fn signing_key(&self) -> Option<(String, [u8; 32])> {
        let keyring = self.keyring.as_ref()?;
        let (key_id, root) = keyring.active(Purpose::Anchor).ok()?;
        let key = derive_key(&root, ANCHOR_KEY_INFO).ok()?;
        Some((key_id, key))
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

fn shadow_anchor_path(primary: &Path) -> PathBuf {
    let digest = sha256_text(&primary.display().to_string());
    std::env::temp_dir()
        .join("autocapture")
        .join("shadow_logs")
        .join(format!("{}.anchors.ndjson", &digest[..16]))
}

/// Decode one anchor line. Lines may be plain JSON or an OS-protected
/// `DPAPI:`-prefixed base64 payload; the latter decodes only when its inner
/// bytes are already JSON (portable hosts cannot unwrap foreign DPAPI).
pub fn decode_anchor_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(raw) = line.strip_prefix("DPAPI:") {
        let bytes = STANDARD.decode(raw.as_bytes()).ok()?;
        return serde_json::from_slice(&bytes).ok();
    }
    serde_json::from_str(line).ok()
}

/// All decodable anchor records, in file order.
pub fn read_anchors(path: &Path) -> Result<Vec<Value>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(fs::read_to_string(path)?
        .lines()
        .filter_map(decode_anchor_line)
        .collect())
}

#[derive(Debug, Clone)]
pub struct AnchorVerification {
    pub ok: bool,
    pub anchors: usize,
    pub errors: Vec<String>,
}

/// Verify anchor shape and, where signatures are present and the keyring is
/// available, the HMAC. Read-only.
pub fn verify_anchors(path: &Path, keyring: Option<&Keyring>) -> Result<AnchorVerification, LedgerError> {
    if !path.exists() {
        return Ok(AnchorVerification {
            ok: false,
            anchors: 0,
            errors: vec!["anchor_missing".to_string()],
        });
    }
    let mut errors = Vec::new();
    let mut count = 0;
    for line in fs::read_to_string(path)?.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(record) = decode_anchor_line(line) else {
            errors.push("anchor_decode_failed".to_string());
            continue;
        };
        count += 1;
        if record.get("anchor_seq").and_then(|v| v.as_u64()).is_none()
            || record.get("ledger_head_hash").and_then(|v| v.as_str()).is_none()
        {
            errors.push("anchor_missing_fields".to_string());
            continue;
        }
        if record.get("anchor_hmac").is_some() {
            if let Some(keyring) = keyring {
                if !verify_anchor_hmac(&record, keyring) {
                    let seq = record.get("anchor_seq").and_then(|v| v.as_u64()).unwrap_or(0);
                    errors.push(format!("anchor_hmac_mismatch:{seq}"));
                }
            }
        }
    }
    Ok(AnchorVerification {
        ok: errors.is_empty(),
        anchors: count,
        errors,
    })
}

/// Recompute an anchor's HMAC with its recorded `anchor_key_id`.
pub fn verify_anchor_hmac(record: &Value, keyring: &Keyring) -> bool {
    let Some(map) = record.as_object() else {
        return false;
    };
    let (Some(key_id), Some(signature)) = (
        map.get("anchor_key_id").and_then(|v| v.as_str()),
        map.get("anchor_hmac").and_then(|v| v.as_str()),
    ) else {
        return false;
    };
    let Ok(root) = keyring.key_for(Purpose::Anchor, key_id) else {
        return false;
    };
    let Ok(key) = derive_key(&root, ANCHOR_KEY_INFO) else {
        return false;
    };
    let mut payload = map.clone();
    payload.remove("anchor_hmac");
    payload.remove("anchor_key_id");
    let Ok(bytes) = to_canonical_bytes(&Value::Object(payload)) else {
        return false;
    };
    let Ok(sig) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
        return false;
    };
    mac.update(&bytes);
    mac.verify_slice(&sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyring::LoadOptions;
    use tempfile::TempDir;

    fn ring(dir: &TempDir) -> Arc<Keyring> {
        Arc::new(Keyring::load(dir.path().join("keyring.json"), LoadOptions::default()).unwrap())
    }

    #[test]
    fn anchors_are_sequenced_and_signed() {
        let dir = TempDir::new().unwrap();
        let ring = ring(&dir);
        let path = dir.path().join("anchors.ndjson");
        let writer = AnchorWriter::open(&path, Some(ring.clone()), true).unwrap();
        let a0 = writer.anchor("head0").unwrap();
        let a1 = writer.anchor("head1").unwrap();
        assert_eq!(a0["anchor_seq"], json!(0));
        assert_eq!(a1["anchor_seq"], json!(1));
        assert!(a0.get("anchor_hmac").is_some());
        assert!(verify_anchor_hmac(&a0, &ring));

        let report = verify_anchors(&path, Some(&ring)).unwrap();
        assert!(report.ok, "{:?}", report.errors);
        assert_eq!(report.anchors, 2);
    }

    #[test]
    fn tampered_anchor_fails_hmac() {
        let dir = TempDir::new().unwrap();
        let ring = ring(&dir);
        let path = dir.path().join("anchors.ndjson");
        let writer = AnchorWriter::open(&path, Some(ring.clone()), true).unwrap();
        writer.anchor("head0").unwrap();

        let text = fs::read_to_string(&path).unwrap().replace("head0", "headX");
        fs::write(&path, text).unwrap();
        let report = verify_anchors(&path, Some(&ring)).unwrap();
        assert!(!report.ok);
        assert!(report.errors.iter().any(|e| e.starts_with("anchor_hmac_mismatch")));
    }

    #[test]
    fn unsigned_anchors_verify_shape_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("anchors.ndjson");
        let writer = AnchorWriter::open(&path, None, true).unwrap();
        let record = writer.anchor("head0").unwrap();
        assert!(record.get("anchor_hmac").is_none());
        let report = verify_anchors(&path, None).unwrap();
        assert!(report.ok);
    }

    #[test]
    fn seq_continues_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("anchors.ndjson");
        {
            let writer = AnchorWriter::open(&path, None, false).unwrap();
            writer.anchor("h0").unwrap();
        }
        let writer = AnchorWriter::open(&path, None, false).unwrap();
        let record = writer.anchor("h1").unwrap();
        assert_eq!(record["anchor_seq"], json!(1));
    }
}
