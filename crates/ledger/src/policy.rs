//! Content-addressed policy snapshots.
//!
//! A stable subset of the effective configuration (privacy + plugin
//! permissions) is extracted, hashed over its canonical JSON form, and
//! persisted both as a readable file and as an immutable metadata record.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use canonical::sha256_canonical;
use serde_json::{json, Value};
use storage::{RawStore, StoreError};
use tracing::debug;

use crate::error::LedgerError;

fn pick<'a>(obj: &'a Value, key: &str, default: Value) -> Value {
    obj.get(key).cloned().unwrap_or(default)
}

/// Extract the canonical policy snapshot payload from an effective config.
pub fn policy_snapshot_payload(config: &Value) -> Value {
    let plugins = config.get("plugins").cloned().unwrap_or_else(|| json!({}));
    let privacy = config.get("privacy").cloned().unwrap_or_else(|| json!({}));
    json!({
        "schema_version": 1,
        "privacy": if privacy.is_object() { privacy } else { json!({}) },
        "plugins": {
            "permissions": pick(&plugins, "permissions", json!({})),
            "filesystem_defaults": pick(&plugins, "filesystem_defaults", json!({})),
            "filesystem_policies": pick(&plugins, "filesystem_policies", json!({})),
            "allowlist": pick(&plugins, "allowlist", json!([])),
            "enabled": pick(&plugins, "enabled", json!({})),
            "locks": pick(&plugins, "locks", json!({})),
        },
    })
}

/// SHA-256 of the canonical JSON of a snapshot payload.
pub fn policy_snapshot_hash(payload: &Value) -> Result<String, LedgerError> {
    Ok(sha256_canonical(payload)?)
}

/// Content-addressed record id, stable across runs.
pub fn policy_snapshot_record_id(snapshot_hash: &str) -> String {
    format!("policy_snapshot/{snapshot_hash}")
}

#[derive(Debug, Clone)]
pub struct PolicySnapshotPersistResult {
    pub snapshot_hash: String,
    pub record_id: String,
    pub path: PathBuf,
    pub existed: bool,
}

/// Persist the snapshot to `{data_dir}/policy_snapshots/{hash}.json` and to
/// the metadata store. Existing files are immutable and left untouched.
pub fn persist_policy_snapshot(
    config: &Value,
    data_dir: &Path,
    metadata: Option<&dyn RawStore>,
    ts_utc: Option<&str>,
) -> Result<PolicySnapshotPersistResult, LedgerError> {
    let payload = policy_snapshot_payload(config);
    let snapshot_hash = policy_snapshot_hash(&payload)?;
    let record_id = policy_snapshot_record_id(&snapshot_hash);
    let out_dir = data_dir.join("policy_snapshots");
    let out_path = out_dir.join(format!("{snapshot_hash}.json"));
    let existed = out_path.exists();
    if !existed {
        fs::create_dir_all(&out_dir)?;
        let tmp = out_path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(serde_json::to_string_pretty(&payload)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &out_path)?;
    }

    if let Some(metadata) = metadata {
        let ts = ts_utc.map(str::to_string).unwrap_or_else(canonical::now_ts_utc);
        let record = json!({
            "record_type": "system.policy_snapshot",
            "schema_version": 1,
            "ts_utc": ts,
            "policy_snapshot_hash": snapshot_hash,
            "payload": payload,
        });
        match metadata.put_new(&record_id, &record) {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                debug!(record_id, "policy snapshot record already present");
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(PolicySnapshotPersistResult {
        snapshot_hash,
        record_id,
        path: out_path,
        existed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStore;
    use tempfile::TempDir;

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = json!({"privacy": {"allow": true}, "plugins": {"allowlist": ["x"]}});
        let b = json!({"plugins": {"allowlist": ["x"]}, "privacy": {"allow": true}});
        let ha = policy_snapshot_hash(&policy_snapshot_payload(&a)).unwrap();
        let hb = policy_snapshot_hash(&policy_snapshot_payload(&b)).unwrap();
        assert_eq!(ha, hb);
    }

    #[test]
    fn persist_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let config = json!({"privacy": {"redact": true}});
        let first =
            persist_policy_snapshot(&config, dir.path(), Some(&store), Some("2026-01-02T00:00:00Z"))
                .unwrap();
        assert!(!first.existed);
        assert!(first.path.exists());
        let second =
            persist_policy_snapshot(&config, dir.path(), Some(&store), Some("2026-01-03T00:00:00Z"))
                .unwrap();
        assert!(second.existed);
        assert_eq!(first.snapshot_hash, second.snapshot_hash);
        assert_eq!(
            first.record_id,
            policy_snapshot_record_id(&first.snapshot_hash)
        );
        let stored = store.get(&first.record_id).unwrap().unwrap();
        // The first write wins; the record keeps its original timestamp.
        assert_eq!(stored["ts_utc"], json!("2026-01-02T00:00:00Z"));
    }

    #[test]
    fn different_policy_different_hash() {
        let a = policy_snapshot_payload(&json!({"privacy": {"x": 1}}));
        let b = policy_snapshot_payload(&json!({"privacy": {"x": 2}}));
        assert_ne!(
            policy_snapshot_hash(&a).unwrap(),
            policy_snapshot_hash(&b).unwrap()
        );
    }
}
