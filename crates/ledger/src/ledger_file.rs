//! Hash-chained ledger file.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use canonical::{sha256_text, to_canonical_string};
use serde_json::Value;
use tracing::warn;

use crate::error::LedgerError;

const REQUIRED_FIELDS: [&str; 8] = [
    "record_type",
    "schema_version",
    "entry_id",
    "ts_utc",
    "stage",
    "inputs",
    "outputs",
    "policy_snapshot_hash",
];

struct WriterState {
    path: PathBuf,
    last_hash: Option<String>,
}

/// Single-writer append-only ledger. The head is tracked in memory and
/// reconstructed from the file tail at open.
pub struct LedgerWriter {
    state: Mutex<WriterState>,
}

impl LedgerWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let mut path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                if is_permission_error(&err) {
                    path = shadow_path(&path, "ledger.ndjson");
                    fs::create_dir_all(path.parent().expect("shadow parent"))?;
                } else {
                    return Err(err.into());
                }
            }
        }
        let last_hash = match reconstruct_head(&path) {
            Ok(head) => head,
            Err(LedgerError::Io(err)) if is_permission_error(&err) => {
                path = shadow_path(&path, "ledger.ndjson");
                fs::create_dir_all(path.parent().expect("shadow parent"))?;
                reconstruct_head(&path)?
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            state: Mutex::new(WriterState { path, last_hash }),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.state.lock().expect("ledger lock").path.clone()
    }

    pub fn head_hash(&self) -> Option<String> {
        self.state.lock().expect("ledger lock").last_hash.clone()
    }

    /// Append one entry: set `prev_hash`, compute `entry_hash`, write one
    /// canonical-JSON line, fsync, update the head. Returns the entry hash.
    pub fn append(&self, entry: &Value) -> Result<String, LedgerError> {
        let map = entry
            .as_object()
            .ok_or_else(|| LedgerError::InvalidEntry("entry must be an object".into()))?;
        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|f| !map.contains_key(**f))
            .map(|f| f.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(LedgerError::MissingFields(missing));
        }

        let mut state = self.state.lock().expect("ledger lock");
        let prev_hash = state.last_hash.clone();
        let mut payload = map.clone();
        payload.remove("entry_hash");
        payload.insert(
            "prev_hash".to_string(),
            prev_hash.clone().map(Value::String).unwrap_or(Value::Null),
        );
        let canonical_payload = to_canonical_string(&Value::Object(payload.clone()))?;
        let tail = prev_hash.as_deref().unwrap_or("");
        let entry_hash = sha256_text(&format!("{canonical_payload}{tail}"));
        payload.insert("entry_hash".to_string(), Value::String(entry_hash.clone()));
        let line = to_canonical_string(&Value::Object(payload))?;

        if let Err(err) = append_line(&state.path, &line) {
            if !is_permission_error(&err) {
                return Err(err.into());
            }
            let fallback = shadow_path(&state.path, "ledger.ndjson");
            warn!(path = %state.path.display(), fallback = %fallback.display(),
                "ledger path unwritable, falling back to shadow path");
            fs::create_dir_all(fallback.parent().expect("shadow parent"))?;
            append_line(&fallback, &line)?;
            state.path = fallback;
        }
        state.last_hash = Some(entry_hash.clone());
        Ok(entry_hash)
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

fn reconstruct_head(path: &Path) -> Result<Option<String>, LedgerError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut last = None;
    for line in fs::read_to_string(path)?.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) {
            if let Some(Value::String(hash)) = map.get("entry_hash") {
                last = Some(hash.clone());
            }
        }
    }
    Ok(last)
}

fn is_permission_error(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem)
}

/// Deterministic fallback under the temp dir for un-writable primaries.
fn shadow_path(primary: &Path, suffix: &str) -> PathBuf {
    let digest = sha256_text(&primary.display().to_string());
    std::env::temp_dir()
        .join("autocapture")
        .join("shadow_logs")
        .join(format!("{}.{suffix}", &digest[..16]))
}

/// All parsed entries of a ledger file, in file order.
pub fn read_ledger(path: &Path) -> Result<Vec<Value>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for line in fs::read_to_string(path)?.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(entry) => entries.push(entry),
            Err(_) => entries.push(Value::Null),
        }
    }
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct LedgerVerification {
    pub ok: bool,
    pub entries: usize,
    pub head: Option<String>,
    pub entry_hashes: Vec<String>,
    pub errors: Vec<String>,
}

/// Recompute every entry hash and check chain continuity. Read-only.
pub fn verify_ledger(path: &Path) -> Result<LedgerVerification, LedgerError> {
    if !path.exists() {
        return Ok(LedgerVerification {
            ok: false,
            entries: 0,
            head: None,
            entry_hashes: Vec::new(),
            errors: vec!["ledger_missing".to_string()],
        });
    }
    let entries = read_ledger(path)?;
    Ok(verify_entries(&entries))
}

/// Chain verification over already-parsed entries (used by bundle replay).
pub fn verify_entries(entries: &[Value]) -> LedgerVerification {
    let mut errors = Vec::new();
    let mut entry_hashes = Vec::new();
    let mut prev = String::new();
    for (index, entry) in entries.iter().enumerate() {
        let Some(map) = entry.as_object() else {
            errors.push(format!("ledger_line_invalid:{index}"));
            continue;
        };
        let entry_hash = map
            .get("entry_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut payload = map.clone();
        payload.remove("entry_hash");
        let prev_hash = payload
            .get("prev_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        match to_canonical_string(&Value::Object(payload)) {
            Ok(canonical_payload) => {
                let expected = sha256_text(&format!("{canonical_payload}{prev_hash}"));
                if entry_hash != expected {
                    errors.push(format!("ledger_hash_mismatch:{index}"));
                }
            }
            Err(_) => errors.push(format!("ledger_line_invalid:{index}")),
        }
        if !prev.is_empty() && prev_hash != prev {
            errors.push(format!("ledger_chain_gap:{index}"));
        }
        if !entry_hash.is_empty() {
            prev = entry_hash.clone();
            entry_hashes.push(entry_hash);
        }
    }
    LedgerVerification {
        ok: errors.is_empty(),
        entries: entries.len(),
        head: entry_hashes.last().cloned(),
        entry_hashes,
        errors,
    }
}

/// Whether citation validation must require head equality rather than
/// accepting any known entry hash.
pub fn strict_ledger_required() -> bool {
    std::env::var(crate::STRICT_LEDGER_ENV)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            !v.is_empty() && v != "0" && v != "false" && v != "no"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(id: &str) -> Value {
        json!({
            "record_type": "ledger.entry",
            "schema_version": 1,
            "entry_id": id,
            "ts_utc": "2026-01-02T00:00:00Z",
            "stage": "test.stage",
            "inputs": [],
            "outputs": [],
            "policy_snapshot_hash": "deadbeef",
        })
    }

    #[test]
    fn chain_verifies_and_head_matches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.ndjson");
        let writer = LedgerWriter::open(&path).unwrap();
        let mut last = String::new();
        for i in 0..5 {
            last = writer.append(&entry(&format!("e{i}"))).unwrap();
        }
        let report = verify_ledger(&path).unwrap();
        assert!(report.ok, "{:?}", report.errors);
        assert_eq!(report.entries, 5);
        assert_eq!(report.head.as_deref(), Some(last.as_str()));
    }

    #[test]
    fn first_entry_has_null_prev_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.ndjson");
        let writer = LedgerWriter::open(&path).unwrap();
        writer.append(&entry("e0")).unwrap();
        let entries = read_ledger(&path).unwrap();
        assert!(entries[0].get("prev_hash").unwrap().is_null());
    }

    #[test]
    fn head_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.ndjson");
        let head = {
            let writer = LedgerWriter::open(&path).unwrap();
            writer.append(&entry("e0")).unwrap();
            writer.append(&entry("e1")).unwrap()
        };
        let writer = LedgerWriter::open(&path).unwrap();
        assert_eq!(writer.head_hash().as_deref(), Some(head.as_str()));
        writer.append(&entry("e2")).unwrap();
        assert!(verify_ledger(&path).unwrap().ok);
    }

    #[test]
    fn mutation_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.ndjson");
        let writer = LedgerWriter::open(&path).unwrap();
        for i in 0..3 {
            writer.append(&entry(&format!("e{i}"))).unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        let mutated = text.replacen("e1", "eX", 1);
        assert_ne!(text, mutated);
        fs::write(&path, mutated).unwrap();
        let report = verify_ledger(&path).unwrap();
        assert!(!report.ok);
        assert!(report.errors.iter().any(|e| e.starts_with("ledger_hash_mismatch:1")));
    }

    #[test]
    fn missing_fields_rejected() {
        let dir = TempDir::new().unwrap();
        let writer = LedgerWriter::open(dir.path().join("ledger.ndjson")).unwrap();
        let bad = json!({"record_type": "ledger.entry", "entry_id": "x"});
        assert!(matches!(
            writer.append(&bad),
            Err(LedgerError::MissingFields(_))
        ));
    }

    #[test]
    fn float_payload_rejected() {
        let dir = TempDir::new().unwrap();
        let writer = LedgerWriter::open(dir.path().join("ledger.ndjson")).unwrap();
        let mut bad = entry("e0");
        bad["payload"] = json!({"score": 0.5});
        assert!(matches!(writer.append(&bad), Err(LedgerError::Canonical(_))));
    }
}
