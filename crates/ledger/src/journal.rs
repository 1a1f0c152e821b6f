//! NDJSON event journal.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use canonical::{now_ts_utc, prefixed_id, to_canonical_string};
use serde_json::{json, Value};

use crate::error::LedgerError;

const REQUIRED_FIELDS: [&str; 8] = [
    "schema_version",
    "event_id",
    "sequence",
    "ts_utc",
    "tzid",
    "offset_minutes",
    "event_type",
    "payload",
];

struct JournalState {
    sequence: u64,
}

/// Serialized journal appends; order on disk equals emission order.
pub struct JournalWriter {
    path: PathBuf,
    state: Mutex<JournalState>,
}

impl JournalWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let sequence = if path.exists() {
            fs::read_to_string(&path)?
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count() as u64
        } else {
            0
        };
        Ok(Self {
            path,
            state: Mutex::new(JournalState { sequence }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a fully-formed journal entry.
    pub fn append(&self, entry: &Value) -> Result<(), LedgerError> {
        let mut state = self.state.lock().expect("journal lock");
        self.append_locked(&mut state, entry)
    }

    /// Build and append an event. Returns the event id, which defaults to
    /// `{run_id}/{event_type}/{sequence}`.
    pub fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: &Value,
        event_id: Option<&str>,
        ts_utc: Option<&str>,
    ) -> Result<String, LedgerError> {
        let mut state = self.state.lock().expect("journal lock");
        let sequence = state.sequence;
        let event_id = event_id
            .map(str::to_string)
            .unwrap_or_else(|| prefixed_id(run_id, event_type, sequence));
        let ts = ts_utc.map(str::to_string).unwrap_or_else(now_ts_utc);
        let entry = json!({
            "schema_version": 1,
            "event_id": event_id,
            "sequence": sequence,
            "ts_utc": ts,
            "tzid": "UTC",
            "offset_minutes": 0,
            "event_type": event_type,
            "payload": payload,
        });
        self.append_locked(&mut state, &entry)?;
        Ok(event_id)
    }

    fn append_locked(&self, state: &mut JournalState, entry: &Value) -> Result<(), LedgerError> {
        let map = entry
            .as_object()
            .ok_or_else(|| LedgerError::InvalidEntry("journal entry must be an object".into()))?;
        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|f| !map.contains_key(**f))
            .map(|f| f.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(LedgerError::JournalMissingFields(missing));
        }
        let line = to_canonical_string(entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        state.sequence += 1;
        Ok(())
    }
}

/// All parsed journal entries, in file order. Unparseable lines are skipped.
pub fn read_journal(path: &Path) -> Result<Vec<Value>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for line in fs::read_to_string(path)?.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<Value>(line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}
