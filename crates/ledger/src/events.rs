//! The process-wide event builder.

use std::sync::{Arc, Mutex};

use canonical::{now_ts_utc, parse_ts_utc, prefixed_id};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::anchor::AnchorWriter;
use crate::error::LedgerError;
use crate::journal::JournalWriter;
use crate::ledger_file::LedgerWriter;

/// Anchor cadence. Either trigger fires an anchor; the first ledger entry
/// always anchors.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnchorSchedule {
    pub every_entries: u64,
    pub every_minutes: u64,
}

struct BuilderState {
    ledger_seq: u64,
    anchor_entry_count: u64,
    last_anchor_ts: Option<DateTime<Utc>>,
    last_anchor: Option<Value>,
}

/// Funnels journal events and ledger entries, stamping each entry with the
/// cached policy snapshot hash and evaluating the anchor schedule after
/// every ledger append.
pub struct EventBuilder {
    run_id: String,
    policy_snapshot_hash: String,
    journal: Arc<JournalWriter>,
    ledger: Arc<LedgerWriter>,
    anchor: Option<Arc<AnchorWriter>>,
    schedule: AnchorSchedule,
    state: Mutex<BuilderState>,
}

impl EventBuilder {
    pub fn new(
        run_id: impl Into<String>,
        policy_snapshot_hash: impl Into<String>,
        journal: Arc<JournalWriter>,
        ledger: Arc<LedgerWriter>,
        anchor: Option<Arc<AnchorWriter>>,
        schedule: AnchorSchedule,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            policy_snapshot_hash: policy_snapshot_hash.into(),
            journal,
            ledger,
            anchor,
            schedule,
            state: Mutex::new(BuilderState {
                ledger_seq: 0,
                anchor_entry_count: 0,
                last_anchor_ts: None,
                last_anchor: None,
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn policy_snapshot_hash(&self) -> &str {
        &self.policy_snapshot_hash
    }

    pub fn ledger_head(&self) -> Option<String> {
        self.ledger.head_hash()
    }

    pub fn last_anchor(&self) -> Option<Value> {
        self.state.lock().expect("events lock").last_anchor.clone()
    }

    pub fn journal_event(
        &self,
        event_type: &str,
        payload: &Value,
        event_id: Option<&str>,
        ts_utc: Option<&str>,
    ) -> Result<String, LedgerError> {
        self.journal
            .append_event(&self.run_id, event_type, payload, event_id, ts_utc)
    }

    /// Append a ledger entry and evaluate the anchor schedule. Returns the
    /// entry hash.
    pub fn ledger_entry(
        &self,
        stage: &str,
        inputs: &[String],
        outputs: &[String],
        payload: Option<&Value>,
        entry_id: Option<&str>,
        ts_utc: Option<&str>,
    ) -> Result<String, LedgerError> {
        let seq = {
            let mut state = self.state.lock().expect("events lock");
            let seq = state.ledger_seq;
            state.ledger_seq += 1;
            seq
        };
        let ts = ts_utc.map(str::to_string).unwrap_or_else(now_ts_utc);
        let entry_id = entry_id
            .map(str::to_string)
            .unwrap_or_else(|| prefixed_id(&self.run_id, &format!("ledger.{stage}"), seq));

        let mut entry = Map::new();
        entry.insert("record_type".into(), json!("ledger.entry"));
        entry.insert("schema_version".into(), json!(1));
        entry.insert("entry_id".into(), json!(entry_id));
        entry.insert("ts_utc".into(), json!(ts));
        entry.insert("stage".into(), json!(stage));
        entry.insert("inputs".into(), json!(inputs));
        entry.insert("outputs".into(), json!(outputs));
        entry.insert(
            "policy_snapshot_hash".into(),
            json!(self.policy_snapshot_hash),
        );
        if let Some(payload) = payload {
            entry.insert("payload".into(), payload.clone());
        }
        let ledger_hash = self.ledger.append(&Value::Object(entry))?;
        self.maybe_anchor(&ledger_hash, &ts)?;
        Ok(ledger_hash)
    }

    /// Record a failure in both journal and ledger.
    pub fn failure_event(
        &self,
        event_type: &str,
        stage: &str,
        error: &str,
        error_class: &str,
        inputs: &[String],
        outputs: &[String],
        payload: Option<&Value>,
        retryable: bool,
    ) -> Result<String, LedgerError> {
        let ts = now_ts_utc();
        let mut failure = json!({
            "event": event_type,
            "stage": stage,
            "error": error,
            "error_class": error_class,
            "retryable": retryable,
        });
        if let Some(Value::Object(extra)) = payload {
            let map = failure.as_object_mut().expect("failure payload object");
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
        let event_id = self.journal_event(event_type, &failure, None, Some(&ts))?;
        self.ledger_entry(event_type, inputs, outputs, Some(&failure), None, Some(&ts))?;
        Ok(event_id)
    }

    fn maybe_anchor(&self, ledger_hash: &str, ts_utc: &str) -> Result<(), LedgerError> {
        let Some(anchor) = &self.anchor else {
            return Ok(());
        };
        let now = parse_ts_utc(ts_utc).unwrap_or_else(Utc::now);
        let mut state = self.state.lock().expect("events lock");
        state.anchor_entry_count += 1;

        let mut due = state.last_anchor.is_none();
        if self.schedule.every_entries > 0 && state.anchor_entry_count >= self.schedule.every_entries
        {
            due = true;
        }
        if self.schedule.every_minutes > 0 {
            match state.last_anchor_ts {
                None => due = true,
                Some(last) => {
                    let elapsed = now.signed_duration_since(last);
                    if elapsed.num_seconds() >= (self.schedule.every_minutes as i64) * 60 {
                        due = true;
                    }
                }
            }
        }
        if due {
            debug!(ledger_hash, "anchoring ledger head");
            let record = anchor.anchor(ledger_hash)?;
            state.last_anchor = Some(record);
            state.last_anchor_ts = Some(now);
            state.anchor_entry_count = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::read_anchors;
    use crate::ledger_file::verify_ledger;
    use tempfile::TempDir;

    fn builder(dir: &TempDir, schedule: AnchorSchedule) -> (EventBuilder, std::path::PathBuf) {
        let journal = Arc::new(JournalWriter::open(dir.path().join("journal.ndjson")).unwrap());
        let ledger = Arc::new(LedgerWriter::open(dir.path().join("ledger.ndjson")).unwrap());
        let anchor_path = dir.path().join("anchors.ndjson");
        let anchor = Arc::new(AnchorWriter::open(&anchor_path, None, false).unwrap());
        (
            EventBuilder::new("run1", "policyhash", journal, ledger, Some(anchor), schedule),
            anchor_path,
        )
    }

    #[test]
    fn every_entry_anchoring_matches_count() {
        let dir = TempDir::new().unwrap();
        let (builder, anchor_path) = builder(
            &dir,
            AnchorSchedule {
                every_entries: 1,
                every_minutes: 0,
            },
        );
        let mut last = String::new();
        for i in 0..5 {
            last = builder
                .ledger_entry("test.stage", &[], &[], None, Some(&format!("e{i}")), None)
                .unwrap();
        }
        let anchors = read_anchors(&anchor_path).unwrap();
        assert_eq!(anchors.len(), 5);
        assert_eq!(
            anchors[4]["ledger_head_hash"].as_str().unwrap(),
            last.as_str()
        );
        assert!(verify_ledger(&dir.path().join("ledger.ndjson")).unwrap().ok);
    }

    #[test]
    fn every_k_entries_anchoring() {
        let dir = TempDir::new().unwrap();
        let (builder, anchor_path) = builder(
            &dir,
            AnchorSchedule {
                every_entries: 3,
                every_minutes: 0,
            },
        );
        for _ in 0..7 {
            builder
                .ledger_entry("test.stage", &[], &[], None, None, None)
                .unwrap();
        }
        // First entry anchors, then entries 4 and 7 (every third after reset).
        let anchors = read_anchors(&anchor_path).unwrap();
        assert_eq!(anchors.len(), 3);
    }

    #[test]
    fn minute_schedule_uses_entry_timestamps() {
        let dir = TempDir::new().unwrap();
        let (builder, anchor_path) = builder(
            &dir,
            AnchorSchedule {
                every_entries: 0,
                every_minutes: 10,
            },
        );
        builder
            .ledger_entry("s", &[], &[], None, None, Some("2026-01-02T00:00:00Z"))
            .unwrap();
        builder
            .ledger_entry("s", &[], &[], None, None, Some("2026-01-02T00:05:00Z"))
            .unwrap();
        builder
            .ledger_entry("s", &[], &[], None, None, Some("2026-01-02T00:11:00Z"))
            .unwrap();
        let anchors = read_anchors(&anchor_path).unwrap();
        assert_eq!(anchors.len(), 2);
    }

    #[test]
    fn failure_event_lands_in_both_files() {
        let dir = TempDir::new().unwrap();
        let (builder, _) = builder(&dir, AnchorSchedule::default());
        builder
            .failure_event(
                "evidence.write.recovery_failed",
                "recover.blob_missing",
                "blob_missing",
                "IntegrityError",
                &[],
                &["run1/x".to_string()],
                None,
                false,
            )
            .unwrap();
        let journal = crate::journal::read_journal(&dir.path().join("journal.ndjson")).unwrap();
        let ledger = crate::ledger_file::read_ledger(&dir.path().join("ledger.ndjson")).unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(ledger.len(), 1);
        assert_eq!(journal[0]["payload"]["error"], json!("blob_missing"));
        assert_eq!(ledger[0]["stage"], json!("evidence.write.recovery_failed"));
    }
}
