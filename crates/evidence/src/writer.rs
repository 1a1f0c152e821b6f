//! Staged evidence writes with rollback markers and deterministic recovery.
//!
//! Stage order is raw-first: `blob -> metadata -> journal(begin) ->
//! ledger(commit)`. Nothing is ever deleted on failure; a rollback marker is
//! recorded and a later recovery scan completes the missing stages.

use std::collections::BTreeMap;
use std::path::Path;

use canonical::{sha256_bytes_hex, sha256_canonical};
use ledger::{read_journal, read_ledger, EventBuilder};
use serde_json::{json, Value};
use storage::BlobStore;
use tracing::{info, warn};

use crate::error::EvidenceError;
use crate::store::ImmutableMetadataStore;

#[derive(Debug, Clone)]
pub struct EvidenceWriteReport {
    pub ok: bool,
    pub evidence_id: String,
    pub stages_completed: Vec<String>,
    pub tx_id: Option<String>,
    pub error: Option<String>,
    pub rollback_recorded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub ok: bool,
    pub candidates: usize,
    pub recovered: usize,
    pub skipped: usize,
}

/// Deterministic transaction id shared by the begin and commit markers.
fn tx_id_for(evidence_id: &str, record: &Value, blob_sha256: &str) -> Result<String, EvidenceError> {
    Ok(sha256_canonical(&json!({
        "evidence_id": evidence_id,
        "blob_sha256": blob_sha256,
        "record": record,
    }))?)
}

/// Write one evidence record through all four stages.
///
/// `fault_after_stage` is a test-only fault-injection hook naming the stage
/// after which a simulated fault fires; pass `None` in production.
pub fn write_evidence_staged(
    evidence_id: &str,
    blob: &[u8],
    record: &Value,
    media: &BlobStore,
    metadata: &ImmutableMetadataStore,
    events: Option<&EventBuilder>,
    fault_after_stage: Option<&str>,
) -> EvidenceWriteReport {
    let blob_sha = sha256_bytes_hex(blob);
    let tx_id = match tx_id_for(evidence_id, record, &blob_sha) {
        Ok(tx_id) => tx_id,
        Err(err) => {
            return EvidenceWriteReport {
                ok: false,
                evidence_id: evidence_id.to_string(),
                stages_completed: Vec::new(),
                tx_id: None,
                error: Some(err.to_string()),
                rollback_recorded: false,
            }
        }
    };

    let mut stages: Vec<String> = Vec::new();
    let result = run_stages(
        evidence_id,
        blob,
        record,
        &blob_sha,
        &tx_id,
        media,
        metadata,
        events,
        fault_after_stage,
        &mut stages,
    );
    match result {
        Ok(()) => EvidenceWriteReport {
            ok: true,
            evidence_id: evidence_id.to_string(),
            stages_completed: stages,
            tx_id: Some(tx_id),
            error: None,
            rollback_recorded: false,
        },
        Err(err) => {
            let stage = stages.last().cloned().unwrap_or_else(|| "start".to_string());
            let rollback_recorded =
                record_rollback(evidence_id, &stage, &err.to_string(), &stages, events);
            EvidenceWriteReport {
                ok: false,
                evidence_id: evidence_id.to_string(),
                stages_completed: stages,
                tx_id: Some(tx_id),
                error: Some(err.to_string()),
                rollback_recorded,
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_stages(
    evidence_id: &str,
    blob: &[u8],
    record: &Value,
    blob_sha: &str,
    tx_id: &str,
    media: &BlobStore,
    metadata: &ImmutableMetadataStore,
    events: Option<&EventBuilder>,
    fault_after_stage: Option<&str>,
    stages: &mut Vec<String>,
) -> Result<(), EvidenceError> {
    let fault = |stage: &str| -> Result<(), EvidenceError> {
        if fault_after_stage == Some(stage) {
            return Err(EvidenceError::validation(
                evidence_id,
                format!("fault_injected_after_{stage}"),
            ));
        }
        Ok(())
    };

    media.put_new(evidence_id, blob)?;
    stages.push("blob".to_string());
    fault("blob")?;

    metadata.put_new(evidence_id, record)?;
    stages.push("metadata".to_string());
    fault("metadata")?;

    if let Some(events) = events {
        events.journal_event(
            "evidence.write.begin",
            &json!({
                "schema_version": 1,
                "event": "evidence.write.begin",
                "tx_id": tx_id,
                "evidence_id": evidence_id,
                "blob_sha256": blob_sha,
                "record": record,
                "stages_completed": stages.clone(),
            }),
            Some(tx_id),
            None,
        )?;
    }
    stages.push("journal".to_string());
    fault("journal")?;

    if let Some(events) = events {
        events.ledger_entry(
            "evidence.write.commit",
            &[],
            &[evidence_id.to_string()],
            Some(&json!({
                "schema_version": 1,
                "event": "evidence.write.commit",
                "tx_id": tx_id,
                "evidence_id": evidence_id,
                "blob_sha256": blob_sha,
            })),
            Some(tx_id),
            None,
        )?;
    }
    stages.push("ledger".to_string());
    Ok(())
}

fn record_rollback(
    evidence_id: &str,
    stage: &str,
    reason: &str,
    stages: &[String],
    events: Option<&EventBuilder>,
) -> bool {
    let Some(events) = events else {
        return false;
    };
    let payload = json!({
        "schema_version": 1,
        "event": "evidence.write.rollback",
        "evidence_id": evidence_id,
        "stage": stage,
        "reason": reason,
        "stages_completed": stages,
    });
    let mut recorded = false;
    if let Err(err) =
        events.journal_event("evidence.write.rollback", &payload, Some(evidence_id), None)
    {
        warn!(evidence_id, %err, "rollback journal marker failed");
    } else {
        recorded = true;
    }
    if let Err(err) = events.ledger_entry(
        "evidence.write.rollback",
        &[],
        &[evidence_id.to_string()],
        Some(&payload),
        Some(evidence_id),
        None,
    ) {
        warn!(evidence_id, %err, "rollback ledger marker failed");
    } else {
        recorded = true;
    }
    recorded
}

/// Scan the journal for begin markers without a matching ledger commit and
/// complete them deterministically. Idempotent: once the commit marker
/// exists, the pass is a no-op for that transaction.
pub fn recover_incomplete_evidence_writes(
    data_dir: &Path,
    metadata: &ImmutableMetadataStore,
    media: &BlobStore,
    events: &EventBuilder,
) -> Result<RecoveryReport, EvidenceError> {
    let journal_path = data_dir.join("journal.ndjson");
    let ledger_path = data_dir.join("ledger.ndjson");
    if !journal_path.exists() {
        return Ok(RecoveryReport {
            ok: true,
            candidates: 0,
            recovered: 0,
            skipped: 0,
        });
    }

    let mut begins: BTreeMap<String, Value> = BTreeMap::new();
    for row in read_journal(&journal_path)? {
        if row.get("event_type").and_then(|v| v.as_str()) != Some("evidence.write.begin") {
            continue;
        }
        let Some(payload) = row.get("payload").filter(|p| p.is_object()) else {
            continue;
        };
        let Some(tx_id) = payload.get("tx_id").and_then(|v| v.as_str()) else {
            continue;
        };
        begins.insert(tx_id.to_string(), payload.clone());
    }

    let mut committed = std::collections::BTreeSet::new();
    for entry in read_ledger(&ledger_path)? {
        if let Some(entry_id) = entry.get("entry_id").and_then(|v| v.as_str()) {
            committed.insert(entry_id.to_string());
        }
    }

    let candidates = begins.len();
    let mut recovered = 0;
    let mut skipped = 0;
    for (tx_id, payload) in begins {
        if committed.contains(&tx_id) {
            skipped += 1;
            continue;
        }
        let evidence_id = payload
            .get("evidence_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let record = payload.get("record").filter(|r| r.is_object());
        let blob_sha = payload
            .get("blob_sha256")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let (Some(record), false) = (record, evidence_id.is_empty()) else {
            skipped += 1;
            continue;
        };

        // Raw-first: a missing blob is non-recoverable, never invented.
        if !media.has(&evidence_id) {
            events.failure_event(
                "evidence.write.recovery_failed",
                "recover.blob_missing",
                "blob_missing",
                "IntegrityError",
                &[],
                &[evidence_id.clone()],
                Some(&json!({"tx_id": tx_id, "blob_sha256": blob_sha})),
                false,
            )?;
            skipped += 1;
            continue;
        }

        if metadata.get(&evidence_id)?.is_none() {
            if let Err(err) = metadata.put_new(&evidence_id, record) {
                warn!(evidence_id, %err, "recovery could not re-insert metadata");
                skipped += 1;
                continue;
            }
        }

        events.ledger_entry(
            "evidence.write.commit",
            &[],
            &[evidence_id.clone()],
            Some(&json!({
                "schema_version": 1,
                "event": "evidence.write.commit",
                "tx_id": tx_id,
                "evidence_id": evidence_id,
                "blob_sha256": blob_sha,
                "recovered": true,
            })),
            Some(&tx_id),
            None,
        )?;
        events.journal_event(
            "evidence.write.recovered",
            &json!({
                "schema_version": 1,
                "event": "evidence.write.recovered",
                "tx_id": tx_id,
                "evidence_id": evidence_id,
            }),
            Some(&tx_id),
            None,
        )?;
        info!(evidence_id, tx_id, "recovered incomplete evidence write");
        recovered += 1;
    }

    Ok(RecoveryReport {
        ok: true,
        candidates,
        recovered,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyring::{Keyring, LoadOptions, Purpose};
    use ledger::{
        read_anchors, verify_ledger, AnchorSchedule, AnchorWriter, JournalWriter, LedgerWriter,
    };
    use std::sync::Arc;
    use storage::{DerivedKeyProvider, EncryptedJsonStore, FsyncPolicy, MemoryStore};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        media: BlobStore,
        metadata: ImmutableMetadataStore,
        events: EventBuilder,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let ring = Arc::new(
            Keyring::load(dir.path().join("vault/keyring.json"), LoadOptions::default()).unwrap(),
        );
        let media = BlobStore::new(
            dir.path().join("media"),
            DerivedKeyProvider::new(ring.clone(), Purpose::Media),
            true,
            FsyncPolicy::Bulk,
        )
        .unwrap();
        let metadata = ImmutableMetadataStore::new(Arc::new(
            EncryptedJsonStore::new(
                dir.path().join("metadata"),
                DerivedKeyProvider::new(ring.clone(), Purpose::Metadata),
                true,
                FsyncPolicy::Critical,
            )
            .unwrap(),
        ));
        let journal = Arc::new(JournalWriter::open(dir.path().join("journal.ndjson")).unwrap());
        let ledger = Arc::new(LedgerWriter::open(dir.path().join("ledger.ndjson")).unwrap());
        let anchor = Arc::new(
            AnchorWriter::open(dir.path().join("anchors.ndjson"), Some(ring), true).unwrap(),
        );
        let events = EventBuilder::new(
            "run1",
            "policyhash",
            journal,
            ledger,
            Some(anchor),
            AnchorSchedule {
                every_entries: 1,
                every_minutes: 0,
            },
        );
        Fixture {
            dir,
            media,
            metadata,
            events,
        }
    }

    fn frame_record() -> Value {
        json!({
            "record_type": "evidence.capture.frame",
            "schema_version": 1,
            "run_id": "run1",
            "ts_utc": "2026-01-02T00:00:00Z",
            "content_hash": sha256_bytes_hex(b"frame-bytes"),
        })
    }

    #[test]
    fn full_write_completes_all_stages() {
        let fx = fixture();
        let report = write_evidence_staged(
            "run1/capture.frame/1",
            b"frame-bytes",
            &frame_record(),
            &fx.media,
            &fx.metadata,
            Some(&fx.events),
            None,
        );
        assert!(report.ok, "{:?}", report.error);
        assert_eq!(report.stages_completed, ["blob", "metadata", "journal", "ledger"]);
        assert!(fx.media.has("run1/capture.frame/1"));
        assert!(fx.metadata.get("run1/capture.frame/1").unwrap().is_some());
        assert!(verify_ledger(&fx.dir.path().join("ledger.ndjson")).unwrap().ok);
        assert_eq!(read_anchors(&fx.dir.path().join("anchors.ndjson")).unwrap().len(), 1);
    }

    #[test]
    fn fault_between_journal_and_ledger_recovers_exactly_once() {
        let fx = fixture();
        let report = write_evidence_staged(
            "run1/capture.frame/1",
            b"frame-bytes",
            &frame_record(),
            &fx.media,
            &fx.metadata,
            Some(&fx.events),
            Some("journal"),
        );
        assert!(!report.ok);
        assert!(report.rollback_recorded);
        let tx_id = report.tx_id.clone().unwrap();

        // The rollback marker is in the ledger but the commit is not.
        let ledger_before = read_ledger(&fx.dir.path().join("ledger.ndjson")).unwrap();
        assert!(ledger_before
            .iter()
            .all(|e| e.get("entry_id").and_then(|v| v.as_str()) != Some(tx_id.as_str())));

        let first = recover_incomplete_evidence_writes(
            fx.dir.path(),
            &fx.metadata,
            &fx.media,
            &fx.events,
        )
        .unwrap();
        assert_eq!(first.recovered, 1);

        let ledger_after = read_ledger(&fx.dir.path().join("ledger.ndjson")).unwrap();
        let commit: Vec<&Value> = ledger_after
            .iter()
            .filter(|e| e.get("entry_id").and_then(|v| v.as_str()) == Some(tx_id.as_str()))
            .collect();
        assert_eq!(commit.len(), 1);
        assert_eq!(commit[0]["payload"]["recovered"], json!(true));
        assert!(verify_ledger(&fx.dir.path().join("ledger.ndjson")).unwrap().ok);

        // Second scan is a no-op.
        let second = recover_incomplete_evidence_writes(
            fx.dir.path(),
            &fx.metadata,
            &fx.media,
            &fx.events,
        )
        .unwrap();
        assert_eq!(second.recovered, 0);
        assert_eq!(second.skipped, second.candidates);
        let ledger_final = read_ledger(&fx.dir.path().join("ledger.ndjson")).unwrap();
        assert_eq!(ledger_final.len(), ledger_after.len());
    }

    #[test]
    fn missing_blob_is_non_recoverable() {
        let fx = fixture();
        let report = write_evidence_staged(
            "run1/capture.frame/1",
            b"frame-bytes",
            &frame_record(),
            &fx.media,
            &fx.metadata,
            Some(&fx.events),
            Some("journal"),
        );
        let tx_id = report.tx_id.unwrap();
        // Simulate blob loss after the begin marker was written.
        fx.media.delete("run1/capture.frame/1").unwrap();

        let result = recover_incomplete_evidence_writes(
            fx.dir.path(),
            &fx.metadata,
            &fx.media,
            &fx.events,
        )
        .unwrap();
        assert_eq!(result.recovered, 0);
        let ledger = read_ledger(&fx.dir.path().join("ledger.ndjson")).unwrap();
        assert!(ledger
            .iter()
            .all(|e| e.get("entry_id").and_then(|v| v.as_str()) != Some(tx_id.as_str())));
        assert!(ledger.iter().any(|e| e.get("stage").and_then(|v| v.as_str())
            == Some("evidence.write.recovery_failed")));
    }

    #[test]
    fn duplicate_write_fails_closed() {
        let fx = fixture();
        let first = write_evidence_staged(
            "run1/capture.frame/1",
            b"frame-bytes",
            &frame_record(),
            &fx.media,
            &fx.metadata,
            Some(&fx.events),
            None,
        );
        assert!(first.ok);
        let second = write_evidence_staged(
            "run1/capture.frame/1",
            b"other-bytes",
            &frame_record(),
            &fx.media,
            &fx.metadata,
            Some(&fx.events),
            None,
        );
        assert!(!second.ok);
        assert!(second.stages_completed.is_empty());
    }

    #[test]
    fn memory_store_variant_for_metadata_gate() {
        // The staged writer accepts any RawStore-backed metadata store.
        let dir = TempDir::new().unwrap();
        let ring = Arc::new(
            Keyring::load(dir.path().join("vault/keyring.json"), LoadOptions::default()).unwrap(),
        );
        let media = BlobStore::new(
            dir.path().join("media"),
            DerivedKeyProvider::new(ring, Purpose::Media),
            true,
            FsyncPolicy::None,
        )
        .unwrap();
        let metadata = ImmutableMetadataStore::new(Arc::new(MemoryStore::new()));
        let report = write_evidence_staged(
            "run1/capture.frame/1",
            b"frame-bytes",
            &frame_record(),
            &media,
            &metadata,
            None,
            None,
        );
        assert!(report.ok);
        assert_eq!(report.stages_completed.len(), 4);
    }
}
