//! Offline replay of a proof bundle.
//!
//! Everything is re-verified from the bundle's own contents: the ledger
//! chain, anchors, every citation, and every referenced policy snapshot. No
//! model calls, no access to the live stores.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use evidence::ImmutableMetadataStore;
use keyring::Keyring;
use ledger::policy_snapshot_hash;
use serde_json::Value;
use storage::MemoryStore;
use zip::ZipArchive;

use crate::citation::{CitationContext, CitationValidator, LedgerView};
use crate::error::ProofError;

#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub ok: bool,
    pub ledger_ok: bool,
    pub anchor_ok: bool,
    pub citations_ok: bool,
    pub policy_snapshot_ok: bool,
    pub errors: Vec<String>,
    pub citation_errors: Vec<Value>,
}

fn read_text(archive: &mut ZipArchive<File>, name: &str) -> String {
    let Ok(mut entry) = archive.by_name(name) else {
        return String::new();
    };
    let mut out = String::new();
    let _ = entry.read_to_string(&mut out);
    out
}

/// Replay and re-validate a bundle fully offline.
pub fn replay_bundle(
    bundle_path: &Path,
    keyring: Option<&Keyring>,
) -> Result<ReplayReport, ProofError> {
    let mut errors = Vec::new();
    if !bundle_path.exists() {
        return Ok(ReplayReport {
            ok: false,
            ledger_ok: false,
            anchor_ok: false,
            citations_ok: false,
            policy_snapshot_ok: false,
            errors: vec![format!("bundle_missing:{}", bundle_path.display())],
            citation_errors: Vec::new(),
        });
    }
    let mut archive = ZipArchive::new(File::open(bundle_path)?)?;
    if archive.by_name("manifest.json").is_err() {
        errors.push("manifest_missing".to_string());
    }
    let metadata_text = read_text(&mut archive, "metadata.jsonl");
    let ledger_text = read_text(&mut archive, "ledger.ndjson");
    let anchor_text = read_text(&mut archive, "anchors.ndjson");
    let citations_text = read_text(&mut archive, "citations.json");

    // Rebuild an in-memory metadata store from the bundled records.
    let mut records: BTreeMap<String, Value> = BTreeMap::new();
    for line in metadata_text.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(row) = serde_json::from_str::<Value>(line) else {
            errors.push("metadata_line_invalid".to_string());
            continue;
        };
        let (Some(record_id), Some(record)) = (
            row.get("record_id").and_then(Value::as_str),
            row.get("record").filter(|r| r.is_object()),
        ) else {
            errors.push("metadata_line_invalid".to_string());
            continue;
        };
        records.insert(record_id.to_string(), record.clone());
    }
    let metadata = ImmutableMetadataStore::new(Arc::new(MemoryStore::from_records(records)));

    // Ledger chain.
    let ledger_entries: Vec<Value> = ledger_text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str::<Value>(l).unwrap_or(Value::Null))
        .collect();
    let ledger_ok = if ledger_entries.is_empty() {
        errors.push("ledger_empty".to_string());
        false
    } else {
        let report = ledger::verify_entries(&ledger_entries);
        if !report.ok {
            errors.extend(report.errors.clone());
        }
        report.ok
    };

    // Anchors: bundled anchors are sanitized, so shape-check them.
    let anchors: Vec<Value> = anchor_text
        .lines()
        .filter_map(ledger::decode_anchor_line)
        .collect();
    let mut anchor_ok = true;
    for record in &anchors {
        if record.get("anchor_seq").and_then(Value::as_u64).is_none()
            || record
                .get("ledger_head_hash")
                .and_then(Value::as_str)
                .is_none()
        {
            anchor_ok = false;
            errors.push("anchor_missing_fields".to_string());
        }
    }

    // Citations against the embedded records only.
    let citations: Vec<Value> = serde_json::from_str(&citations_text).unwrap_or_default();
    let (citations_ok, citation_errors) = if citations.is_empty() {
        errors.push("citations_missing".to_string());
        (false, Vec::new())
    } else {
        let ctx = CitationContext {
            metadata: &metadata,
            ledger: LedgerView::from_entries(&ledger_entries),
            anchors: anchors.clone(),
            keyring,
            strict_ledger: ledger::strict_ledger_required(),
        };
        let result = CitationValidator::new(ctx).resolve(&citations);
        if !result.ok {
            errors.push("citations_invalid".to_string());
        }
        (result.ok, result.errors)
    };

    // Policy snapshots referenced by bundled ledger entries.
    let mut policy_snapshot_ok = true;
    for entry in &ledger_entries {
        let Some(hash) = entry.get("policy_snapshot_hash").and_then(Value::as_str) else {
            continue;
        };
        let payload_text = read_text(&mut archive, &format!("policy_snapshots/{hash}.json"));
        if payload_text.is_empty() {
            // Snapshot hashes stamped by the event builder may predate the
            // bundle scope; only bundled snapshots are re-checked.
            continue;
        }
        match serde_json::from_str::<Value>(&payload_text) {
            Ok(payload) => {
                if policy_snapshot_hash(&payload)? != hash {
                    policy_snapshot_ok = false;
                    errors.push(format!("policy_snapshot_mismatch:{hash}"));
                }
            }
            Err(_) => {
                policy_snapshot_ok = false;
                errors.push(format!("policy_snapshot_invalid:{hash}"));
            }
        }
    }

    Ok(ReplayReport {
        ok: errors.is_empty(),
        ledger_ok,
        anchor_ok,
        citations_ok,
        policy_snapshot_ok,
        errors,
        citation_errors,
    })
}
