//! Proof bundle export.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use canonical::{encode_component, now_ts_utc, sha256_bytes_hex};
use evidence::ImmutableMetadataStore;
use hmac::{Hmac, Mac};
use keyring::{derive_key, Keyring, Purpose};
use ledger::{
    policy_snapshot_hash, policy_snapshot_record_id, read_anchors, read_ledger, verify_anchors,
    verify_ledger,
};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use storage::BlobStore;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::citation::{CitationContext, CitationValidator};
use crate::error::ProofError;
use crate::MANIFEST_KEY_INFO;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct ProofBundleReport {
    pub ok: bool,
    pub output_path: String,
    pub evidence_ids: Vec<String>,
    pub derived_ids: Vec<String>,
    pub edge_ids: Vec<String>,
    pub ledger_entries: usize,
    pub anchors: usize,
    pub blobs: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Export a scoped, signed proof bundle for a set of evidence IDs.
#[allow(clippy::too_many_arguments)]
pub fn export_proof_bundle(
    metadata: &ImmutableMetadataStore,
    media: &BlobStore,
    keyring: Option<&Keyring>,
    ledger_path: &Path,
    anchor_path: &Path,
    output_path: &Path,
    evidence_ids: &[String],
    citations: Option<&[Value]>,
) -> Result<ProofBundleReport, ProofError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    let mut evidence_list: BTreeSet<String> =
        evidence_ids.iter().filter(|id| !id.is_empty()).cloned().collect();
    if let Some(citations) = citations {
        for citation in citations {
            if let Some(id) = citation.get("evidence_id").and_then(Value::as_str) {
                evidence_list.insert(id.to_string());
            }
        }
    }
    if evidence_list.is_empty() {
        return Err(ProofError::MissingEvidenceIds);
    }
    let evidence_list: Vec<String> = evidence_list.into_iter().collect();

    // Record collection: evidence, derived-by-source, and touching edges.
    let (records, derived_ids, edge_ids, missing) = collect_records(metadata, &evidence_list)?;
    if !missing.is_empty() {
        warnings.push(format!("missing_evidence:{}", missing.len()));
    }

    let mut scope: BTreeSet<String> = evidence_list.iter().cloned().collect();
    scope.extend(derived_ids.iter().cloned());
    scope.extend(edge_ids.iter().cloned());
    let (ledger_entries, ledger_hashes) =
        collect_ledger_entries(ledger_path, &scope, citations, &mut errors)?;
    let anchors = collect_anchors(anchor_path, &ledger_hashes, citations, &mut warnings)?;

    // Assemble every bundle file in memory, sorted by path.
    let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    let mut metadata_lines = Vec::new();
    for (record_id, record) in &records {
        metadata_lines.push(serde_json::to_string(
            &json!({"record_id": record_id, "record": record}),
        )?);
    }
    files.insert("metadata.jsonl".into(), join_lines(&metadata_lines));

    let ledger_lines: Vec<String> = ledger_entries
        .iter()
        .map(|e| serde_json::to_string(e))
        .collect::<Result<_, _>>()?;
    files.insert("ledger.ndjson".into(), join_lines(&ledger_lines));

    let anchor_lines: Vec<String> = anchors
        .iter()
        .map(|a| serde_json::to_string(&sanitize_anchor(a)))
        .collect::<Result<_, _>>()?;
    files.insert("anchors.ndjson".into(), join_lines(&anchor_lines));

    // Policy snapshots referenced by the collected entries.
    let policy_hashes: BTreeSet<String> = ledger_entries
        .iter()
        .filter_map(|e| e.get("policy_snapshot_hash").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    for hash in &policy_hashes {
        let record_id = policy_snapshot_record_id(hash);
        match metadata.get(&record_id)? {
            Some(record) => match record.get("payload") {
                Some(payload) if payload.is_object() => {
                    files.insert(
                        format!("policy_snapshots/{hash}.json"),
                        serde_json::to_string_pretty(payload)?.into_bytes(),
                    );
                }
                _ => warnings.push(format!("policy_snapshot_invalid:{hash}")),
            },
            None => warnings.push(format!("policy_snapshot_missing:{hash}")),
        }
    }

    // Blobs for every evidence record.
    let mut blob_manifest = Map::new();
    let mut blob_count = 0usize;
    for record_id in &evidence_list {
        match media.get(record_id) {
            Ok(Some(data)) => {
                let name = format!("blobs/{}.bin", encode_component(record_id));
                blob_manifest.insert(
                    record_id.clone(),
                    json!({"file": name, "sha256": sha256_bytes_hex(&data)}),
                );
                files.insert(name, data);
                blob_count += 1;
            }
            Ok(None) => warnings.push(format!("blob_missing:{record_id}")),
            Err(err) => {
                warn!(record_id, %err, "blob read failed during export");
                warnings.push(format!("blob_missing:{record_id}"));
            }
        }
    }
    if !blob_manifest.is_empty() {
        files.insert(
            "blobs/manifest.json".into(),
            serde_json::to_string_pretty(&json!({"schema_version": 1, "files": blob_manifest}))?
                .into_bytes(),
        );
    }

    if let Some(citations) = citations {
        files.insert(
            "citations.json".into(),
            serde_json::to_string_pretty(&Value::Array(citations.to_vec()))?.into_bytes(),
        );
    }

    let verification = build_verification(
        metadata,
        keyring,
        ledger_path,
        anchor_path,
        citations,
        &ledger_entries,
    )?;
    files.insert(
        "verification.json".into(),
        serde_json::to_string_pretty(&verification)?.into_bytes(),
    );

    // Manifest over everything written so far.
    let bundle_files: Vec<Value> = files
        .iter()
        .map(|(path, data)| {
            json!({"path": path, "sha256": sha256_bytes_hex(data), "bytes": data.len()})
        })
        .collect();
    let manifest = json!({
        "schema_version": 1,
        "created_at": now_ts_utc(),
        "evidence_ids": evidence_list,
        "derived_ids": derived_ids,
        "edge_ids": edge_ids,
        "record_count": records.len(),
        "ledger_entries": ledger_entries.len(),
        "anchors": anchors.len(),
        "blobs": blob_count,
        "policy_snapshot_hashes": policy_hashes,
        "bundle_files": bundle_files,
        "files": {
            "metadata": "metadata.jsonl",
            "ledger": "ledger.ndjson",
            "anchors": "anchors.ndjson",
            "verification": "verification.json",
            "blobs_manifest": if blob_count > 0 { json!("blobs/manifest.json") } else { Value::Null },
            "citations": if citations.is_some() { json!("citations.json") } else { Value::Null },
            "policy_snapshots_dir": if policy_hashes.is_empty() { Value::Null } else { json!("policy_snapshots") },
        },
    });
    let manifest_bytes = serde_json::to_string_pretty(&manifest)?.into_bytes();
    if let Some(signature) = sign_manifest(&manifest_bytes, keyring)? {
        files.insert(
            "manifest.sig.json".into(),
            serde_json::to_string_pretty(&signature)?.into_bytes(),
        );
    }
    files.insert("manifest.json".into(), manifest_bytes);

    write_zip(output_path, &files)?;
    info!(path = %output_path.display(), records = records.len(), "proof bundle written");

    Ok(ProofBundleReport {
        ok: errors.is_empty(),
        output_path: output_path.display().to_string(),
        evidence_ids: evidence_list,
        derived_ids,
        edge_ids,
        ledger_entries: ledger_entries.len(),
        anchors: anchors.len(),
        blobs: blob_count,
        errors,
        warnings,
    })
}

type CollectedRecords = (BTreeMap<String, Value>, Vec<String>, Vec<String>, Vec<String>);

fn collect_records(
    metadata: &ImmutableMetadataStore,
    evidence_ids: &[String],
) -> Result<CollectedRecords, ProofError> {
    let mut records: BTreeMap<String, Value> = BTreeMap::new();
    let mut derived_ids = BTreeSet::new();
    let mut edge_ids = BTreeSet::new();
    let mut missing = Vec::new();
    let evidence_set: BTreeSet<&str> = evidence_ids.iter().map(String::as_str).collect();

    for record_id in evidence_ids {
        match metadata.get(record_id)? {
            Some(record) => {
                records.insert(record_id.clone(), record);
            }
            None => missing.push(record_id.clone()),
        }
    }

    let keys = metadata.keys()?;
    for record_id in &keys {
        let Some(record) = metadata.get(record_id)? else {
            continue;
        };
        let record_type = record
            .get("record_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if record_type.starts_with("derived.") && record_type != "derived.graph.edge" {
            let source = record
                .get("source_id")
                .or_else(|| record.get("parent_evidence_id"))
                .and_then(Value::as_str);
            if source.is_some_and(|s| evidence_set.contains(s)) {
                records.insert(record_id.clone(), record.clone());
                derived_ids.insert(record_id.clone());
            }
        }
        if record_type == "derived.graph.edge" {
            let parent = record.get("parent_id").and_then(Value::as_str).unwrap_or_default();
            let child = record.get("child_id").and_then(Value::as_str).unwrap_or_default();
            if evidence_set.contains(parent) || evidence_set.contains(child) {
                records.insert(record_id.clone(), record.clone());
                edge_ids.insert(record_id.clone());
            }
        }
    }
    // Edges touching collected derived records.
    if !derived_ids.is_empty() {
        for record_id in &keys {
            if edge_ids.contains(record_id) {
                continue;
            }
            let Some(record) = metadata.get(record_id)? else {
                continue;
            };
            if record.get("record_type").and_then(Value::as_str) != Some("derived.graph.edge") {
                continue;
            }
            let parent = record.get("parent_id").and_then(Value::as_str).unwrap_or_default();
            let child = record.get("child_id").and_then(Value::as_str).unwrap_or_default();
            if derived_ids.contains(parent) || derived_ids.contains(child) {
                records.insert(record_id.clone(), record.clone());
                edge_ids.insert(record_id.clone());
            }
        }
    }
    Ok((
        records,
        derived_ids.into_iter().collect(),
        edge_ids.into_iter().collect(),
        missing,
    ))
}

fn collect_ledger_entries(
    ledger_path: &Path,
    scope: &BTreeSet<String>,
    citations: Option<&[Value]>,
    errors: &mut Vec<String>,
) -> Result<(Vec<Value>, BTreeSet<String>), ProofError> {
    if !ledger_path.exists() {
        errors.push(format!("ledger_missing:{}", ledger_path.display()));
        return Ok((Vec::new(), BTreeSet::new()));
    }
    let mut heads: BTreeSet<String> = BTreeSet::new();
    if let Some(citations) = citations {
        for citation in citations {
            if let Some(head) = citation.get("ledger_head").and_then(Value::as_str) {
                heads.insert(head.to_string());
            }
        }
    }
    let mut entries = Vec::new();
    let mut hashes = BTreeSet::new();
    for entry in read_ledger(ledger_path)? {
        if entry.is_null() {
            errors.push("ledger_line_invalid".to_string());
            continue;
        }
        let entry_hash = entry
            .get("entry_hash")
            .and_then(Value::as_str)
            .map(str::to_string);
        let cited = entry_hash.as_ref().is_some_and(|h| heads.contains(h));
        let touches = ["inputs", "outputs"].iter().any(|field| {
            entry
                .get(*field)
                .and_then(Value::as_array)
                .is_some_and(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .any(|id| scope.contains(id))
                })
        });
        if cited || touches {
            if let Some(hash) = &entry_hash {
                hashes.insert(hash.clone());
            }
            entries.push(entry);
        }
    }
    Ok((entries, hashes))
}

fn collect_anchors(
    anchor_path: &Path,
    ledger_hashes: &BTreeSet<String>,
    citations: Option<&[Value]>,
    warnings: &mut Vec<String>,
) -> Result<Vec<Value>, ProofError> {
    if !anchor_path.exists() {
        warnings.push(format!("anchor_missing:{}", anchor_path.display()));
        return Ok(Vec::new());
    }
    let mut refs: BTreeSet<(u64, String)> = BTreeSet::new();
    if let Some(citations) = citations {
        for citation in citations {
            let Some(anchor_ref) = citation.get("anchor_ref") else {
                continue;
            };
            let seq = anchor_ref.get("anchor_seq").and_then(Value::as_u64);
            let head = anchor_ref.get("ledger_head_hash").and_then(Value::as_str);
            if let (Some(seq), Some(head)) = (seq, head) {
                refs.insert((seq, head.to_string()));
            }
        }
    }
    let mut anchors = Vec::new();
    for record in read_anchors(anchor_path)? {
        let seq = record.get("anchor_seq").and_then(Value::as_u64).unwrap_or(0);
        let head = record
            .get("ledger_head_hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if refs.contains(&(seq, head.clone())) || ledger_hashes.contains(&head) {
            anchors.push(record);
        }
    }
    Ok(anchors)
}

fn sanitize_anchor(record: &Value) -> Value {
    let mut map = record.as_object().cloned().unwrap_or_default();
    map.remove("anchor_hmac");
    map.remove("anchor_key_id");
    Value::Object(map)
}

fn build_verification(
    metadata: &ImmutableMetadataStore,
    keyring: Option<&Keyring>,
    ledger_path: &Path,
    anchor_path: &Path,
    citations: Option<&[Value]>,
    bundled_entries: &[Value],
) -> Result<Value, ProofError> {
    let ledger_report = verify_ledger(ledger_path)?;
    let anchor_report = verify_anchors(anchor_path, keyring)?;
    let mut report = json!({
        "ledger_ok": ledger_report.ok,
        "ledger_errors": ledger_report.errors,
        "anchor_ok": anchor_report.ok,
        "anchor_errors": anchor_report.errors,
    });
    if let Some(citations) = citations {
        let ctx = CitationContext::from_paths(metadata, ledger_path, anchor_path, keyring)?;
        let result = CitationValidator::new(ctx).resolve(citations);
        report["citations_ok"] = json!(result.ok);
        report["citations_errors"] = json!(result.errors);
    }

    // Policy snapshots referenced by bundled entries must exist and re-hash.
    let mut missing = BTreeSet::new();
    let mut mismatched = BTreeSet::new();
    for entry in bundled_entries {
        let Some(hash) = entry.get("policy_snapshot_hash").and_then(Value::as_str) else {
            continue;
        };
        match metadata.get(&policy_snapshot_record_id(hash))? {
            Some(record) => match record.get("payload") {
                Some(payload) if payload.is_object() => {
                    if policy_snapshot_hash(payload)? != hash {
                        mismatched.insert(hash.to_string());
                    }
                }
                _ => {
                    missing.insert(hash.to_string());
                }
            },
            None => {
                missing.insert(hash.to_string());
            }
        }
    }
    report["policy_snapshot"] = json!({
        "ok": missing.is_empty() && mismatched.is_empty(),
        "missing": missing,
        "mismatched": mismatched,
    });
    Ok(report)
}

/// HMAC-sign the manifest: the signature covers the SHA-256 hex of the
/// manifest bytes, under a key derived from the active anchor root.
fn sign_manifest(
    manifest_bytes: &[u8],
    keyring: Option<&Keyring>,
) -> Result<Option<Value>, ProofError> {
    let Some(keyring) = keyring else {
        return Ok(None);
    };
    let (key_id, root) = keyring.active(Purpose::Anchor)?;
    let key = derive_key(&root, MANIFEST_KEY_INFO)?;
    let manifest_sha = sha256_bytes_hex(manifest_bytes);
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|_| ProofError::BundleInvalid("hmac key".into()))?;
    mac.update(manifest_sha.as_bytes());
    let signature_hex = hex::encode(mac.finalize().into_bytes());
    Ok(Some(json!({
        "schema_version": 1,
        "algo": "hmac-sha256",
        "key_id": key_id,
        "manifest_sha256": manifest_sha,
        "signature_hex": signature_hex,
    })))
}

/// Deterministic ZIP: lexicographic path order, fixed 1980-01-01 entry
/// timestamps, deflate compression.
fn write_zip(output_path: &Path, files: &BTreeMap<String, Vec<u8>>) -> Result<(), ProofError> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(output_path)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());
    for (path, data) in files {
        writer.start_file(path.as_str(), options)?;
        writer.write_all(data)?;
    }
    writer.finish()?;
    Ok(())
}

fn join_lines(lines: &[String]) -> Vec<u8> {
    if lines.is_empty() {
        return Vec::new();
    }
    let mut out = lines.join("\n").into_bytes();
    out.push(b'\n');
    out
}
