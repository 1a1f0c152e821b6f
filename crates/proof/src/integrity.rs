//! Store-wide integrity scanner.

use std::path::PathBuf;

use canonical::{sha256_bytes_hex, sha256_canonical};
use evidence::{is_derived_record, is_evidence_record, ImmutableMetadataStore};
use keyring::Keyring;
use ledger::{verify_anchors, verify_ledger};
use serde_json::Value;
use storage::BlobStore;

use crate::error::ProofError;

#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub ok: bool,
    pub checked: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub ok: bool,
    pub ledger: CheckReport,
    pub anchors: CheckReport,
    pub evidence: CheckReport,
    pub metadata_refs: CheckReport,
}

/// Re-verifies the whole provenance surface: ledger chain, anchor
/// signatures, evidence hashes against blob bytes and canonical payloads,
/// and lineage references. Never modifies anything.
pub struct IntegrityScanner<'a> {
    pub metadata: &'a ImmutableMetadataStore,
    pub media: Option<&'a BlobStore>,
    pub ledger_path: PathBuf,
    pub anchor_path: PathBuf,
    pub keyring: Option<&'a Keyring>,
}

impl<'a> IntegrityScanner<'a> {
    pub fn run(&self) -> Result<IntegrityReport, ProofError> {
        let ledger_report = verify_ledger(&self.ledger_path)?;
        let ledger = CheckReport {
            ok: ledger_report.ok,
            checked: ledger_report.entries,
            errors: ledger_report.errors,
        };
        let anchor_report = verify_anchors(&self.anchor_path, self.keyring)?;
        let anchors = CheckReport {
            ok: anchor_report.ok,
            checked: anchor_report.anchors,
            errors: anchor_report.errors,
        };
        let evidence = self.verify_evidence()?;
        let metadata_refs = self.verify_metadata_refs()?;
        let ok = ledger.ok && anchors.ok && evidence.ok && metadata_refs.ok;
        Ok(IntegrityReport {
            ok,
            ledger,
            anchors,
            evidence,
            metadata_refs,
        })
    }

    fn verify_evidence(&self) -> Result<CheckReport, ProofError> {
        let mut errors = Vec::new();
        let mut checked = 0;
        for record_id in self.metadata.keys()? {
            let Some(record) = self.metadata.get(&record_id)? else {
                continue;
            };
            if !is_evidence_record(&record) {
                continue;
            }
            checked += 1;
            if let Some(content_hash) = record.get("content_hash").and_then(Value::as_str) {
                if let Some(media) = self.media {
                    match media.get(&record_id)? {
                        Some(blob) => {
                            if sha256_bytes_hex(&blob) != content_hash {
                                errors.push(format!("content_hash_mismatch:{record_id}"));
                            }
                        }
                        None => errors.push(format!("blob_missing:{record_id}")),
                    }
                }
            }
            if let Some(payload_hash) = record.get("payload_hash").and_then(Value::as_str) {
                let mut without = record.as_object().cloned().unwrap_or_default();
                without.remove("payload_hash");
                let expected = sha256_canonical(&Value::Object(without))?;
                if expected != payload_hash {
                    errors.push(format!("payload_hash_mismatch:{record_id}"));
                }
            }
        }
        Ok(CheckReport {
            ok: errors.is_empty(),
            checked,
            errors,
        })
    }

    fn verify_metadata_refs(&self) -> Result<CheckReport, ProofError> {
        let mut errors = Vec::new();
        let mut checked = 0;
        for record_id in self.metadata.keys()? {
            let Some(record) = self.metadata.get(&record_id)? else {
                continue;
            };
            if !is_derived_record(&record) {
                continue;
            }
            checked += 1;
            for field in ["source_id", "parent_evidence_id"] {
                if let Some(target) = record.get(field).and_then(Value::as_str) {
                    self.check_evidence_ref(&record_id, field, target, &mut errors)?;
                }
            }
            if let Some(span_source) = record
                .get("span_ref")
                .and_then(|s| s.get("source_id"))
                .and_then(Value::as_str)
            {
                self.check_evidence_ref(&record_id, "span_ref.source_id", span_source, &mut errors)?;
            }
        }
        Ok(CheckReport {
            ok: errors.is_empty(),
            checked,
            errors,
        })
    }

    fn check_evidence_ref(
        &self,
        record_id: &str,
        field: &str,
        target: &str,
        errors: &mut Vec<String>,
    ) -> Result<(), ProofError> {
        match self.metadata.get(target)? {
            Some(target_record) if is_evidence_record(&target_record) => {}
            Some(_) => errors.push(format!("{field}_not_evidence:{record_id}")),
            None => errors.push(format!("{field}_missing:{record_id}")),
        }
        Ok(())
    }
}
