//! Citation locator validation.

use std::path::Path;

use canonical::{parse_ts_utc, sha256_text};
use evidence::{is_derived_record, is_evidence_record, ImmutableMetadataStore};
use keyring::Keyring;
use ledger::{read_anchors, strict_ledger_required, verify_anchor_hmac, verify_ledger};
use serde_json::{json, Value};

use crate::error::ProofError;

/// Pre-verified view of a ledger chain used during citation checks.
#[derive(Debug, Clone)]
pub struct LedgerView {
    pub ok: bool,
    pub head: Option<String>,
    pub entry_hashes: Vec<String>,
}

impl LedgerView {
    pub fn from_path(path: &Path) -> Result<Self, ProofError> {
        let report = verify_ledger(path)?;
        Ok(Self {
            ok: report.ok,
            head: report.head,
            entry_hashes: report.entry_hashes,
        })
    }

    pub fn from_entries(entries: &[Value]) -> Self {
        let report = ledger::verify_entries(entries);
        Self {
            ok: report.ok,
            head: report.head,
            entry_hashes: report.entry_hashes,
        }
    }

    /// Whether `head` is an acceptable citation head. Strict mode requires
    /// the current chain head; lenient mode accepts any known entry hash.
    fn accepts(&self, head: &str, strict: bool) -> bool {
        if !self.ok {
            return false;
        }
        if strict {
            self.head.as_deref() == Some(head)
        } else {
            self.entry_hashes.iter().any(|h| h == head)
        }
    }
}

/// Everything a citation check needs, independent of whether it runs
/// against live stores or an unpacked proof bundle.
pub struct CitationContext<'a> {
    pub metadata: &'a ImmutableMetadataStore,
    pub ledger: LedgerView,
    pub anchors: Vec<Value>,
    pub keyring: Option<&'a Keyring>,
    pub strict_ledger: bool,
}

impl<'a> CitationContext<'a> {
    pub fn from_paths(
        metadata: &'a ImmutableMetadataStore,
        ledger_path: &Path,
        anchor_path: &Path,
        keyring: Option<&'a Keyring>,
    ) -> Result<Self, ProofError> {
        Ok(Self {
            metadata,
            ledger: LedgerView::from_path(ledger_path)?,
            anchors: read_anchors(anchor_path)?,
            keyring,
            strict_ledger: strict_ledger_required(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CitationResolution {
    pub ok: bool,
    pub resolved: Vec<Value>,
    pub errors: Vec<Value>,
}

pub struct CitationValidator<'a> {
    ctx: CitationContext<'a>,
}

impl<'a> CitationValidator<'a> {
    pub fn new(ctx: CitationContext<'a>) -> Self {
        Self { ctx }
    }

    /// Validate every citation; each citation short-circuits at its first
    /// violation, which is reported with the exact failing field.
    pub fn resolve(&self, citations: &[Value]) -> CitationResolution {
        let mut errors = Vec::new();
        let mut resolved = Vec::new();
        for (index, citation) in citations.iter().enumerate() {
            match self.check_one(citation) {
                Ok(entry) => resolved.push(entry),
                Err(mut err) => {
                    if let Some(map) = err.as_object_mut() {
                        map.insert("index".to_string(), json!(index));
                    }
                    errors.push(err);
                }
            }
        }
        CitationResolution {
            ok: errors.is_empty(),
            resolved,
            errors,
        }
    }

    /// Like [`resolve`], but raises on the first violation.
    ///
    /// [`resolve`]: CitationValidator::resolve
    pub fn validate(&self, citations: &[Value]) -> Result<(), ProofError> {
        let result = self.resolve(citations);
        if result.ok {
            Ok(())
        } else {
            Err(ProofError::CitationInvalid(
                result.errors.first().map(|e| e.to_string()).unwrap_or_default(),
            ))
        }
    }

    fn check_one(&self, citation: &Value) -> Result<Value, Value> {
        let Some(map) = citation.as_object() else {
            return Err(json!({"error": "citation_not_object"}));
        };
        let str_field = |field: &str| -> Result<String, Value> {
            map.get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| json!({"error": format!("missing_{field}")}))
        };

        if !map.get("schema_version").is_some_and(|v| v.is_u64() || v.is_i64()) {
            return Err(json!({"error": "missing_schema_version"}));
        }
        let _source = str_field("source")?;
        let span_kind = str_field("span_kind")?;
        if !matches!(span_kind.as_str(), "text" | "record" | "time") {
            return Err(json!({"error": "invalid_span_kind", "span_kind": span_kind}));
        }
        let ledger_head = str_field("ledger_head")?;
        let anchor_ref = map
            .get("anchor_ref")
            .filter(|v| v.is_object())
            .ok_or_else(|| json!({"error": "missing_anchor_ref"}))?;
        let evidence_id = str_field("evidence_id")?;
        let evidence_hash = str_field("evidence_hash")?;

        let evidence_record = self
            .metadata_get(&evidence_id)
            .ok_or_else(|| json!({"error": "evidence_not_found", "evidence_id": evidence_id}))?;
        if !is_evidence_record(&evidence_record) {
            return Err(json!({"error": "evidence_wrong_type", "evidence_id": evidence_id}));
        }
        let expected = record_hash(&evidence_record);
        if expected.as_deref() != Some(evidence_hash.as_str()) {
            return Err(json!({"error": "evidence_hash_mismatch", "evidence_id": evidence_id}));
        }

        let derived_id = map
            .get("derived_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let mut derived_record = None;
        if let Some(derived_id) = &derived_id {
            let record = self
                .metadata_get(derived_id)
                .ok_or_else(|| json!({"error": "derived_not_found", "derived_id": derived_id}))?;
            if !is_derived_record(&record) {
                return Err(json!({"error": "derived_wrong_type", "derived_id": derived_id}));
            }
            if let Some(source_id) = record.get("source_id").and_then(Value::as_str) {
                if source_id != evidence_id {
                    return Err(json!({"error": "derived_source_mismatch", "derived_id": derived_id}));
                }
            }
            let derived_hash = str_field("derived_hash")?;
            if record_hash(&record).as_deref() != Some(derived_hash.as_str()) {
                return Err(json!({"error": "derived_hash_mismatch", "derived_id": derived_id}));
            }
            derived_record = Some(record);
        }
        let target_record = derived_record.as_ref().unwrap_or(&evidence_record);

        if let Some(locator) = map.get("locator") {
            self.check_locator(locator, &evidence_id, derived_id.as_deref(), target_record)?;
        }

        if let Some(span_ref) = map.get("span_ref").filter(|v| !v.is_null()) {
            self.check_span_ref(span_ref, &evidence_id, target_record)?;
        }

        if !self.ctx.ledger.accepts(&ledger_head, self.ctx.strict_ledger) {
            return Err(json!({"error": "ledger_head_invalid", "ledger_head": ledger_head}));
        }
        self.check_anchor(anchor_ref)?;

        Ok(json!({
            "schema_version": map.get("schema_version"),
            "evidence_id": evidence_id,
            "evidence_hash": evidence_hash,
            "derived_id": derived_id,
            "derived_hash": map.get("derived_hash"),
            "span_kind": span_kind,
            "span_ref": map.get("span_ref"),
            "locator": map.get("locator"),
            "ledger_head": ledger_head,
            "anchor_ref": anchor_ref,
            "source": map.get("source"),
        }))
    }

    fn metadata_get(&self, record_id: &str) -> Option<Value> {
        self.ctx.metadata.get(record_id).ok().flatten()
    }

    fn check_locator(
        &self,
        locator: &Value,
        evidence_id: &str,
        derived_id: Option<&str>,
        target_record: &Value,
    ) -> Result<(), Value> {
        let Some(map) = locator.as_object() else {
            return Err(json!({"error": "locator_invalid"}));
        };
        if let Some(record_id) = map.get("record_id").and_then(Value::as_str) {
            if record_id != evidence_id && Some(record_id) != derived_id {
                return Err(json!({"error": "locator_record_mismatch", "record_id": record_id}));
            }
        }
        if let Some(record_hash_field) = map.get("record_hash").and_then(Value::as_str) {
            if record_hash(target_record).as_deref() != Some(record_hash_field) {
                return Err(json!({"error": "locator_hash_mismatch"}));
            }
        }
        let kind = map.get("kind").and_then(Value::as_str).unwrap_or_default();
        if kind == "text_offsets" {
            let start = map.get("offset_start").and_then(Value::as_i64);
            let end = map.get("offset_end").and_then(Value::as_i64);
            let (Some(start), Some(end)) = (start, end) else {
                return Err(json!({"error": "invalid_offsets"}));
            };
            if start < 0 || end < start {
                return Err(json!({"error": "invalid_offsets"}));
            }
            let text = target_record
                .get("text_normalized")
                .or_else(|| target_record.get("text"))
                .and_then(Value::as_str)
                .ok_or_else(|| json!({"error": "missing_text_for_span"}))?;
            let chars: Vec<char> = text.chars().collect();
            if end as usize > chars.len() {
                return Err(json!({"error": "span_out_of_bounds"}));
            }
            if let Some(span_sha256) = map.get("span_sha256").and_then(Value::as_str) {
                let slice: String = chars[start as usize..end as usize].iter().collect();
                if sha256_text(&slice) != span_sha256 {
                    return Err(json!({"error": "span_hash_mismatch"}));
                }
            }
        }
        Ok(())
    }

    fn check_span_ref(
        &self,
        span_ref: &Value,
        evidence_id: &str,
        target_record: &Value,
    ) -> Result<(), Value> {
        let Some(map) = span_ref.as_object() else {
            return Err(json!({"error": "span_ref_invalid"}));
        };
        if let Some(expected) = target_record.get("span_ref").filter(|v| v.is_object()) {
            for (key, value) in map {
                if expected.get(key) != Some(value) {
                    return Err(json!({"error": "span_ref_mismatch", "field": key}));
                }
            }
        } else if map.get("kind").and_then(Value::as_str) == Some("time") {
            if !span_within_record(target_record, map) {
                return Err(json!({"error": "span_ref_out_of_bounds"}));
            }
        } else {
            return Err(json!({"error": "span_ref_missing"}));
        }
        if let Some(span_source) = map.get("source_id").and_then(Value::as_str) {
            if span_source != evidence_id {
                return Err(json!({"error": "span_source_mismatch"}));
            }
        }
        Ok(())
    }

    fn check_anchor(&self, anchor_ref: &Value) -> Result<(), Value> {
        let seq = anchor_ref.get("anchor_seq").and_then(Value::as_u64);
        let head = anchor_ref.get("ledger_head_hash").and_then(Value::as_str);
        let (Some(seq), Some(head)) = (seq, head) else {
            return Err(json!({"error": "anchor_invalid", "reason": "missing_fields"}));
        };
        for record in &self.ctx.anchors {
            if record.get("anchor_seq").and_then(Value::as_u64) != Some(seq) {
                continue;
            }
            if record.get("ledger_head_hash").and_then(Value::as_str) != Some(head) {
                return Err(json!({"error": "anchor_invalid", "anchor_seq": seq}));
            }
            if record.get("anchor_hmac").is_some() {
                let Some(keyring) = self.ctx.keyring else {
                    return Err(json!({"error": "anchor_invalid", "reason": "keyring_missing"}));
                };
                if !verify_anchor_hmac(record, keyring) {
                    return Err(json!({"error": "anchor_invalid", "reason": "hmac_mismatch"}));
                }
            }
            return Ok(());
        }
        Err(json!({"error": "anchor_invalid", "reason": "anchor_not_found", "anchor_seq": seq}))
    }
}

/// The citable hash of a record: `payload_hash` with `content_hash` as the
/// fallback.
pub(crate) fn record_hash(record: &Value) -> Option<String> {
    record
        .get("payload_hash")
        .or_else(|| record.get("content_hash"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn span_within_record(record: &Value, span_ref: &serde_json::Map<String, Value>) -> bool {
    let rec_start = record
        .get("ts_start_utc")
        .or_else(|| record.get("ts_utc"))
        .and_then(Value::as_str)
        .and_then(parse_ts_utc);
    let rec_end = record
        .get("ts_end_utc")
        .or_else(|| record.get("ts_utc"))
        .and_then(Value::as_str)
        .and_then(parse_ts_utc);
    let Some(rec_start) = rec_start else {
        return false;
    };
    let rec_end = rec_end.unwrap_or(rec_start);
    if let Some(start) = span_ref.get("start_ts_utc").and_then(Value::as_str).and_then(parse_ts_utc)
    {
        if start < rec_start {
            return false;
        }
    }
    if let Some(end) = span_ref.get("end_ts_utc").and_then(Value::as_str).and_then(parse_ts_utc) {
        if end > rec_end {
            return false;
        }
    }
    true
}
