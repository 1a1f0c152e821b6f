//! Record schema gate.

use serde_json::Value;

use crate::error::EvidenceError;

/// The closed set of evidence record types.
pub const EVIDENCE_RECORD_TYPES: [&str; 5] = [
    "evidence.capture.frame",
    "evidence.capture.segment",
    "evidence.window.meta",
    "evidence.clipboard.item",
    "evidence.capture.unavailable",
];

pub fn is_evidence_record(record: &Value) -> bool {
    record_type_of(record).starts_with("evidence.")
}

pub fn is_derived_record(record: &Value) -> bool {
    record_type_of(record).starts_with("derived.")
}

fn record_type_of(record: &Value) -> &str {
    record
        .get("record_type")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
}

fn has_str(record: &Value, field: &str) -> bool {
    record
        .get(field)
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.is_empty())
}

/// Validate a record at the store boundary.
///
/// Every record needs a `record_type` and an integer `schema_version`.
/// Evidence records must use a known type and carry `run_id`, `ts_utc`, and
/// at least one of `content_hash`/`payload_hash`; derived records carry the
/// same identity fields. Full derived lineage (source resolution) is the
/// integrity scanner's job, not the write gate's.
pub fn validate_record(record_id: &str, record: &Value) -> Result<(), EvidenceError> {
    let Some(_) = record.as_object() else {
        return Err(EvidenceError::validation(record_id, "record must be an object"));
    };
    let record_type = record_type_of(record);
    if record_type.is_empty() {
        return Err(EvidenceError::validation(record_id, "missing record_type"));
    }
    let schema_version = record.get("schema_version");
    if !schema_version.is_some_and(|v| v.is_u64() || v.is_i64()) {
        return Err(EvidenceError::validation(record_id, "missing schema_version"));
    }

    if record_type.starts_with("evidence.") {
        if !EVIDENCE_RECORD_TYPES.contains(&record_type) {
            return Err(EvidenceError::validation(
                record_id,
                format!("invalid evidence record_type: {record_type}"),
            ));
        }
        if !has_str(record, "run_id") {
            return Err(EvidenceError::validation(record_id, "missing run_id"));
        }
        if !has_str(record, "ts_utc") {
            return Err(EvidenceError::validation(record_id, "missing ts_utc"));
        }
        if !has_str(record, "content_hash") && !has_str(record, "payload_hash") {
            return Err(EvidenceError::validation(
                record_id,
                "missing content_hash or payload_hash",
            ));
        }
    } else if record_type.starts_with("derived.") {
        if !has_str(record, "run_id") {
            return Err(EvidenceError::validation(record_id, "missing run_id"));
        }
        if !has_str(record, "ts_utc") {
            return Err(EvidenceError::validation(record_id, "missing ts_utc"));
        }
        if !has_str(record, "content_hash") && !has_str(record, "payload_hash") {
            return Err(EvidenceError::validation(
                record_id,
                "missing content_hash or payload_hash",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_evidence_record_passes() {
        let record = json!({
            "record_type": "evidence.capture.frame",
            "schema_version": 1,
            "run_id": "run1",
            "ts_utc": "2026-01-02T00:00:00Z",
            "content_hash": "abc",
        });
        assert!(validate_record("run1/capture.frame/1", &record).is_ok());
    }

    #[test]
    fn missing_schema_version_rejected_for_all_types() {
        let record = json!({"record_type": "run.manifest"});
        assert!(validate_record("run1/manifest", &record).is_err());
    }

    #[test]
    fn unknown_evidence_type_rejected() {
        let record = json!({
            "record_type": "evidence.bogus",
            "schema_version": 1,
            "run_id": "run1",
            "ts_utc": "2026-01-02T00:00:00Z",
            "payload_hash": "abc",
        });
        assert!(validate_record("x", &record).is_err());
    }

    #[test]
    fn evidence_without_hash_rejected() {
        let record = json!({
            "record_type": "evidence.capture.frame",
            "schema_version": 1,
            "run_id": "run1",
            "ts_utc": "2026-01-02T00:00:00Z",
        });
        assert!(validate_record("x", &record).is_err());
    }

    #[test]
    fn type_predicates() {
        assert!(is_evidence_record(&json!({"record_type": "evidence.window.meta"})));
        assert!(is_derived_record(&json!({"record_type": "derived.sst.state"})));
        assert!(!is_derived_record(&json!({"record_type": "system.anchor"})));
    }
}
