//! Builders for derived records, derivation edges, and unavailable markers.

use canonical::{
    encode_component, normalize_text, now_ts_utc, prefixed_id, run_id_of, sha256_canonical,
    sha256_text, TEXT_NORM_VERSION,
};
use serde_json::{json, Map, Value};

use crate::error::EvidenceError;
use crate::store::ImmutableMetadataStore;

/// Time-window span ref pointing back at a source evidence record.
pub fn build_span_ref(source_record: &Value, source_id: &str) -> Value {
    let ts_start = source_record
        .get("ts_start_utc")
        .or_else(|| source_record.get("ts_utc"))
        .and_then(|v| v.as_str());
    let ts_end = source_record
        .get("ts_end_utc")
        .or_else(|| source_record.get("ts_utc"))
        .and_then(|v| v.as_str());
    let mut span = Map::new();
    span.insert("kind".into(), json!("time"));
    span.insert("source_id".into(), json!(source_id));
    if let Some(ts) = ts_start {
        span.insert("start_ts_utc".into(), json!(ts));
    }
    if let Some(ts) = ts_end {
        span.insert("end_ts_utc".into(), json!(ts));
    }
    Value::Object(span)
}

/// Model identity block for a derived record: the model id, a digest over
/// the identity seed, and the provider parameters.
pub fn model_identity(kind: &str, provider_id: &str, config: &Value) -> Result<Value, EvidenceError> {
    let models = config.get("models").cloned().unwrap_or_else(|| json!({}));
    let mut model_id = provider_id.to_string();
    if kind == "vlm" {
        if let Some(path) = models.get("vlm_path").and_then(|v| v.as_str()) {
            model_id = path.to_string();
        }
    }
    if kind == "ocr" {
        if let Some(path) = models.get("ocr_path").and_then(|v| v.as_str()) {
            model_id = path.to_string();
        }
    }
    let params = json!({"provider_id": provider_id});
    let seed = json!({"model_id": model_id, "provider_id": provider_id, "params": params});
    Ok(json!({
        "model_id": model_id,
        "model_digest": sha256_canonical(&seed)?,
        "model_provider": provider_id,
        "parameters": params,
    }))
}

/// Build a `derived.text.{kind}` record from extracted text. Returns `None`
/// when normalization leaves nothing to store.
#[allow(clippy::too_many_arguments)]
pub fn build_text_record(
    kind: &str,
    text: &str,
    source_id: &str,
    source_record: &Value,
    provider_id: &str,
    config: &Value,
    ts_utc: Option<&str>,
) -> Result<Option<Value>, EvidenceError> {
    let normalized = normalize_text(text);
    if normalized.is_empty() {
        return Ok(None);
    }
    let span_ref = build_span_ref(source_record, source_id);
    let identity = model_identity(kind, provider_id, config)?;
    let run_id = source_record
        .get("run_id")
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| run_id_of(source_id));
    let ts = ts_utc.map(str::to_string).unwrap_or_else(now_ts_utc);

    let mut payload = Map::new();
    payload.insert("record_type".into(), json!(format!("derived.text.{kind}")));
    payload.insert("schema_version".into(), json!(1));
    payload.insert("run_id".into(), json!(run_id));
    payload.insert("ts_utc".into(), json!(ts));
    payload.insert("text".into(), json!(normalized));
    payload.insert("text_normalized".into(), json!(normalized));
    payload.insert("text_norm_version".into(), json!(TEXT_NORM_VERSION));
    payload.insert("source_id".into(), json!(source_id));
    payload.insert("parent_evidence_id".into(), json!(source_id));
    payload.insert("span_ref".into(), span_ref);
    payload.insert("method".into(), json!(kind));
    payload.insert("provider_id".into(), json!(provider_id));
    for field in ["model_id", "model_digest", "model_provider", "parameters"] {
        payload.insert(field.into(), identity[field].clone());
    }
    payload.insert("content_hash".into(), json!(sha256_text(&normalized)));
    if normalized != text {
        payload.insert("text_raw".into(), json!(text));
    }
    let hash = sha256_canonical(&Value::Object(payload.clone()))?;
    payload.insert("payload_hash".into(), json!(hash));
    Ok(Some(Value::Object(payload)))
}

/// Deterministic edge id: `{run}/derived.edge/{enc(parent)}/{enc(child)}`.
pub fn derivation_edge_id(run_id: &str, parent_id: &str, child_id: &str) -> String {
    format!(
        "{run_id}/derived.edge/{}/{}",
        encode_component(parent_id),
        encode_component(child_id)
    )
}

/// Build a `derived.graph.edge` record linking parent to child.
pub fn build_derivation_edge(
    run_id: &str,
    parent_id: &str,
    child_id: &str,
    relation_type: &str,
    span_ref: &Value,
    method: &str,
) -> Result<Value, EvidenceError> {
    let ts = span_ref
        .get("end_ts_utc")
        .or_else(|| span_ref.get("start_ts_utc"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(now_ts_utc);
    let mut edge = Map::new();
    edge.insert("record_type".into(), json!("derived.graph.edge"));
    edge.insert("schema_version".into(), json!(1));
    edge.insert("run_id".into(), json!(run_id));
    edge.insert("ts_utc".into(), json!(ts));
    edge.insert("parent_id".into(), json!(parent_id));
    edge.insert("child_id".into(), json!(child_id));
    edge.insert("relation_type".into(), json!(relation_type));
    edge.insert("span_ref".into(), span_ref.clone());
    edge.insert("method".into(), json!(method));
    let hash = sha256_canonical(&Value::Object(edge.clone()))?;
    edge.insert("content_hash".into(), json!(hash));
    Ok(Value::Object(edge))
}

/// Evidence marker recording that a capture source was unavailable.
pub fn build_unavailable_record(
    run_id: &str,
    ts_utc: &str,
    reason: &str,
    parent_evidence_id: Option<&str>,
    source_record_type: Option<&str>,
) -> Result<Value, EvidenceError> {
    let mut payload = Map::new();
    payload.insert("record_type".into(), json!("evidence.capture.unavailable"));
    payload.insert("schema_version".into(), json!(1));
    payload.insert("run_id".into(), json!(run_id));
    payload.insert("ts_utc".into(), json!(ts_utc));
    payload.insert("reason".into(), json!(reason));
    if let Some(parent) = parent_evidence_id {
        payload.insert("parent_evidence_id".into(), json!(parent));
    }
    if let Some(source) = source_record_type {
        payload.insert("source_record_type".into(), json!(source));
    }
    let hash = sha256_canonical(&Value::Object(payload.clone()))?;
    payload.insert("payload_hash".into(), json!(hash));
    Ok(Value::Object(payload))
}

/// Persist an unavailable marker with a capture-order id. Returns the id.
pub fn persist_unavailable_record(
    metadata: &ImmutableMetadataStore,
    run_id: &str,
    seq: u64,
    ts_utc: &str,
    reason: &str,
    parent_evidence_id: Option<&str>,
    source_record_type: Option<&str>,
) -> Result<String, EvidenceError> {
    let record_id = prefixed_id(run_id, "capture.unavailable", seq);
    let payload =
        build_unavailable_record(run_id, ts_utc, reason, parent_evidence_id, source_record_type)?;
    metadata.put_new(&record_id, &payload)?;
    Ok(record_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Value {
        json!({
            "record_type": "evidence.capture.frame",
            "schema_version": 1,
            "run_id": "run1",
            "ts_utc": "2026-01-02T00:00:00Z",
            "payload_hash": "abc",
        })
    }

    #[test]
    fn text_record_is_normalized_and_hashed() {
        let config = json!({});
        let record = build_text_record(
            "ocr",
            "  hello \n world ",
            "run1/capture.frame/1",
            &source(),
            "ocr.basic",
            &config,
            Some("2026-01-02T00:00:01Z"),
        )
        .unwrap()
        .unwrap();
        assert_eq!(record["record_type"], json!("derived.text.ocr"));
        assert_eq!(record["text"], json!("hello world"));
        assert_eq!(record["text_norm_version"], json!(TEXT_NORM_VERSION));
        assert_eq!(record["content_hash"], json!(sha256_text("hello world")));
        assert_eq!(record["text_raw"], json!("  hello \n world "));
        assert!(record.get("payload_hash").is_some());
        assert_eq!(record["span_ref"]["kind"], json!("time"));
    }

    #[test]
    fn empty_text_yields_none() {
        let record = build_text_record(
            "ocr",
            "   ",
            "run1/capture.frame/1",
            &source(),
            "ocr.basic",
            &json!({}),
            None,
        )
        .unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn edge_ids_are_deterministic_and_path_safe() {
        let id = derivation_edge_id("run1", "run1/capture.frame/1", "run1/derived.text.ocr/2");
        let again = derivation_edge_id("run1", "run1/capture.frame/1", "run1/derived.text.ocr/2");
        assert_eq!(id, again);
        // run prefix + kind + two encoded components
        assert_eq!(id.split('/').count(), 4);
    }

    #[test]
    fn unavailable_record_hash_excludes_itself() {
        let record =
            build_unavailable_record("run1", "2026-01-02T00:00:00Z", "screen_locked", None, None)
                .unwrap();
        let mut without = record.as_object().unwrap().clone();
        without.remove("payload_hash");
        let expected = sha256_canonical(&Value::Object(without)).unwrap();
        assert_eq!(record["payload_hash"], json!(expected));
    }
}
