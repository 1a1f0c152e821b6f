//! Persistence of derived SST artifacts with provenance envelopes.

use std::sync::Arc;

use canonical::{encode_component, sha256_canonical, sha256_text};
use chrono::{DateTime, SecondsFormat, Utc};
use evidence::ImmutableMetadataStore;
use ledger::EventBuilder;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::SstError;
use crate::types::{ActionEvent, DeltaEvent, ScreenState};
use crate::util::BBox;

/// Full-text index callback; receives every persisted text doc.
pub type IndexTextFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub derived_records: u64,
    pub indexed_docs: u64,
    pub derived_ids: Vec<String>,
}

/// Writes derived records through the metadata gate, emits journal/ledger
/// events for each insert, and feeds text docs to the index callback.
pub struct SstPersistence {
    metadata: ImmutableMetadataStore,
    events: Option<Arc<EventBuilder>>,
    index_text: Option<IndexTextFn>,
    extractor: Value,
    schema_version: u64,
}

impl SstPersistence {
    pub fn new(
        metadata: ImmutableMetadataStore,
        events: Option<Arc<EventBuilder>>,
        index_text: Option<IndexTextFn>,
        extractor_id: &str,
        extractor_version: &str,
        config_hash: &str,
        schema_version: u64,
    ) -> Self {
        Self {
            metadata,
            events,
            index_text,
            extractor: json!({
                "id": extractor_id,
                "version": extractor_version,
                "config_hash": config_hash,
            }),
            schema_version,
        }
    }

    /// Always-emitted per-frame trace record.
    #[allow(clippy::too_many_arguments)]
    pub fn persist_frame(
        &self,
        run_id: &str,
        record_id: &str,
        ts_ms: i64,
        width: i64,
        height: i64,
        image_sha256: &str,
        phash: &str,
        boundary: bool,
        boundary_reason: &str,
        phash_distance: usize,
        diff_score_bp: i64,
    ) -> Result<PersistStats, SstError> {
        let derived_id = format!(
            "{run_id}/derived.sst.frame/{}",
            encode_component(record_id)
        );
        let payload = self.envelope(
            &derived_id,
            "FrameTrace",
            ts_ms,
            record_id,
            &[],
            &[(0, 0, width, height)],
            image_sha256,
            10_000,
            json!({
                "record_type": "derived.sst.frame",
                "frame_id": record_id,
                "width": width,
                "height": height,
                "phash": phash,
                "state_boundary": boundary,
                "boundary_reason": boundary_reason,
                "phash_distance": phash_distance,
                "diff_score_bp": diff_score_bp,
            }),
        )?;
        let created = self.put_new(&derived_id, &payload)?;
        if created {
            self.emit_event("sst.frame", &payload, &[record_id.to_string()], &[derived_id.clone()])?;
        }
        Ok(PersistStats {
            derived_records: u64::from(created),
            indexed_docs: 0,
            derived_ids: if created { vec![derived_id] } else { Vec::new() },
        })
    }

    /// Persist the state envelope plus text docs, delta, and action.
    #[allow(clippy::too_many_arguments)]
    pub fn persist_state_bundle(
        &self,
        run_id: &str,
        record_id: &str,
        state: &ScreenState,
        image_sha256: &str,
        frame_bbox: BBox,
        prev_record_id: Option<&str>,
        delta_event: Option<&DeltaEvent>,
        action_event: Option<&ActionEvent>,
    ) -> Result<PersistStats, SstError> {
        let mut stats = PersistStats::default();
        let state_id = state.state_id.clone();
        let screen_state = serde_json::to_value(state)?;

        let state_record_id = format!(
            "{run_id}/derived.sst.state/rid_{}",
            sha256_text(record_id)
        );
        let state_payload = self.envelope(
            &state_record_id,
            "ScreenState",
            state.ts_ms,
            record_id,
            &[state_id.clone()],
            &[frame_bbox],
            image_sha256,
            state.state_confidence_bp,
            json!({
                "record_type": "derived.sst.state",
                "state_id": state_id,
                "frame_id": state.frame_id,
                "phash": state.phash,
                "screen_state": screen_state,
                "summary": {
                    "visible_apps": state.visible_apps,
                    "focus_element_id": state.focus_element_id,
                    "token_count": state.tokens.len(),
                    "table_count": state.tables.len(),
                    "spreadsheet_count": state.spreadsheets.len(),
                    "code_count": state.code_blocks.len(),
                    "chart_count": state.charts.len(),
                },
            }),
        )?;
        if self.put_new(&state_record_id, &state_payload)? {
            stats.derived_records += 1;
            stats.derived_ids.push(state_record_id.clone());
            self.emit_event(
                "sst.state",
                &state_payload,
                &[record_id.to_string()],
                &[state_record_id.clone()],
            )?;
        }

        for (doc_id, doc_text, meta) in state_docs(run_id, state) {
            let doc_payload = self.envelope(
                &doc_id,
                "TextDoc",
                state.ts_ms,
                record_id,
                &[state_id.clone()],
                &[frame_bbox],
                image_sha256,
                state.state_confidence_bp,
                merge(
                    json!({
                        "record_type": "derived.sst.text",
                        "state_id": state_id,
                        "text": doc_text,
                    }),
                    meta,
                ),
            )?;
            if self.put_new(&doc_id, &doc_payload)? {
                stats.derived_records += 1;
                stats.derived_ids.push(doc_id.clone());
            }
            if let Some(index) = &self.index_text {
                index(&doc_id, &doc_text);
            }
            stats.indexed_docs += 1;
        }

        if let Some(delta) = delta_event {
            let delta_record_id = format!(
                "{run_id}/derived.sst.delta/{}",
                encode_component(&delta.delta_id)
            );
            let delta_payload = self.envelope(
                &delta_record_id,
                "DeltaEvent",
                delta.ts_ms,
                record_id,
                &[delta.from_state_id.clone(), delta.to_state_id.clone()],
                &[frame_bbox],
                image_sha256,
                9000,
                json!({
                    "record_type": "derived.sst.delta",
                    "delta_id": delta.delta_id,
                    "from_state_id": delta.from_state_id,
                    "to_state_id": delta.to_state_id,
                    "delta_event": serde_json::to_value(delta)?,
                    "summary": delta.summary,
                    "change_count": delta.changes.len(),
                }),
            )?;
            if self.put_new(&delta_record_id, &delta_payload)? {
                stats.derived_records += 1;
                stats.derived_ids.push(delta_record_id.clone());
                let inputs: Vec<String> = prev_record_id
                    .into_iter()
                    .chain(std::iter::once(record_id))
                    .map(str::to_string)
                    .collect();
                self.emit_event("sst.delta", &delta_payload, &inputs, &[delta_record_id])?;
            }
        }

        if let Some(action) = action_event {
            let action_record_id = format!(
                "{run_id}/derived.sst.action/{}",
                encode_component(&action.action_id)
            );
            let action_payload = self.envelope(
                &action_record_id,
                "ActionEvent",
                action.ts_ms,
                record_id,
                &[action.from_state_id.clone(), action.to_state_id.clone()],
                &[frame_bbox],
                image_sha256,
                action.primary.confidence_bp,
                json!({
                    "record_type": "derived.sst.action",
                    "action_id": action.action_id,
                    "from_state_id": action.from_state_id,
                    "to_state_id": action.to_state_id,
                    "primary": serde_json::to_value(&action.primary)?,
                    "alternatives": serde_json::to_value(&action.alternatives)?,
                    "impact": serde_json::to_value(&action.impact)?,
                }),
            )?;
            if self.put_new(&action_record_id, &action_payload)? {
                stats.derived_records += 1;
                stats.derived_ids.push(action_record_id.clone());
                self.emit_event(
                    "sst.action",
                    &action_payload,
                    &[record_id.to_string()],
                    &[action_record_id],
                )?;
            }
        }

        Ok(stats)
    }

    /// Wrap a payload in the common derived-record envelope: identity,
    /// extractor, provenance, and content/payload hashes.
    #[allow(clippy::too_many_arguments)]
    fn envelope(
        &self,
        artifact_id: &str,
        kind: &str,
        ts_ms: i64,
        record_id: &str,
        state_ids: &[String],
        bboxes: &[BBox],
        image_sha256: &str,
        confidence_bp: i64,
        payload: Value,
    ) -> Result<Value, SstError> {
        let run_id = canonical::run_id_of(artifact_id).to_string();
        let ts_utc = DateTime::<Utc>::from_timestamp_millis(ts_ms)
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut envelope: Map<String, Value> = payload
            .as_object()
            .cloned()
            .unwrap_or_default();
        envelope.insert("run_id".into(), json!(run_id));
        envelope.insert("artifact_id".into(), json!(artifact_id));
        envelope.insert("kind".into(), json!(kind));
        envelope.insert("schema_version".into(), json!(self.schema_version));
        envelope.insert("created_ts_ms".into(), json!(ts_ms));
        if !envelope.contains_key("ts_utc") {
            envelope.insert("ts_utc".into(), json!(ts_utc));
        }
        envelope.insert("extractor".into(), self.extractor.clone());
        envelope.insert(
            "provenance".into(),
            json!({
                "frame_ids": [record_id],
                "state_ids": state_ids,
                "bboxes": bboxes.iter().map(|b| json!([b.0, b.1, b.2, b.3])).collect::<Vec<_>>(),
                "input_image_sha256": [image_sha256],
            }),
        );
        envelope.insert("confidence_bp".into(), json!(confidence_bp));
        if !envelope.contains_key("source_id") {
            envelope.insert("source_id".into(), json!(record_id));
        }
        if !envelope.contains_key("content_hash") {
            let hash = sha256_canonical(&Value::Object(envelope.clone()))?;
            envelope.insert("content_hash".into(), json!(hash));
        }
        let payload_hash = sha256_canonical(&Value::Object(envelope.clone()))?;
        envelope.insert("payload_hash".into(), json!(payload_hash));
        Ok(Value::Object(envelope))
    }

    fn put_new(&self, record_id: &str, payload: &Value) -> Result<bool, SstError> {
        if self.metadata.get(record_id)?.is_some() {
            debug!(record_id, "derived record already present");
            return Ok(false);
        }
        match self.metadata.put_new(record_id, payload) {
            Ok(()) => Ok(true),
            Err(evidence::EvidenceError::Conflict(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn emit_event(
        &self,
        event_type: &str,
        payload: &Value,
        inputs: &[String],
        outputs: &[String],
    ) -> Result<(), SstError> {
        let Some(events) = &self.events else {
            return Ok(());
        };
        let artifact_id = payload
            .get("artifact_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        events.journal_event(event_type, payload, Some(artifact_id), None)?;
        events.ledger_entry(
            event_type,
            inputs,
            outputs,
            Some(payload),
            Some(artifact_id),
            None,
        )?;
        Ok(())
    }
}

fn merge(base: Value, extra: Value) -> Value {
    let mut map = base.as_object().cloned().unwrap_or_default();
    if let Some(extra) = extra.as_object() {
        for (key, value) in extra {
            map.insert(key.clone(), value.clone());
        }
    }
    Value::Object(map)
}

/// Text docs derived from a state: the whole-state doc plus one per table
/// and per code block.
fn state_docs(run_id: &str, state: &ScreenState) -> Vec<(String, String, Value)> {
    let mut docs = Vec::new();
    let state_component = encode_component(&state.state_id);

    let mut full_parts: Vec<&str> = Vec::new();
    for block in &state.text_blocks {
        if !block.text.trim().is_empty() {
            full_parts.push(block.text.trim());
        }
    }
    for table in &state.tables {
        if !table.csv.trim().is_empty() {
            full_parts.push(table.csv.trim());
        }
    }
    for code in &state.code_blocks {
        if !code.text.trim().is_empty() {
            full_parts.push(code.text.trim());
        }
    }
    let full_text = full_parts.join("\n").trim().to_string();
    if !full_text.is_empty() {
        docs.push((
            format!("{run_id}/derived.sst.text/state/{state_component}"),
            full_text,
            json!({"doc_kind": "state"}),
        ));
    }

    for table in &state.tables {
        let text = table
            .cells
            .iter()
            .map(|c| format!("R{}C{}: {}", c.r, c.c, c.text))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
        if text.is_empty() {
            continue;
        }
        docs.push((
            format!(
                "{run_id}/derived.sst.text/table/{}",
                encode_component(&table.table_id)
            ),
            text,
            json!({"doc_kind": "table", "table_id": table.table_id}),
        ));
    }

    for code in &state.code_blocks {
        let text = code.text.trim().to_string();
        if text.is_empty() {
            continue;
        }
        docs.push((
            format!(
                "{run_id}/derived.sst.text/code/{}",
                encode_component(&code.code_id)
            ),
            text,
            json!({"doc_kind": "code", "code_id": code.code_id, "language": code.language}),
        ));
    }
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElementGraph, TokenFlags};
    use std::sync::Arc as StdArc;
    use std::sync::Mutex;
    use storage::MemoryStore;

    fn persistence(metadata: ImmutableMetadataStore, index_log: StdArc<Mutex<Vec<String>>>) -> SstPersistence {
        let log = index_log;
        SstPersistence::new(
            metadata,
            None,
            Some(Arc::new(move |doc_id: &str, _text: &str| {
                log.lock().unwrap().push(doc_id.to_string());
            })),
            "sst.core",
            "1.0.0",
            "cfg-hash",
            1,
        )
    }

    fn sample_state() -> ScreenState {
        ScreenState {
            state_id: "rid_state1".to_string(),
            frame_id: "run1/capture.frame/1".to_string(),
            frame_index: 0,
            ts_ms: 1_700_000_000_000,
            phash: "0".repeat(64),
            image_sha256: "imgsha".to_string(),
            width: 640,
            height: 480,
            tokens: vec![crate::types::Token {
                token_id: "t1".to_string(),
                text: "hello".to_string(),
                norm_text: "hello".to_string(),
                bbox: (0, 0, 50, 20),
                confidence_bp: 9000,
                source: "ocr".to_string(),
                flags: TokenFlags {
                    monospace_likely: false,
                    is_number: false,
                },
                provider_id: "p".to_string(),
                patch_id: "full_frame".to_string(),
                line_id: Some("line-0000".to_string()),
                block_id: Some("block-0000".to_string()),
            }],
            element_graph: ElementGraph {
                state_id: "rid_state1".to_string(),
                elements: Vec::new(),
                edges: Vec::new(),
            },
            text_lines: Vec::new(),
            text_blocks: vec![crate::types::TextBlock {
                block_id: "block-0000".to_string(),
                line_ids: vec!["line-0000".to_string()],
                bbox: (0, 0, 50, 20),
                text: "hello".to_string(),
            }],
            tables: Vec::new(),
            spreadsheets: Vec::new(),
            code_blocks: Vec::new(),
            charts: Vec::new(),
            cursor: None,
            visible_apps: vec!["editor".to_string()],
            focus_element_id: None,
            state_confidence_bp: 9000,
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn frame_persist_is_idempotent() {
        let metadata = ImmutableMetadataStore::new(StdArc::new(MemoryStore::new()));
        let log = StdArc::new(Mutex::new(Vec::new()));
        let persist = persistence(metadata.clone(), log);
        let first = persist
            .persist_frame(
                "run1",
                "run1/capture.frame/1",
                1_700_000_000_000,
                640,
                480,
                "imgsha",
                &"0".repeat(64),
                true,
                "first_frame",
                64,
                10_000,
            )
            .unwrap();
        assert_eq!(first.derived_records, 1);
        let record = metadata.get(&first.derived_ids[0]).unwrap().unwrap();
        assert_eq!(record["kind"], json!("FrameTrace"));
        assert_eq!(record["extractor"]["id"], json!("sst.core"));
        assert_eq!(record["provenance"]["frame_ids"], json!(["run1/capture.frame/1"]));
        assert!(record.get("payload_hash").is_some());

        let second = persist
            .persist_frame(
                "run1",
                "run1/capture.frame/1",
                1_700_000_000_000,
                640,
                480,
                "imgsha",
                &"0".repeat(64),
                true,
                "first_frame",
                64,
                10_000,
            )
            .unwrap();
        assert_eq!(second.derived_records, 0);
    }

    #[test]
    fn state_bundle_writes_state_and_text_docs() {
        let metadata = ImmutableMetadataStore::new(StdArc::new(MemoryStore::new()));
        let log = StdArc::new(Mutex::new(Vec::new()));
        let persist = persistence(metadata.clone(), log.clone());
        let state = sample_state();
        let stats = persist
            .persist_state_bundle(
                "run1",
                "run1/capture.frame/1",
                &state,
                "imgsha",
                (0, 0, 640, 480),
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(stats.derived_records, 2);
        assert_eq!(stats.indexed_docs, 1);
        assert_eq!(log.lock().unwrap().len(), 1);
        let state_record = metadata.get(&stats.derived_ids[0]).unwrap().unwrap();
        assert_eq!(state_record["record_type"], json!("derived.sst.state"));
        assert_eq!(state_record["summary"]["token_count"], json!(1));
        let doc_record = metadata.get(&stats.derived_ids[1]).unwrap().unwrap();
        assert_eq!(doc_record["doc_kind"], json!("state"));
        assert_eq!(doc_record["text"], json!("hello"));
    }

    #[test]
    fn identical_bundles_are_byte_identical() {
        let metadata_a = ImmutableMetadataStore::new(StdArc::new(MemoryStore::new()));
        let metadata_b = ImmutableMetadataStore::new(StdArc::new(MemoryStore::new()));
        let log = StdArc::new(Mutex::new(Vec::new()));
        let pa = persistence(metadata_a.clone(), log.clone());
        let pb = persistence(metadata_b.clone(), log);
        let state = sample_state();
        let sa = pa
            .persist_state_bundle("run1", "run1/capture.frame/1", &state, "imgsha", (0, 0, 640, 480), None, None, None)
            .unwrap();
        let sb = pb
            .persist_state_bundle("run1", "run1/capture.frame/1", &state, "imgsha", (0, 0, 640, 480), None, None, None)
            .unwrap();
        assert_eq!(sa.derived_ids, sb.derived_ids);
        for id in &sa.derived_ids {
            let ra = metadata_a.get(id).unwrap().unwrap();
            let rb = metadata_b.get(id).unwrap().unwrap();
            assert_eq!(
                canonical::to_canonical_string(&ra).unwrap(),
                canonical::to_canonical_string(&rb).unwrap()
            );
        }
    }
}
