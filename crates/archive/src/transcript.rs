//! Hash-chained export of ChatGPT-related capture segments.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use canonical::{parse_ts_utc, sha256_text, to_canonical_string};
use evidence::ImmutableMetadataStore;
use ledger::read_journal;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::ArchiveError;

fn re_chatgpt() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(chatgpt|openai)").expect("static regex"))
}

fn re_edge() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)msedge").expect("static regex"))
}

/// Egress leak check applied to exported text. A failing check never stops
/// the export; the row's content is replaced with an export notice instead
/// of leaking.
pub trait Sanitizer: Send + Sync {
    fn check(&self, text: &str) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct TranscriptExportReport {
    pub output_path: PathBuf,
    pub segments: usize,
    pub rows_written: usize,
    pub sanitized_rows: usize,
    pub head_hash: Option<String>,
}

/// Resolve the export root: `KERNEL_AUTOCAPTURE_EXPORT_ROOT` wins,
/// otherwise `{data_dir}/exports`.
pub fn export_root(data_dir: &Path) -> PathBuf {
    match std::env::var("KERNEL_AUTOCAPTURE_EXPORT_ROOT") {
        Ok(root) if !root.trim().is_empty() => PathBuf::from(root.trim()),
        _ => data_dir.join("exports"),
    }
}

fn segment_matches_chatgpt(payload: &Value) -> bool {
    let haystacks = [
        payload.get("window_title"),
        payload.get("app_hint"),
        payload.get("process_name"),
        payload
            .get("window_ref")
            .and_then(|w| w.get("title")),
    ];
    let mut edge_seen = false;
    for text in haystacks.into_iter().flatten().filter_map(Value::as_str) {
        if re_chatgpt().is_match(text) {
            return true;
        }
        if re_edge().is_match(text) {
            edge_seen = true;
        }
    }
    edge_seen
}

/// Scan the journal for `capture.segment` events, select ChatGPT/Edge
/// segments, attach derived text, and append hash-chained rows to
/// `chatgpt_transcripts.ndjson` under the export root.
pub fn export_chatgpt_transcripts(
    data_dir: &Path,
    metadata: &ImmutableMetadataStore,
    since_ts: Option<&str>,
    max_segments: Option<usize>,
    sanitizer: Option<&dyn Sanitizer>,
) -> Result<TranscriptExportReport, ArchiveError> {
    let journal_path = data_dir.join("journal.ndjson");
    let since = since_ts.and_then(parse_ts_utc);

    let mut segments: Vec<(String, Value)> = Vec::new();
    for row in read_journal(&journal_path)? {
        if row.get("event_type").and_then(Value::as_str) != Some("capture.segment") {
            continue;
        }
        let Some(payload) = row.get("payload").filter(|p| p.is_object()) else {
            continue;
        };
        let segment_id = payload
            .get("segment_id")
            .or_else(|| row.get("event_id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if segment_id.is_empty() {
            continue;
        }
        let segment_ts = payload
            .get("ts_utc")
            .or_else(|| payload.get("ts_start_utc"))
            .or_else(|| payload.get("ts_end_utc"))
            .or_else(|| row.get("ts_utc"))
            .and_then(Value::as_str)
            .and_then(parse_ts_utc);
        if let Some(since) = since {
            match segment_ts {
                Some(ts) if ts >= since => {}
                _ => continue,
            }
        }
        if !segment_matches_chatgpt(payload) {
            continue;
        }
        segments.push((segment_id, payload.clone()));
        if let Some(max) = max_segments {
            if segments.len() >= max {
                break;
            }
        }
    }

    // Attach derived text whose source is the segment.
    let mut text_by_source: std::collections::BTreeMap<String, Vec<String>> = Default::default();
    if !segments.is_empty() {
        for record_id in metadata.keys()? {
            let Some(record) = metadata.get(&record_id)? else {
                continue;
            };
            let record_type = record
                .get("record_type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !record_type.starts_with("derived.text") && !record_type.starts_with("derived.sst.text")
            {
                continue;
            }
            let Some(source_id) = record.get("source_id").and_then(Value::as_str) else {
                continue;
            };
            let Some(text) = record.get("text").and_then(Value::as_str) else {
                continue;
            };
            if !text.trim().is_empty() {
                text_by_source
                    .entry(source_id.to_string())
                    .or_default()
                    .push(text.trim().to_string());
            }
        }
    }

    let out_dir = export_root(data_dir);
    fs::create_dir_all(&out_dir)?;
    let output_path = out_dir.join("chatgpt_transcripts.ndjson");

    // The chain continues from the existing export file's head.
    let mut prev_hash: Option<String> = None;
    if output_path.exists() {
        for line in fs::read_to_string(&output_path)?.lines() {
            if let Ok(row) = serde_json::from_str::<Value>(line) {
                if let Some(hash) = row.get("row_hash").and_then(Value::as_str) {
                    prev_hash = Some(hash.to_string());
                }
            }
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(&output_path)?;
    let mut rows_written = 0usize;
    let mut sanitized_rows = 0usize;
    for (segment_id, payload) in &segments {
        let texts = text_by_source.get(segment_id).cloned().unwrap_or_default();
        let mut row = Map::new();
        row.insert("schema_version".into(), json!(1));
        row.insert("segment_id".into(), json!(segment_id));
        // Leak check before anything leaves the store surface.
        let leak = sanitizer.and_then(|s| {
            let combined = format!("{} {}", payload, texts.join(" "));
            s.check(&combined).err()
        });
        match leak {
            Some(reason) => {
                row.insert("segment".into(), json!({}));
                row.insert("texts".into(), json!([]));
                row.insert("export_notice".into(), json!(reason));
                sanitized_rows += 1;
            }
            None => {
                row.insert("segment".into(), payload.clone());
                row.insert("texts".into(), json!(texts));
            }
        }
        row.insert(
            "prev_hash".into(),
            prev_hash.clone().map(Value::String).unwrap_or(Value::Null),
        );
        let canonical_row = to_canonical_string(&Value::Object(row.clone()))?;
        let row_hash = sha256_text(&format!(
            "{canonical_row}{}",
            prev_hash.as_deref().unwrap_or("")
        ));
        row.insert("row_hash".into(), json!(row_hash));
        file.write_all(to_canonical_string(&Value::Object(row))?.as_bytes())?;
        file.write_all(b"\n")?;
        prev_hash = Some(row_hash);
        rows_written += 1;
    }
    file.sync_all()?;
    info!(path = %output_path.display(), rows_written, "transcript export complete");

    Ok(TranscriptExportReport {
        output_path,
        segments: segments.len(),
        rows_written,
        sanitized_rows,
        head_hash: prev_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger::JournalWriter;
    use std::sync::Arc;
    use storage::MemoryStore;
    use tempfile::TempDir;

    fn seed_journal(dir: &TempDir) {
        let journal = JournalWriter::open(dir.path().join("journal.ndjson")).unwrap();
        for (n, title, ts) in [
            (1, "ChatGPT - Work chat", "2026-01-02T10:00:00Z"),
            (2, "Spreadsheet - msedge", "2026-01-02T11:00:00Z"),
            (3, "Terminal", "2026-01-02T12:00:00Z"),
        ] {
            journal
                .append_event(
                    "run1",
                    "capture.segment",
                    &json!({
                        "segment_id": format!("run1/capture.segment/{n}"),
                        "window_title": title,
                        "ts_utc": ts,
                    }),
                    None,
                    Some(ts),
                )
                .unwrap();
        }
    }

    fn metadata_with_text() -> ImmutableMetadataStore {
        let store = ImmutableMetadataStore::new(Arc::new(MemoryStore::new()));
        let record = json!({
            "record_type": "derived.text.ocr",
            "schema_version": 1,
            "run_id": "run1",
            "ts_utc": "2026-01-02T10:00:01Z",
            "source_id": "run1/capture.segment/1",
            "content_hash": "x",
            "text": "hello from chatgpt",
        });
        store.put_new("run1/derived.text.ocr/1", &record).unwrap();
        store
    }

    #[test]
    fn exports_matching_segments_with_chained_hashes() {
        let dir = TempDir::new().unwrap();
        seed_journal(&dir);
        let metadata = metadata_with_text();
        let report =
            export_chatgpt_transcripts(dir.path(), &metadata, None, None, None).unwrap();
        // The ChatGPT window and the Edge window match; the terminal does not.
        assert_eq!(report.segments, 2);
        assert_eq!(report.rows_written, 2);

        let text = fs::read_to_string(&report.output_path).unwrap();
        let rows: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(rows[0]["prev_hash"].is_null());
        assert_eq!(rows[1]["prev_hash"], rows[0]["row_hash"]);
        assert_eq!(rows[0]["texts"], json!(["hello from chatgpt"]));
        assert_eq!(report.head_hash.as_deref(), rows[1]["row_hash"].as_str());
    }

    #[test]
    fn since_filter_and_cap_apply() {
        let dir = TempDir::new().unwrap();
        seed_journal(&dir);
        let metadata = ImmutableMetadataStore::new(Arc::new(MemoryStore::new()));
        let report = export_chatgpt_transcripts(
            dir.path(),
            &metadata,
            Some("2026-01-02T10:30:00Z"),
            Some(1),
            None,
        )
        .unwrap();
        assert_eq!(report.segments, 1);
    }

    struct DenyAll;

    impl Sanitizer for DenyAll {
        fn check(&self, _text: &str) -> Result<(), String> {
            Err("leak_check_failed".to_string())
        }
    }

    #[test]
    fn failed_leak_check_replaces_content_with_notice() {
        let dir = TempDir::new().unwrap();
        seed_journal(&dir);
        let metadata = metadata_with_text();
        let report =
            export_chatgpt_transcripts(dir.path(), &metadata, None, None, Some(&DenyAll as &dyn Sanitizer))
                .unwrap();
        assert_eq!(report.sanitized_rows, report.rows_written);

        let text = fs::read_to_string(&report.output_path).unwrap();
        for line in text.lines() {
            let row: Value = serde_json::from_str(line).unwrap();
            assert_eq!(row["segment"], json!({}));
            assert_eq!(row["texts"], json!([]));
            assert_eq!(row["export_notice"], json!("leak_check_failed"));
            assert!(!line.contains("hello from chatgpt"));
        }
    }

    #[test]
    fn chain_continues_across_exports() {
        let dir = TempDir::new().unwrap();
        seed_journal(&dir);
        let metadata = ImmutableMetadataStore::new(Arc::new(MemoryStore::new()));
        let first = export_chatgpt_transcripts(dir.path(), &metadata, None, Some(1), None).unwrap();
        let second = export_chatgpt_transcripts(dir.path(), &metadata, None, Some(1), None).unwrap();
        let text = fs::read_to_string(&second.output_path).unwrap();
        let rows: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["prev_hash"].as_str(), first.head_hash.as_deref());
    }
}
