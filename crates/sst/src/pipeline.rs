//! Pipeline orchestrator.

use std::collections::HashMap;
use std::io::Cursor as IoCursor;
use std::sync::Mutex;

use canonical::ts_utc_to_ms;
use image::DynamicImage;
use serde_json::Value;
use tracing::debug;

use crate::action::infer_action;
use crate::compliance::redact_artifacts;
use crate::config::{config_hash, SstConfig};
use crate::delta::build_delta;
use crate::elements::{parse_ui_elements, track_cursor};
use crate::extract::{extract_charts, extract_code_blocks, extract_spreadsheets, extract_tables};
use crate::frame::{normalize_image, tile_image, NormalizedImage};
use crate::layout::assemble_layout;
use crate::matching::match_ids;
use crate::ocr::{run_ocr_tokens, vlm_tokens};
use crate::persist::{PersistStats, SstPersistence};
use crate::providers::{ExtractorRegistry, RunLimits};
use crate::segment::{decide_boundary, SegmentDecision};
use crate::state::build_state;
use crate::types::{Cursor, Diagnostic, ScreenState, Token};

#[derive(Debug, Clone)]
pub struct SstPipelineResult {
    pub record_id: String,
    pub boundary: bool,
    pub boundary_reason: String,
    pub heavy_ran: bool,
    pub derived_records: u64,
    pub indexed_docs: u64,
    pub ocr_tokens: usize,
    pub derived_ids: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

struct PrevContext {
    record_id: String,
    phash: String,
    downscaled: Vec<u8>,
    frame_index: i64,
    state: Option<ScreenState>,
    cursor: Option<Cursor>,
}

/// Deterministic vision-only screen semantic trace pipeline.
///
/// One instance per process; per-run previous-frame context is tracked
/// internally so concurrent runs do not interfere.
pub struct SstPipeline {
    config: SstConfig,
    config_hash: String,
    ocr: ExtractorRegistry,
    vlm: Option<ExtractorRegistry>,
    persistence: SstPersistence,
    prev_by_run: Mutex<HashMap<String, PrevContext>>,
}

impl SstPipeline {
    pub fn new(
        config: SstConfig,
        ocr: ExtractorRegistry,
        vlm: Option<ExtractorRegistry>,
        persistence: SstPersistence,
    ) -> Self {
        let config_hash = config_hash(&config);
        Self {
            config,
            config_hash,
            ocr,
            vlm,
            persistence,
            prev_by_run: Mutex::new(HashMap::new()),
        }
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// Process one captured frame end to end.
    pub fn process_record(
        &self,
        record_id: &str,
        record: &Value,
        frame_bytes: &[u8],
        allow_ocr: bool,
        allow_vlm: bool,
        limits: &RunLimits,
    ) -> SstPipelineResult {
        let mut diagnostics = Vec::new();
        if !self.config.enabled {
            diagnostics.push(Diagnostic::new("sst.disabled"));
            return result(record_id, false, "disabled", false, 0, 0, 0, Vec::new(), diagnostics);
        }

        let run_id = run_id_of(record_id);
        let ts_ms = record
            .get("ts_utc")
            .or_else(|| record.get("ts_start_utc"))
            .and_then(Value::as_str)
            .and_then(ts_utc_to_ms)
            .unwrap_or(0);
        let window_title = window_title(record);

        let normalized = match normalize_image(
            frame_bytes,
            self.config.strip_alpha,
            self.config.phash_size,
            self.config.phash_downscale,
        ) {
            Ok(normalized) => normalized,
            Err(err) => {
                diagnostics.push(Diagnostic::with_detail("sst.normalize_error", err.to_string()));
                return result(
                    record_id,
                    false,
                    "normalize_error",
                    false,
                    0,
                    0,
                    0,
                    Vec::new(),
                    diagnostics,
                );
            }
        };

        let mut prev_by_run = self.prev_by_run.lock().expect("pipeline lock");
        let prev_ctx = prev_by_run.remove(&run_id);
        drop(prev_by_run);

        let (decision, downscaled) = decide_boundary(
            &normalized.phash,
            prev_ctx.as_ref().map(|c| c.phash.as_str()),
            &normalized.rgb,
            prev_ctx.as_ref().map(|c| c.downscaled.as_slice()),
            self.config.d_stable,
            self.config.d_boundary,
            self.config.diff_threshold_bp,
            self.config.segment_downscale_px,
        );

        let frame_index = prev_ctx.as_ref().map(|c| c.frame_index + 1).unwrap_or(0);
        let mut derived_records = 0u64;
        let mut indexed_docs = 0u64;
        let mut ocr_token_count = 0usize;
        let mut derived_ids = Vec::new();

        match self.persistence.persist_frame(
            &run_id,
            record_id,
            ts_ms,
            normalized.width,
            normalized.height,
            &normalized.image_sha256,
            &normalized.phash,
            decision.boundary,
            &decision.reason,
            decision.phash_distance,
            decision.diff_score_bp,
        ) {
            Ok(stats) => {
                derived_records += stats.derived_records;
                derived_ids.extend(stats.derived_ids);
            }
            Err(err) => {
                diagnostics.push(Diagnostic::with_detail("sst.persist_frame_error", err.to_string()))
            }
        }

        let mut heavy_ran = false;
        let mut next_state = prev_ctx.as_ref().and_then(|c| c.state.clone());
        let mut next_cursor = prev_ctx.as_ref().and_then(|c| c.cursor.clone());
        if self.should_heavy(&decision, limits) {
            heavy_ran = true;
            match self.heavy_pass(
                &run_id,
                record_id,
                record,
                ts_ms,
                frame_index,
                window_title.as_deref(),
                &normalized,
                prev_ctx.as_ref(),
                allow_ocr,
                allow_vlm,
                limits,
            ) {
                Ok(outcome) => {
                    derived_records += outcome.stats.derived_records;
                    indexed_docs += outcome.stats.indexed_docs;
                    derived_ids.extend(outcome.stats.derived_ids);
                    ocr_token_count = outcome.ocr_tokens;
                    diagnostics.extend(outcome.diagnostics);
                    if let Some(state) = outcome.state {
                        next_state = Some(state);
                        next_cursor = outcome.cursor;
                    }
                }
                Err(err) => {
                    diagnostics.push(Diagnostic::with_detail("sst.heavy_error", err.to_string()))
                }
            }
        }

        let mut prev_by_run = self.prev_by_run.lock().expect("pipeline lock");
        prev_by_run.insert(
            run_id,
            PrevContext {
                record_id: record_id.to_string(),
                phash: normalized.phash.clone(),
                downscaled,
                frame_index,
                state: next_state,
                cursor: next_cursor,
            },
        );
        drop(prev_by_run);

        result(
            record_id,
            decision.boundary,
            &decision.reason,
            heavy_ran,
            derived_records,
            indexed_docs,
            ocr_token_count,
            derived_ids,
            diagnostics,
        )
    }

    fn should_heavy(&self, decision: &SegmentDecision, limits: &RunLimits) -> bool {
        if limits.aborted() || limits.past_deadline() {
            return false;
        }
        if self.config.heavy_always {
            return true;
        }
        self.config.heavy_on_boundary && decision.boundary
    }

    #[allow(clippy::too_many_arguments)]
    fn heavy_pass(
        &self,
        run_id: &str,
        record_id: &str,
        record: &Value,
        ts_ms: i64,
        frame_index: i64,
        window_title: Option<&str>,
        normalized: &NormalizedImage,
        prev_ctx: Option<&PrevContext>,
        allow_ocr: bool,
        allow_vlm: bool,
        limits: &RunLimits,
    ) -> Result<HeavyOutcome, crate::SstError> {
        let mut diagnostics = Vec::new();
        limits.check()?;

        let patches = tile_image(
            &normalized.rgb,
            self.config.tile_max_px,
            self.config.tile_overlap_px,
            self.config.tile_add_full_frame,
            None,
            self.config.focus_conf_bp,
            self.config.focus_padding_px,
            self.config.focus_max_patches,
            self.config.focus_cluster_gap_px,
        )?;

        let (mut tokens, ocr_diag) = run_ocr_tokens(
            &patches,
            &self.ocr,
            normalized.width,
            normalized.height,
            self.config.ocr_min_conf_bp,
            self.config.ocr_nms_iou_bp,
            self.config.ocr_max_tokens,
            self.config.ocr_max_patches,
            allow_ocr,
            limits,
        );
        diagnostics.extend(ocr_diag);
        limits.check()?;

        if allow_vlm {
            let frame_png = match patches.iter().find(|p| p.patch_id == "full_frame") {
                Some(full) => full.image_png.clone(),
                None => encode_png(&normalized.rgb)?,
            };
            tokens.extend(vlm_tokens(
                self.vlm.as_ref(),
                &frame_png,
                normalized.width,
                normalized.height,
                allow_vlm,
                limits,
            ));
        }
        let mut tokens = stable_tokens(tokens);
        let ocr_tokens = tokens.len();
        limits.check()?;

        let (text_lines, text_blocks) = assemble_layout(
            &mut tokens,
            self.config.layout_line_y_px,
            self.config.layout_block_gap_px,
            self.config.layout_align_tol_px,
        );
        let tables = extract_tables(
            &tokens,
            "pending",
            self.config.table_min_rows,
            self.config.table_min_cols,
            self.config.table_max_cells,
            self.config.table_row_gap_px,
            self.config.table_col_gap_px,
        );
        let spreadsheets =
            extract_spreadsheets(&tokens, &tables, "pending", self.config.sheet_header_scan_rows);
        let code_blocks =
            extract_code_blocks(&tokens, &text_lines, "pending", self.config.code_min_keywords);
        let charts = extract_charts(&tokens, "pending", self.config.chart_min_ticks);
        limits.check()?;

        let frame_bbox = (0, 0, normalized.width, normalized.height);
        let element_graph = parse_ui_elements(
            "pending",
            frame_bbox,
            &tokens,
            &text_blocks,
            &tables,
            &spreadsheets,
            &code_blocks,
            &charts,
        );
        let cursor = track_cursor(record, normalized.width, normalized.height);

        let state = build_state(
            run_id,
            record_id,
            frame_index,
            ts_ms,
            &normalized.phash,
            &normalized.image_sha256,
            normalized.width,
            normalized.height,
            tokens,
            element_graph,
            text_lines,
            text_blocks,
            tables,
            spreadsheets,
            code_blocks,
            charts,
            cursor.clone(),
            window_title,
        );
        let prev_state = prev_ctx.and_then(|c| c.state.as_ref());
        let state = match_ids(prev_state, state);
        let delta_event = build_delta(
            prev_state,
            &state,
            self.config.delta_bbox_shift_px,
            self.config.delta_table_match_iou_bp,
        );
        let action_event = infer_action(
            delta_event.as_ref(),
            prev_ctx.and_then(|c| c.cursor.as_ref()),
            cursor.as_ref(),
            prev_state,
            &state,
        );

        let (state, delta_event, action_event, metrics) = redact_artifacts(
            state,
            delta_event,
            action_event,
            self.config.redact_enabled,
            &self.config.redact_denylist,
        );
        diagnostics.push(Diagnostic::with_detail(
            "sst.compliance",
            format!("redactions={} dropped={}", metrics.redactions, metrics.dropped),
        ));
        let Some(state) = state else {
            diagnostics.push(Diagnostic::new("sst.dropped"));
            return Ok(HeavyOutcome {
                stats: PersistStats::default(),
                ocr_tokens,
                diagnostics,
                state: None,
                cursor,
            });
        };

        let stats = self.persistence.persist_state_bundle(
            run_id,
            record_id,
            &state,
            &normalized.image_sha256,
            frame_bbox,
            prev_ctx.map(|c| c.record_id.as_str()),
            delta_event.as_ref(),
            action_event.as_ref(),
        )?;
        debug!(
            record_id,
            derived = stats.derived_records,
            indexed = stats.indexed_docs,
            "persisted state bundle"
        );
        Ok(HeavyOutcome {
            stats,
            ocr_tokens,
            diagnostics,
            state: Some(state),
            cursor,
        })
    }
}

struct HeavyOutcome {
    stats: PersistStats,
    ocr_tokens: usize,
    diagnostics: Vec<Diagnostic>,
    state: Option<ScreenState>,
    cursor: Option<Cursor>,
}

#[allow(clippy::too_many_arguments)]
fn result(
    record_id: &str,
    boundary: bool,
    reason: &str,
    heavy_ran: bool,
    derived_records: u64,
    indexed_docs: u64,
    ocr_tokens: usize,
    derived_ids: Vec<String>,
    diagnostics: Vec<Diagnostic>,
) -> SstPipelineResult {
    SstPipelineResult {
        record_id: record_id.to_string(),
        boundary,
        boundary_reason: reason.to_string(),
        heavy_ran,
        derived_records,
        indexed_docs,
        ocr_tokens,
        derived_ids,
        diagnostics,
    }
}

fn run_id_of(record_id: &str) -> String {
    if record_id.contains('/') {
        canonical::run_id_of(record_id).to_string()
    } else {
        "run".to_string()
    }
}

fn window_title(record: &Value) -> Option<String> {
    for key in ["window_ref", "window"] {
        if let Some(window) = record.get(key) {
            for title_key in ["title", "window_title"] {
                if let Some(title) = window.get(title_key).and_then(Value::as_str) {
                    let trimmed = title.trim();
                    if !trimmed.is_empty() {
                        return Some(trimmed.to_string());
                    }
                }
            }
        }
    }
    None
}

fn stable_tokens(tokens: Vec<Token>) -> Vec<Token> {
    let mut tokens: Vec<Token> = tokens
        .into_iter()
        .filter(|t| !t.norm_text.is_empty())
        .collect();
    tokens.sort_by(|a, b| {
        (a.bbox.1, a.bbox.0, a.bbox.2, &a.token_id).cmp(&(b.bbox.1, b.bbox.0, b.bbox.2, &b.token_id))
    });
    let mut seen = std::collections::BTreeSet::new();
    tokens.retain(|t| seen.insert(t.token_id.clone()));
    tokens
}

fn encode_png(rgb: &image::RgbImage) -> Result<Vec<u8>, crate::SstError> {
    let mut png = Vec::new();
    DynamicImage::ImageRgb8(rgb.clone())
        .write_to(&mut IoCursor::new(&mut png), image::ImageOutputFormat::Png)
        .map_err(|e| crate::SstError::ImageDecode(e.to_string()))?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{RawToken, TextExtractor};
    use evidence::ImmutableMetadataStore;
    use serde_json::json;
    use std::sync::Arc;
    use storage::MemoryStore;

    struct ScriptedOcr;

    impl TextExtractor for ScriptedOcr {
        fn extract_tokens(&self, _png: &[u8]) -> Result<Vec<RawToken>, crate::SstError> {
            Ok(vec![
                RawToken {
                    text: "hello".to_string(),
                    bbox: Some((5, 5, 40, 18)),
                    confidence_bp: 9200,
                },
                RawToken {
                    text: "world".to_string(),
                    bbox: Some((50, 5, 90, 18)),
                    confidence_bp: 9100,
                },
            ])
        }
        fn extract_text(&self, _png: &[u8]) -> Result<String, crate::SstError> {
            Ok(String::new())
        }
    }

    fn pipeline(metadata: ImmutableMetadataStore) -> SstPipeline {
        let mut ocr = ExtractorRegistry::new();
        ocr.register("ocr.scripted", Arc::new(ScriptedOcr));
        let persistence =
            SstPersistence::new(metadata, None, None, "sst.core", "1.0.0", "cfg", 1);
        SstPipeline::new(SstConfig::default(), ocr, None, persistence)
    }

    fn frame_record(ts: &str) -> Value {
        json!({
            "record_type": "evidence.capture.frame",
            "schema_version": 1,
            "run_id": "run1",
            "ts_utc": ts,
            "content_hash": "x",
            "cursor": {"x": 20, "y": 10, "visible": true},
        })
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let mut img = image::RgbImage::new(120, 80);
        for pixel in img.pixels_mut() {
            *pixel = image::Rgb(color);
        }
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut IoCursor::new(&mut out), image::ImageOutputFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn first_frame_runs_heavy_pass_and_persists() {
        let metadata = ImmutableMetadataStore::new(Arc::new(MemoryStore::new()));
        let pipeline = pipeline(metadata.clone());
        let result = pipeline.process_record(
            "run1/capture.frame/1",
            &frame_record("2026-01-02T00:00:00Z"),
            &png([250, 250, 250]),
            true,
            false,
            &RunLimits::none(),
        );
        assert!(result.boundary);
        assert_eq!(result.boundary_reason, "first_frame");
        assert!(result.heavy_ran);
        assert!(result.derived_records >= 2);
        assert_eq!(result.ocr_tokens, 2);
        let keys = metadata.keys().unwrap();
        assert!(keys.iter().any(|k| k.contains("/derived.sst.frame/")));
        assert!(keys.iter().any(|k| k.contains("/derived.sst.state/")));
    }

    #[test]
    fn stable_second_frame_skips_heavy_pass() {
        let metadata = ImmutableMetadataStore::new(Arc::new(MemoryStore::new()));
        let pipeline = pipeline(metadata);
        let frame = png([250, 250, 250]);
        pipeline.process_record(
            "run1/capture.frame/1",
            &frame_record("2026-01-02T00:00:00Z"),
            &frame,
            true,
            false,
            &RunLimits::none(),
        );
        let second = pipeline.process_record(
            "run1/capture.frame/2",
            &frame_record("2026-01-02T00:00:01Z"),
            &frame,
            true,
            false,
            &RunLimits::none(),
        );
        assert!(!second.boundary);
        assert!(!second.heavy_ran);
        assert_eq!(second.boundary_reason, "stable_phash");
        // The frame trace is still persisted.
        assert_eq!(second.derived_records, 1);
    }

    #[test]
    fn identical_runs_produce_identical_records() {
        let run = || {
            let metadata = ImmutableMetadataStore::new(Arc::new(MemoryStore::new()));
            let pipeline = pipeline(metadata.clone());
            pipeline.process_record(
                "run1/capture.frame/1",
                &frame_record("2026-01-02T00:00:00Z"),
                &png([250, 250, 250]),
                true,
                false,
                &RunLimits::none(),
            );
            let mut dump = Vec::new();
            for key in metadata.keys().unwrap() {
                let record = metadata.get(&key).unwrap().unwrap();
                dump.push((key, canonical::to_canonical_string(&record).unwrap()));
            }
            dump
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn aborted_run_skips_heavy_pass() {
        let metadata = ImmutableMetadataStore::new(Arc::new(MemoryStore::new()));
        let pipeline = pipeline(metadata);
        let limits = RunLimits {
            should_abort: Some(Arc::new(|| true)),
            deadline: None,
        };
        let result = pipeline.process_record(
            "run1/capture.frame/1",
            &frame_record("2026-01-02T00:00:00Z"),
            &png([250, 250, 250]),
            true,
            false,
            &limits,
        );
        assert!(result.boundary);
        assert!(!result.heavy_ran);
        assert_eq!(result.derived_records, 1);
    }

    #[test]
    fn invalid_bytes_report_normalize_error() {
        let metadata = ImmutableMetadataStore::new(Arc::new(MemoryStore::new()));
        let pipeline = pipeline(metadata);
        let result = pipeline.process_record(
            "run1/capture.frame/1",
            &frame_record("2026-01-02T00:00:00Z"),
            b"not a png",
            true,
            false,
            &RunLimits::none(),
        );
        assert_eq!(result.boundary_reason, "normalize_error");
        assert_eq!(result.derived_records, 0);
    }
}
