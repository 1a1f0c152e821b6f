//! Pipeline configuration.

use serde_json::Value;

/// Tunables for the SST pipeline. Defaults mirror production capture
/// settings; `from_config` reads overrides from the `processing.sst`
/// section of an effective config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstConfig {
    pub enabled: bool,
    pub strip_alpha: bool,
    pub phash_size: u32,
    pub phash_downscale: u32,
    pub d_stable: usize,
    pub d_boundary: usize,
    pub diff_threshold_bp: i64,
    pub segment_downscale_px: u32,
    pub heavy_on_boundary: bool,
    pub heavy_always: bool,
    pub tile_max_px: i64,
    pub tile_overlap_px: i64,
    pub tile_add_full_frame: bool,
    pub focus_conf_bp: i64,
    pub focus_padding_px: i64,
    pub focus_max_patches: i64,
    pub focus_cluster_gap_px: i64,
    pub ocr_min_conf_bp: i64,
    pub ocr_nms_iou_bp: i64,
    pub ocr_max_tokens: usize,
    pub ocr_max_patches: usize,
    pub layout_line_y_px: i64,
    pub layout_block_gap_px: i64,
    pub layout_align_tol_px: i64,
    pub table_min_rows: usize,
    pub table_min_cols: usize,
    pub table_max_cells: usize,
    pub table_row_gap_px: i64,
    pub table_col_gap_px: i64,
    pub sheet_header_scan_rows: usize,
    pub code_min_keywords: usize,
    pub chart_min_ticks: usize,
    pub delta_bbox_shift_px: i64,
    pub delta_table_match_iou_bp: i64,
    pub redact_enabled: bool,
    pub redact_denylist: Vec<String>,
    pub schema_version: u64,
}

impl Default for SstConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strip_alpha: true,
            phash_size: 8,
            phash_downscale: 32,
            d_stable: 4,
            d_boundary: 12,
            diff_threshold_bp: 1800,
            segment_downscale_px: 64,
            heavy_on_boundary: true,
            heavy_always: false,
            tile_max_px: 1024,
            tile_overlap_px: 64,
            tile_add_full_frame: true,
            focus_conf_bp: 0,
            focus_padding_px: 24,
            focus_max_patches: 0,
            focus_cluster_gap_px: 48,
            ocr_min_conf_bp: 3500,
            ocr_nms_iou_bp: 7000,
            ocr_max_tokens: 4000,
            ocr_max_patches: 64,
            layout_line_y_px: 12,
            layout_block_gap_px: 28,
            layout_align_tol_px: 48,
            table_min_rows: 2,
            table_min_cols: 2,
            table_max_cells: 2500,
            table_row_gap_px: 18,
            table_col_gap_px: 36,
            sheet_header_scan_rows: 2,
            code_min_keywords: 1,
            chart_min_ticks: 2,
            delta_bbox_shift_px: 24,
            delta_table_match_iou_bp: 3000,
            redact_enabled: true,
            redact_denylist: Vec::new(),
            schema_version: 1,
        }
    }
}

macro_rules! read_field {
    ($section:expr, $cfg:expr, int, $field:ident) => {
        if let Some(v) = $section.get(stringify!($field)).and_then(Value::as_i64) {
            $cfg.$field = v as _;
        }
    };
    ($section:expr, $cfg:expr, bool, $field:ident) => {
        if let Some(v) = $section.get(stringify!($field)).and_then(Value::as_bool) {
            $cfg.$field = v;
        }
    };
}

impl SstConfig {
    /// Read overrides from `config.processing.sst`.
    pub fn from_config(config: &Value) -> Self {
        let mut cfg = Self::default();
        let Some(section) = config.get("processing").and_then(|p| p.get("sst")) else {
            return cfg;
        };
        read_field!(section, cfg, bool, enabled);
        read_field!(section, cfg, bool, strip_alpha);
        read_field!(section, cfg, int, phash_size);
        read_field!(section, cfg, int, phash_downscale);
        read_field!(section, cfg, int, d_stable);
        read_field!(section, cfg, int, d_boundary);
        read_field!(section, cfg, int, diff_threshold_bp);
        read_field!(section, cfg, int, segment_downscale_px);
        read_field!(section, cfg, bool, heavy_on_boundary);
        read_field!(section, cfg, bool, heavy_always);
        read_field!(section, cfg, int, tile_max_px);
        read_field!(section, cfg, int, tile_overlap_px);
        read_field!(section, cfg, bool, tile_add_full_frame);
        read_field!(section, cfg, int, focus_conf_bp);
        read_field!(section, cfg, int, focus_padding_px);
        read_field!(section, cfg, int, focus_max_patches);
        read_field!(section, cfg, int, focus_cluster_gap_px);
        read_field!(section, cfg, int, ocr_min_conf_bp);
        read_field!(section, cfg, int, ocr_nms_iou_bp);
        read_field!(section, cfg, int, ocr_max_tokens);
        read_field!(section, cfg, int, ocr_max_patches);
        read_field!(section, cfg, int, layout_line_y_px);
        read_field!(section, cfg, int, layout_block_gap_px);
        read_field!(section, cfg, int, layout_align_tol_px);
        read_field!(section, cfg, int, table_min_rows);
        read_field!(section, cfg, int, table_min_cols);
        read_field!(section, cfg, int, table_max_cells);
        read_field!(section, cfg, int, table_row_gap_px);
        read_field!(section, cfg, int, table_col_gap_px);
        read_field!(section, cfg, int, sheet_header_scan_rows);
        read_field!(section, cfg, int, code_min_keywords);
        read_field!(section, cfg, int, chart_min_ticks);
        read_field!(section, cfg, int, delta_bbox_shift_px);
        read_field!(section, cfg, int, delta_table_match_iou_bp);
        read_field!(section, cfg, bool, redact_enabled);
        if let Some(list) = section.get("redact_denylist").and_then(Value::as_array) {
            cfg.redact_denylist = list
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        read_field!(section, cfg, int, schema_version);
        cfg
    }

    /// JSON view of the config used for extractor identity hashing.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "enabled": self.enabled,
            "strip_alpha": self.strip_alpha,
            "phash_size": self.phash_size,
            "phash_downscale": self.phash_downscale,
            "d_stable": self.d_stable,
            "d_boundary": self.d_boundary,
            "diff_threshold_bp": self.diff_threshold_bp,
            "segment_downscale_px": self.segment_downscale_px,
            "heavy_on_boundary": self.heavy_on_boundary,
            "heavy_always": self.heavy_always,
            "tile_max_px": self.tile_max_px,
            "tile_overlap_px": self.tile_overlap_px,
            "tile_add_full_frame": self.tile_add_full_frame,
            "focus_conf_bp": self.focus_conf_bp,
            "focus_padding_px": self.focus_padding_px,
            "focus_max_patches": self.focus_max_patches,
            "focus_cluster_gap_px": self.focus_cluster_gap_px,
            "ocr_min_conf_bp": self.ocr_min_conf_bp,
            "ocr_nms_iou_bp": self.ocr_nms_iou_bp,
            "ocr_max_tokens": self.ocr_max_tokens,
            "ocr_max_patches": self.ocr_max_patches,
            "layout_line_y_px": self.layout_line_y_px,
            "layout_block_gap_px": self.layout_block_gap_px,
            "layout_align_tol_px": self.layout_align_tol_px,
            "table_min_rows": self.table_min_rows,
            "table_min_cols": self.table_min_cols,
            "table_max_cells": self.table_max_cells,
            "table_row_gap_px": self.table_row_gap_px,
            "table_col_gap_px": self.table_col_gap_px,
            "sheet_header_scan_rows": self.sheet_header_scan_rows,
            "code_min_keywords": self.code_min_keywords,
            "chart_min_ticks": self.chart_min_ticks,
            "delta_bbox_shift_px": self.delta_bbox_shift_px,
            "delta_table_match_iou_bp": self.delta_table_match_iou_bp,
            "redact_enabled": self.redact_enabled,
            "redact_denylist": self.redact_denylist,
            "schema_version": self.schema_version,
        })
    }
}

/// Stable hash of the SST config for extractor identity.
pub fn config_hash(config: &SstConfig) -> String {
    crate::util::hash_canonical_value(&config.to_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_hash_is_stable() {
        let a = config_hash(&SstConfig::default());
        let b = config_hash(&SstConfig::default());
        assert_eq!(a, b);
    }

    #[test]
    fn overrides_apply() {
        let config = json!({
            "processing": {"sst": {
                "d_stable": 2,
                "heavy_always": true,
                "redact_denylist": ["1password", ""],
            }}
        });
        let cfg = SstConfig::from_config(&config);
        assert_eq!(cfg.d_stable, 2);
        assert!(cfg.heavy_always);
        assert_eq!(cfg.redact_denylist, vec!["1password"]);
        assert_ne!(config_hash(&cfg), config_hash(&SstConfig::default()));
    }
}
