//! Typed artifacts flowing through the pipeline.
//!
//! Every numeric field that reaches disk is integral (pixels, basis
//! points, milliseconds) so canonical serialization never sees a float.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::util::BBox;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenFlags {
    pub monospace_likely: bool,
    pub is_number: bool,
}

/// One OCR/VLM text token in frame coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub token_id: String,
    pub text: String,
    pub norm_text: String,
    pub bbox: BBox,
    pub confidence_bp: i64,
    pub source: String,
    pub flags: TokenFlags,
    pub provider_id: String,
    pub patch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextLine {
    pub line_id: String,
    pub token_ids: Vec<String>,
    pub bbox: BBox,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextBlock {
    pub block_id: String,
    pub line_ids: Vec<String>,
    pub bbox: BBox,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cell {
    pub r: i64,
    pub c: i64,
    pub bbox: BBox,
    pub text: String,
    pub norm_text: String,
    pub confidence_bp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Merge {
    pub r1: i64,
    pub c1: i64,
    pub r2: i64,
    pub c2: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveCell {
    pub r#ref: String,
    pub r: i64,
    pub c: i64,
    pub bbox: BBox,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormulaBar {
    pub bbox: BBox,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SheetHeaders {
    pub columns: Vec<String>,
    pub rows: Vec<String>,
}

/// Table grid (also the spreadsheet refinement carrier: `kind` flips to
/// `spreadsheet` and the optional fields fill in).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Table {
    pub table_id: String,
    pub state_id: String,
    pub bbox: BBox,
    pub rows: i64,
    pub cols: i64,
    pub row_y: Vec<i64>,
    pub col_x: Vec<i64>,
    pub merges: Vec<Merge>,
    pub cells: Vec<Cell>,
    pub csv: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_cell: Option<ActiveCell>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula_bar: Option<FormulaBar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<SheetHeaders>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeBlock {
    pub code_id: String,
    pub state_id: String,
    pub bbox: BBox,
    pub language: String,
    pub text: String,
    pub lines: Vec<String>,
    pub line_numbers: Vec<Option<String>>,
    pub confidence_bp: i64,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChartEvidence {
    pub tick_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chart {
    pub chart_id: String,
    pub state_id: String,
    pub bbox: BBox,
    pub chart_type: String,
    pub labels: Vec<String>,
    pub ticks_x: Vec<String>,
    pub ticks_y: Vec<String>,
    pub evidence: ChartEvidence,
    pub confidence_bp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElementState {
    pub enabled: bool,
    pub selected: bool,
    pub focused: bool,
    pub expanded: bool,
}

impl Default for ElementState {
    fn default() -> Self {
        Self {
            enabled: true,
            selected: false,
            focused: false,
            expanded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiElement {
    pub element_id: String,
    #[serde(rename = "type")]
    pub el_type: String,
    pub bbox: BBox,
    pub text_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub interactable: bool,
    pub state: ElementState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub children_ids: Vec<String>,
    pub z: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphEdge {
    pub src: String,
    pub dst: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElementGraph {
    pub state_id: String,
    pub elements: Vec<UiElement>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    pub bbox: BBox,
    #[serde(rename = "type")]
    pub cursor_type: String,
    pub confidence_bp: i64,
}

/// A visually stable screen state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenState {
    pub state_id: String,
    pub frame_id: String,
    pub frame_index: i64,
    pub ts_ms: i64,
    pub phash: String,
    pub image_sha256: String,
    pub width: i64,
    pub height: i64,
    pub tokens: Vec<Token>,
    pub element_graph: ElementGraph,
    pub text_lines: Vec<TextLine>,
    pub text_blocks: Vec<TextBlock>,
    pub tables: Vec<Table>,
    pub spreadsheets: Vec<Table>,
    pub code_blocks: Vec<CodeBlock>,
    pub charts: Vec<Chart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    pub visible_apps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_element_id: Option<String>,
    pub state_confidence_bp: i64,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Change {
    pub kind: String,
    pub target_id: String,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaEvent {
    pub delta_id: String,
    pub from_state_id: String,
    pub to_state_id: String,
    pub ts_ms: i64,
    pub changes: Vec<Change>,
    pub summary: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionCandidate {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_element_id: Option<String>,
    pub confidence_bp: i64,
    pub evidence: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionImpact {
    pub created: bool,
    pub modified: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionEvent {
    pub action_id: String,
    pub from_state_id: String,
    pub to_state_id: String,
    pub ts_ms: i64,
    pub primary: ActionCandidate,
    pub alternatives: Vec<ActionCandidate>,
    pub impact: ActionImpact,
}

/// Pipeline diagnostics surfaced to callers and journal events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: None,
        }
    }

    pub fn with_detail(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: Some(detail.into()),
        }
    }
}
