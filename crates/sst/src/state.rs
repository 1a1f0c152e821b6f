//! Screen-state assembly.

use canonical::{encode_component, normalize_text};
use serde_json::json;

use crate::types::{
    Chart, CodeBlock, Cursor, ElementGraph, ScreenState, Table, TextBlock, TextLine, Token,
};
use crate::util::{bp_clamp, hash_serialize, BBox};

/// Assemble the screen state and mint its content-addressed `state_id` from
/// `(run_id, phash, token fingerprint)`. Nested artifacts are restamped
/// with the final state id.
#[allow(clippy::too_many_arguments)]
pub fn build_state(
    run_id: &str,
    frame_id: &str,
    frame_index: i64,
    ts_ms: i64,
    phash: &str,
    image_sha256: &str,
    width: i64,
    height: i64,
    tokens: Vec<Token>,
    mut element_graph: ElementGraph,
    text_lines: Vec<TextLine>,
    text_blocks: Vec<TextBlock>,
    mut tables: Vec<Table>,
    mut spreadsheets: Vec<Table>,
    mut code_blocks: Vec<CodeBlock>,
    mut charts: Vec<Chart>,
    cursor: Option<Cursor>,
    window_title: Option<&str>,
) -> ScreenState {
    let tokens_key: Vec<serde_json::Value> = tokens
        .iter()
        .map(|t| {
            json!({
                "norm_text": t.norm_text,
                "bbox": [t.bbox.0, t.bbox.1, t.bbox.2, t.bbox.3],
                "confidence_bp": t.confidence_bp,
            })
        })
        .collect();
    let tokens_hash = if tokens_key.is_empty() {
        "empty".to_string()
    } else {
        hash_serialize(&tokens_key)[..16].to_string()
    };
    let state_id = encode_component(&format!("state-{run_id}-{phash}-{tokens_hash}"));

    element_graph.state_id = state_id.clone();
    for table in tables.iter_mut() {
        table.state_id = state_id.clone();
    }
    for sheet in spreadsheets.iter_mut() {
        sheet.state_id = state_id.clone();
    }
    for code in code_blocks.iter_mut() {
        code.state_id = state_id.clone();
    }
    for chart in charts.iter_mut() {
        chart.state_id = state_id.clone();
    }

    let visible_apps = visible_apps(&tokens, window_title);
    let focus_element_id = focus_element(&element_graph, cursor.as_ref());
    let state_confidence_bp = state_confidence(
        &tokens,
        &tables,
        &spreadsheets,
        &code_blocks,
        &charts,
    );

    ScreenState {
        state_id,
        frame_id: frame_id.to_string(),
        frame_index,
        ts_ms,
        phash: phash.to_string(),
        image_sha256: image_sha256.to_string(),
        width,
        height,
        tokens,
        element_graph,
        text_lines,
        text_blocks,
        tables,
        spreadsheets,
        code_blocks,
        charts,
        cursor,
        visible_apps,
        focus_element_id,
        state_confidence_bp,
        diagnostics: Vec::new(),
    }
}

fn visible_apps(tokens: &[Token], window_title: Option<&str>) -> Vec<String> {
    let mut apps = Vec::new();
    if let Some(title) = window_title {
        let norm = normalize_text(title);
        if !norm.is_empty() {
            apps.push(norm);
        }
    }
    let mut top: Vec<&Token> = tokens.iter().collect();
    top.sort_by(|a, b| {
        (a.bbox.1, a.bbox.0, &a.token_id).cmp(&(b.bbox.1, b.bbox.0, &b.token_id))
    });
    for token in top.into_iter().take(12) {
        let text = normalize_text(&token.text);
        if text.is_empty() || text.chars().count() > 64 {
            continue;
        }
        if text.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        apps.push(text);
    }
    let mut uniq = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for app in apps {
        if seen.insert(app.clone()) {
            uniq.push(app);
        }
    }
    uniq.truncate(8);
    uniq
}

fn focus_element(graph: &ElementGraph, cursor: Option<&Cursor>) -> Option<String> {
    let cursor = cursor?;
    let (cx, cy) = (
        (cursor.bbox.0 + cursor.bbox.2) / 2,
        (cursor.bbox.1 + cursor.bbox.3) / 2,
    );
    let mut candidates: Vec<&crate::types::UiElement> = graph
        .elements
        .iter()
        .filter(|el| {
            el.interactable
                && contains_point(el.bbox, cx, cy)
        })
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(|a, b| {
        (a.z, a.bbox.1, a.bbox.0, &a.element_id).cmp(&(b.z, b.bbox.1, b.bbox.0, &b.element_id))
    });
    Some(candidates[0].element_id.clone())
}

fn contains_point(bbox: BBox, x: i64, y: i64) -> bool {
    bbox.0 <= x && x < bbox.2 && bbox.1 <= y && y < bbox.3
}

fn state_confidence(
    tokens: &[Token],
    tables: &[Table],
    spreadsheets: &[Table],
    code_blocks: &[CodeBlock],
    charts: &[Chart],
) -> i64 {
    let base = if tokens.is_empty() {
        4000
    } else {
        let avg = tokens.iter().map(|t| t.confidence_bp).sum::<i64>() / tokens.len() as i64;
        avg.clamp(3000, 9500)
    };
    let mut boost = 0;
    if !tables.is_empty() {
        boost += 400;
    }
    if !spreadsheets.is_empty() {
        boost += 300;
    }
    if !code_blocks.is_empty() {
        boost += 300;
    }
    if !charts.is_empty() {
        boost += 200;
    }
    bp_clamp(base + boost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenFlags;

    fn token(id: &str, text: &str, bbox: BBox, conf: i64) -> Token {
        Token {
            token_id: id.to_string(),
            text: text.to_string(),
            norm_text: normalize_text(text),
            bbox,
            confidence_bp: conf,
            source: "ocr".to_string(),
            flags: TokenFlags {
                monospace_likely: false,
                is_number: false,
            },
            provider_id: "ocr.test".to_string(),
            patch_id: "full_frame".to_string(),
            line_id: None,
            block_id: None,
        }
    }

    fn graph() -> ElementGraph {
        ElementGraph {
            state_id: "pending".to_string(),
            elements: Vec::new(),
            edges: Vec::new(),
        }
    }

    fn build(tokens: Vec<Token>) -> ScreenState {
        build_state(
            "run1",
            "run1/capture.frame/1",
            0,
            1000,
            &"0".repeat(64),
            "imagesha",
            640,
            480,
            tokens,
            graph(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            None,
            Some("Editor - main.rs"),
        )
    }

    #[test]
    fn state_id_depends_on_tokens_and_phash() {
        let a = build(vec![token("t1", "hello", (0, 0, 10, 10), 9000)]);
        let b = build(vec![token("t1", "hello", (0, 0, 10, 10), 9000)]);
        let c = build(vec![token("t1", "other", (0, 0, 10, 10), 9000)]);
        assert_eq!(a.state_id, b.state_id);
        assert_ne!(a.state_id, c.state_id);
        assert!(a.state_id.starts_with("rid_"));
    }

    #[test]
    fn window_title_leads_visible_apps() {
        let state = build(vec![token("t1", "File", (0, 0, 30, 12), 9000)]);
        assert_eq!(state.visible_apps[0], "Editor - main.rs");
        assert!(state.visible_apps.contains(&"File".to_string()));
    }

    #[test]
    fn confidence_reflects_tokens() {
        let state = build(Vec::new());
        assert_eq!(state.state_confidence_bp, 4000);
        let state = build(vec![token("t1", "x", (0, 0, 5, 5), 9000)]);
        assert_eq!(state.state_confidence_bp, 9000);
    }
}
