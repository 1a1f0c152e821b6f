//! UI element graph construction and cursor adoption.

use std::collections::BTreeMap;

use canonical::encode_component;
use serde_json::Value;

use crate::types::{
    Chart, CodeBlock, Cursor, ElementGraph, ElementState, GraphEdge, Table, TextBlock, Token,
    UiElement,
};
use crate::util::{mid_in_bbox, BBox};

const INTERACTABLE_TYPES: [&str; 8] = [
    "button", "textbox", "checkbox", "radio", "dropdown", "tab", "menu", "icon",
];

fn element(
    element_id: String,
    el_type: &str,
    bbox: BBox,
    label: Option<String>,
    parent_id: Option<String>,
    z: i64,
    text_refs: Vec<String>,
) -> UiElement {
    UiElement {
        element_id,
        el_type: el_type.to_string(),
        bbox,
        text_refs,
        label,
        interactable: INTERACTABLE_TYPES.contains(&el_type),
        state: ElementState::default(),
        parent_id,
        children_ids: Vec::new(),
        z,
    }
}

/// Build the element graph: a root `window` element containing one child
/// per text block, table, spreadsheet, code block, and chart.
#[allow(clippy::too_many_arguments)]
pub fn parse_ui_elements(
    state_id: &str,
    frame_bbox: BBox,
    tokens: &[Token],
    text_blocks: &[TextBlock],
    tables: &[Table],
    spreadsheets: &[Table],
    code_blocks: &[CodeBlock],
    charts: &[Chart],
) -> ElementGraph {
    let root_id = encode_component(&format!("root-{state_id}"));
    let mut elements = vec![element(
        root_id.clone(),
        "window",
        frame_bbox,
        None,
        None,
        0,
        Vec::new(),
    )];
    let mut edges = Vec::new();

    let mut add_child =
        |elements: &mut Vec<UiElement>, el_type: &str, bbox: BBox, label: Option<String>, refs: Vec<String>| {
            let eid = encode_component(&format!("{el_type}-{state_id}-{bbox:?}"));
            elements.push(element(
                eid.clone(),
                el_type,
                bbox,
                label,
                Some(root_id.clone()),
                1,
                refs,
            ));
            edges.push(GraphEdge {
                src: root_id.clone(),
                dst: eid,
                kind: "contains".to_string(),
            });
        };

    for block in text_blocks {
        let refs: Vec<String> = tokens
            .iter()
            .filter(|t| t.block_id.as_deref() == Some(block.block_id.as_str()))
            .map(|t| t.token_id.clone())
            .collect();
        add_child(
            &mut elements,
            "unknown",
            block.bbox,
            Some(block.text.clone()),
            refs,
        );
    }
    for table in tables {
        let refs = tokens_in(tokens, table.bbox);
        add_child(&mut elements, "table", table.bbox, None, refs);
    }
    for sheet in spreadsheets {
        let refs = tokens_in(tokens, sheet.bbox);
        add_child(&mut elements, "grid", sheet.bbox, None, refs);
    }
    for code in code_blocks {
        let refs = tokens_in(tokens, code.bbox);
        add_child(
            &mut elements,
            "code",
            code.bbox,
            Some(code.language.clone()),
            refs,
        );
    }
    for chart in charts {
        let refs = tokens_in(tokens, chart.bbox);
        add_child(&mut elements, "chart", chart.bbox, None, refs);
    }

    // Orphan tokens attach to the root deterministically.
    let mut root_refs: Vec<String> = tokens
        .iter()
        .filter(|t| t.block_id.is_none())
        .map(|t| t.token_id.clone())
        .collect();
    root_refs.sort();
    root_refs.dedup();
    elements[0].text_refs = root_refs;

    elements.sort_by(|a, b| {
        (a.z, a.bbox.1, a.bbox.0, &a.element_id).cmp(&(b.z, b.bbox.1, b.bbox.0, &b.element_id))
    });
    link_children(&mut elements);
    ElementGraph {
        state_id: state_id.to_string(),
        elements,
        edges,
    }
}

fn tokens_in(tokens: &[Token], bbox: BBox) -> Vec<String> {
    tokens
        .iter()
        .filter(|t| mid_in_bbox(t.bbox, bbox))
        .map(|t| t.token_id.clone())
        .collect()
}

fn link_children(elements: &mut [UiElement]) {
    let mut by_parent: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for el in elements.iter() {
        if let Some(parent) = &el.parent_id {
            by_parent
                .entry(parent.clone())
                .or_default()
                .push(el.element_id.clone());
        }
    }
    for el in elements.iter_mut() {
        let mut children = by_parent.remove(&el.element_id).unwrap_or_default();
        children.sort();
        el.children_ids = children;
    }
}

/// Adopt the cursor position from a capture record as a small fixed box.
pub fn track_cursor(record: &Value, frame_width: i64, frame_height: i64) -> Option<Cursor> {
    let cursor = record.get("cursor")?.as_object()?;
    let x = cursor.get("x")?.as_i64()?;
    let y = cursor.get("y")?.as_i64()?;
    let size = 16i64;
    let x1 = (x - size / 2).clamp(0, frame_width);
    let y1 = (y - size / 2).clamp(0, frame_height);
    let x2 = (x1 + size).min(frame_width).max(x1 + 1);
    let y2 = (y1 + size).min(frame_height).max(y1 + 1);
    let visible = cursor.get("visible").and_then(Value::as_bool).unwrap_or(true);
    Some(Cursor {
        bbox: (x1, y1, x2, y2),
        cursor_type: if visible { "arrow" } else { "unknown" }.to_string(),
        confidence_bp: if visible { 9000 } else { 2000 },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_window_contains_typed_children() {
        let blocks = vec![TextBlock {
            block_id: "block-0000".to_string(),
            line_ids: vec!["line-0000".to_string()],
            bbox: (10, 10, 100, 40),
            text: "hello".to_string(),
        }];
        let graph = parse_ui_elements("state-1", (0, 0, 640, 480), &[], &blocks, &[], &[], &[], &[]);
        assert_eq!(graph.elements.len(), 2);
        let root = graph.elements.iter().find(|e| e.el_type == "window").unwrap();
        let child = graph.elements.iter().find(|e| e.el_type == "unknown").unwrap();
        assert_eq!(root.children_ids, vec![child.element_id.clone()]);
        assert_eq!(child.parent_id.as_deref(), Some(root.element_id.as_str()));
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].kind, "contains");
        assert!(!child.interactable);
    }

    #[test]
    fn graph_is_deterministic() {
        let build = || parse_ui_elements("state-1", (0, 0, 640, 480), &[], &[], &[], &[], &[], &[]);
        assert_eq!(build(), build());
    }

    #[test]
    fn cursor_box_is_clamped() {
        let record = json!({"cursor": {"x": 2, "y": 2, "visible": true}});
        let cursor = track_cursor(&record, 640, 480).unwrap();
        assert_eq!(cursor.bbox.0, 0);
        assert_eq!(cursor.cursor_type, "arrow");
        assert_eq!(cursor.confidence_bp, 9000);

        let hidden = json!({"cursor": {"x": 50, "y": 50, "visible": false}});
        let cursor = track_cursor(&hidden, 640, 480).unwrap();
        assert_eq!(cursor.cursor_type, "unknown");

        assert!(track_cursor(&json!({}), 640, 480).is_none());
    }
}
