//! Stable element-ID matching across consecutive states.

use std::collections::{BTreeMap, BTreeSet};

use canonical::encode_component;
use serde_json::json;

use crate::types::{ScreenState, UiElement};
use crate::util::{bbox_iou, hash_serialize};

const MATCH_COST_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
struct Signature {
    el_type: String,
    rel_bbox: (i64, i64, i64, i64),
    text_hash: String,
    parent_sig: Option<(String, i64, i64)>,
}

fn signature(el: &UiElement, state: &ScreenState, width: i64, height: i64) -> Signature {
    let bbox = el.bbox;
    let rel = (
        bbox.0 * 10_000 / width,
        bbox.1 * 10_000 / height,
        bbox.2 * 10_000 / width,
        bbox.3 * 10_000 / height,
    );
    let parent_sig = el.parent_id.as_ref().and_then(|pid| {
        state
            .element_graph
            .elements
            .iter()
            .find(|e| &e.element_id == pid)
            .map(|parent| {
                (
                    parent.el_type.clone(),
                    parent.bbox.0 * 10_000 / width,
                    parent.bbox.1 * 10_000 / height,
                )
            })
    });
    Signature {
        el_type: el.el_type.clone(),
        rel_bbox: rel,
        text_hash: element_text_hash(el, state),
        parent_sig,
    }
}

/// Hash prefix over the normalized texts an element references.
pub(crate) fn element_text_hash(el: &UiElement, state: &ScreenState) -> String {
    if el.text_refs.is_empty() {
        return "empty".to_string();
    }
    let token_map: BTreeMap<&str, &str> = state
        .tokens
        .iter()
        .map(|t| (t.token_id.as_str(), t.norm_text.as_str()))
        .collect();
    let texts: Vec<&str> = el
        .text_refs
        .iter()
        .filter_map(|r| token_map.get(r.as_str()).copied())
        .filter(|t| !t.is_empty())
        .collect();
    if texts.is_empty() {
        return "empty".to_string();
    }
    hash_serialize(&json!(texts))[..16].to_string()
}

fn text_distance(a: &str, b: &str) -> f64 {
    if a == b {
        return 0.0;
    }
    if a.is_empty() || b.is_empty() || a == "empty" || b == "empty" {
        return 1.0;
    }
    let shared = a.chars().zip(b.chars()).filter(|(ca, cb)| ca == cb).count();
    (1.0 - shared as f64 / a.len().min(b.len()).max(1) as f64).max(0.0)
}

fn cost(old_el: &UiElement, new_el: &UiElement, old_sig: &Signature, new_sig: &Signature) -> f64 {
    let mut cost = 1.0 - bbox_iou(old_el.bbox, new_el.bbox);
    if old_sig.el_type != new_sig.el_type {
        cost += 0.5;
    }
    cost += 0.3 * text_distance(&old_sig.text_hash, &new_sig.text_hash);
    if old_sig.parent_sig != new_sig.parent_sig {
        cost += 0.2;
    }
    cost
}

/// Carry stable element IDs forward from the previous state. Pairs are
/// assigned greedily in ascending cost; anything above the threshold keeps
/// its fresh ID (suffixed when it would collide with a prior-state ID).
pub fn match_ids(prev_state: Option<&ScreenState>, mut state: ScreenState) -> ScreenState {
    let Some(prev) = prev_state else {
        return state;
    };
    if prev.element_graph.elements.is_empty() || state.element_graph.elements.is_empty() {
        return state;
    }

    let width = state.width.max(1);
    let height = state.height.max(1);
    let prev_sigs: BTreeMap<String, Signature> = prev
        .element_graph
        .elements
        .iter()
        .map(|el| (el.element_id.clone(), signature(el, prev, width, height)))
        .collect();
    let new_sigs: BTreeMap<String, Signature> = state
        .element_graph
        .elements
        .iter()
        .map(|el| (el.element_id.clone(), signature(el, &state, width, height)))
        .collect();

    let mut pairs: Vec<(f64, String, String)> = Vec::new();
    for new_el in &state.element_graph.elements {
        for old_el in &prev.element_graph.elements {
            let c = cost(
                old_el,
                new_el,
                &prev_sigs[&old_el.element_id],
                &new_sigs[&new_el.element_id],
            );
            pairs.push((c, old_el.element_id.clone(), new_el.element_id.clone()));
        }
    }
    pairs.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.2.cmp(&b.2))
    });

    let mut assigned_old: BTreeSet<String> = BTreeSet::new();
    let mut assigned_new: BTreeSet<String> = BTreeSet::new();
    let mut mapping: BTreeMap<String, String> = BTreeMap::new();
    for (c, old_id, new_id) in pairs {
        if c > MATCH_COST_THRESHOLD {
            break;
        }
        if assigned_old.contains(&old_id) || assigned_new.contains(&new_id) {
            continue;
        }
        assigned_old.insert(old_id.clone());
        assigned_new.insert(new_id.clone());
        mapping.insert(new_id, old_id);
    }

    let mapped: BTreeSet<&String> = mapping.values().collect();
    let mut used: BTreeSet<String> = prev
        .element_graph
        .elements
        .iter()
        .map(|el| el.element_id.clone())
        .collect();
    let state_id = state.state_id.clone();
    let mut renames: BTreeMap<String, String> = BTreeMap::new();
    for el in &state.element_graph.elements {
        let new_id = &el.element_id;
        let mut element_id = mapping.get(new_id).cloned().unwrap_or_else(|| new_id.clone());
        if used.contains(&element_id) && !mapped.contains(&element_id) {
            element_id = encode_component(&format!("{element_id}-{state_id}"));
        }
        used.insert(element_id.clone());
        renames.insert(new_id.clone(), element_id);
    }

    for el in state.element_graph.elements.iter_mut() {
        if let Some(renamed) = renames.get(&el.element_id) {
            el.element_id = renamed.clone();
        }
        if let Some(parent) = &el.parent_id {
            if let Some(renamed) = renames.get(parent) {
                el.parent_id = Some(renamed.clone());
            }
        }
        el.children_ids = el
            .children_ids
            .iter()
            .map(|c| renames.get(c).cloned().unwrap_or_else(|| c.clone()))
            .collect();
        el.children_ids.sort();
    }
    for edge in state.element_graph.edges.iter_mut() {
        if let Some(renamed) = renames.get(&edge.src) {
            edge.src = renamed.clone();
        }
        if let Some(renamed) = renames.get(&edge.dst) {
            edge.dst = renamed.clone();
        }
    }
    state.element_graph.elements.sort_by(|a, b| {
        (a.z, a.bbox.1, a.bbox.0, &a.element_id).cmp(&(b.z, b.bbox.1, b.bbox.0, &b.element_id))
    });
    if let Some(focus) = &state.focus_element_id {
        if let Some(renamed) = renames.get(focus) {
            state.focus_element_id = Some(renamed.clone());
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElementGraph, ElementState, TokenFlags};

    fn el(id: &str, el_type: &str, bbox: crate::util::BBox) -> UiElement {
        UiElement {
            element_id: id.to_string(),
            el_type: el_type.to_string(),
            bbox,
            text_refs: Vec::new(),
            label: None,
            interactable: false,
            state: ElementState::default(),
            parent_id: None,
            children_ids: Vec::new(),
            z: 1,
        }
    }

    fn state_with(state_id: &str, elements: Vec<UiElement>) -> ScreenState {
        ScreenState {
            state_id: state_id.to_string(),
            frame_id: "f".to_string(),
            frame_index: 0,
            ts_ms: 0,
            phash: "0".repeat(64),
            image_sha256: String::new(),
            width: 1000,
            height: 1000,
            tokens: Vec::new(),
            element_graph: ElementGraph {
                state_id: state_id.to_string(),
                elements,
                edges: Vec::new(),
            },
            text_lines: Vec::new(),
            text_blocks: Vec::new(),
            tables: Vec::new(),
            spreadsheets: Vec::new(),
            code_blocks: Vec::new(),
            charts: Vec::new(),
            cursor: None,
            visible_apps: Vec::new(),
            focus_element_id: None,
            state_confidence_bp: 5000,
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn translated_element_keeps_its_id() {
        let prev = state_with("s1", vec![el("old-a", "table", (100, 100, 300, 200))]);
        // Shifted by 10px: IoU stays high, same type.
        let next = state_with("s2", vec![el("new-a", "table", (110, 100, 310, 200))]);
        let matched = match_ids(Some(&prev), next);
        assert_eq!(matched.element_graph.elements[0].element_id, "old-a");
    }

    #[test]
    fn added_element_gets_fresh_id() {
        let prev = state_with("s1", vec![el("old-a", "table", (100, 100, 300, 200))]);
        let next = state_with(
            "s2",
            vec![
                el("new-a", "table", (102, 100, 302, 200)),
                el("new-b", "chart", (600, 600, 800, 700)),
            ],
        );
        let matched = match_ids(Some(&prev), next);
        let ids: Vec<&str> = matched
            .element_graph
            .elements
            .iter()
            .map(|e| e.element_id.as_str())
            .collect();
        assert!(ids.contains(&"old-a"));
        assert!(ids.contains(&"new-b"));
    }

    #[test]
    fn disjoint_elements_do_not_match() {
        let prev = state_with("s1", vec![el("old-a", "table", (0, 0, 50, 50))]);
        let next = state_with("s2", vec![el("new-a", "chart", (800, 800, 900, 900))]);
        let matched = match_ids(Some(&prev), next);
        assert_eq!(matched.element_graph.elements[0].element_id, "new-a");
    }

    #[test]
    fn first_state_passes_through() {
        let next = state_with("s1", vec![el("a", "table", (0, 0, 10, 10))]);
        let matched = match_ids(None, next.clone());
        assert_eq!(matched, next);
    }

    #[test]
    fn text_hash_uses_referenced_tokens() {
        let mut state = state_with("s1", vec![el("a", "unknown", (0, 0, 10, 10))]);
        state.tokens.push(crate::types::Token {
            token_id: "t1".to_string(),
            text: "hello".to_string(),
            norm_text: "hello".to_string(),
            bbox: (0, 0, 10, 10),
            confidence_bp: 9000,
            source: "ocr".to_string(),
            flags: TokenFlags {
                monospace_likely: false,
                is_number: false,
            },
            provider_id: "p".to_string(),
            patch_id: "full_frame".to_string(),
            line_id: None,
            block_id: None,
        });
        state.element_graph.elements[0].text_refs = vec!["t1".to_string()];
        let hash = element_text_hash(&state.element_graph.elements[0], &state);
        assert_ne!(hash, "empty");
        assert_eq!(hash.len(), 16);
    }
}
