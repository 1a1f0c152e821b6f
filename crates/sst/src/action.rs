//! Pixels-only action inference.

use canonical::encode_component;
use serde_json::{json, Value};

use crate::types::{ActionCandidate, ActionEvent, ActionImpact, Cursor, DeltaEvent, ScreenState};
use crate::util::{bbox_iou, hash_serialize};

fn cand(kind: &str, target: Option<String>, confidence_bp: i64, evidence: Value) -> ActionCandidate {
    ActionCandidate {
        kind: kind.to_string(),
        target_element_id: target,
        confidence_bp,
        evidence,
    }
}

fn unknown(delta: &DeltaEvent) -> ActionCandidate {
    cand("unknown", None, 4000, json!({"delta_id": delta.delta_id}))
}

/// Infer the most likely user action from the delta plus cursor evidence.
/// Candidates are scored in basis points; the best becomes primary with up
/// to two distinct alternatives.
pub fn infer_action(
    delta_event: Option<&DeltaEvent>,
    cursor_prev: Option<&Cursor>,
    cursor_curr: Option<&Cursor>,
    prev_state: Option<&ScreenState>,
    state: &ScreenState,
) -> Option<ActionEvent> {
    let delta = delta_event?;
    let prev = prev_state?;
    let mut candidates = vec![
        cand_type(delta, prev, state),
        cand_click(delta, prev, cursor_prev, cursor_curr),
        cand_scroll(delta, prev, state),
        cand_drag(delta, prev, cursor_prev, cursor_curr),
    ];
    candidates.retain(|c| c.confidence_bp > 0);

    let (primary, alternatives) = if candidates.is_empty() {
        (unknown(delta), Vec::new())
    } else {
        candidates.sort_by(|a, b| {
            (-a.confidence_bp, &a.kind, a.target_element_id.clone().unwrap_or_default()).cmp(&(
                -b.confidence_bp,
                &b.kind,
                b.target_element_id.clone().unwrap_or_default(),
            ))
        });
        let primary = candidates[0].clone();
        let mut alternatives: Vec<ActionCandidate> = candidates
            .into_iter()
            .skip(1)
            .filter(|c| c.kind != primary.kind)
            .take(2)
            .collect();
        if primary.confidence_bp < 5000 && alternatives.is_empty() {
            alternatives.push(unknown(delta));
        }
        (primary, alternatives)
    };

    let impact = impact_of(delta);
    let action_id = action_id(delta, &primary, &alternatives, &impact);
    Some(ActionEvent {
        action_id,
        from_state_id: prev.state_id.clone(),
        to_state_id: state.state_id.clone(),
        ts_ms: state.ts_ms,
        primary,
        alternatives,
        impact,
    })
}

fn cand_type(delta: &DeltaEvent, prev: &ScreenState, state: &ScreenState) -> ActionCandidate {
    let focus = state
        .focus_element_id
        .clone()
        .or_else(|| prev.focus_element_id.clone());
    let Some(focus) = focus else {
        return cand("type", None, 0, json!({"reason": "no_focus"}));
    };
    let text_changes = delta
        .changes
        .iter()
        .filter(|c| {
            c.kind == "element.changed"
                && c.detail.get("text_changed").and_then(Value::as_bool) == Some(true)
        })
        .count() as i64;
    if text_changes <= 0 {
        return cand("type", Some(focus), 0, json!({"reason": "no_text_change"}));
    }
    let conf = (5500 + 500 * text_changes).min(9800);
    cand("type", Some(focus), conf, json!({"text_changes": text_changes}))
}

fn cand_click(
    delta: &DeltaEvent,
    prev: &ScreenState,
    cursor_prev: Option<&Cursor>,
    cursor_curr: Option<&Cursor>,
) -> ActionCandidate {
    let Some(cursor) = cursor_curr.or(cursor_prev) else {
        return cand("click", None, 0, json!({"reason": "no_cursor"}));
    };
    let Some(target) = cursor_target(prev, cursor) else {
        return cand("click", None, 0, json!({"reason": "no_target"}));
    };
    let state_changes = delta
        .changes
        .iter()
        .filter(|c| matches!(c.kind.as_str(), "element.changed" | "element.added"))
        .count() as i64;
    if state_changes <= 0 {
        return cand("click", Some(target), 0, json!({"reason": "no_state_change"}));
    }
    let conf = (5200 + 400 * state_changes).min(9600);
    cand("click", Some(target), conf, json!({"state_changes": state_changes}))
}

fn cand_scroll(_delta: &DeltaEvent, prev: &ScreenState, state: &ScreenState) -> ActionCandidate {
    let prev_elements: std::collections::BTreeMap<&str, _> = prev
        .element_graph
        .elements
        .iter()
        .map(|e| (e.element_id.as_str(), e))
        .collect();
    let mut shifts = Vec::new();
    for el in &state.element_graph.elements {
        let Some(old) = prev_elements.get(el.element_id.as_str()) else {
            continue;
        };
        let dy = (el.bbox.1 - old.bbox.1) + (el.bbox.3 - old.bbox.3);
        if dy != 0 {
            shifts.push(dy);
        }
    }
    if shifts.is_empty() {
        return cand("scroll", None, 0, json!({"reason": "no_shift"}));
    }
    let avg_shift = shifts.iter().sum::<i64>() / shifts.len() as i64;
    let magnitude = avg_shift.abs();
    if magnitude < 20 {
        return cand(
            "scroll",
            None,
            0,
            json!({"reason": "small_shift", "avg_shift": avg_shift}),
        );
    }
    let conf = (5000 + (magnitude * 40).min(3000)).min(9300);
    cand(
        "scroll",
        None,
        conf,
        json!({"avg_shift": avg_shift, "shift_count": shifts.len()}),
    )
}

fn cand_drag(
    delta: &DeltaEvent,
    prev: &ScreenState,
    cursor_prev: Option<&Cursor>,
    cursor_curr: Option<&Cursor>,
) -> ActionCandidate {
    let Some(cursor) = cursor_curr else {
        return cand("drag", None, 0, json!({"reason": "no_cursor"}));
    };
    let changed: Vec<&crate::types::Change> = delta
        .changes
        .iter()
        .filter(|c| {
            c.kind == "element.changed"
                && c.detail.get("bbox_changed").and_then(Value::as_bool) == Some(true)
        })
        .collect();
    if changed.is_empty() {
        return cand("drag", None, 0, json!({"reason": "no_bbox_change"}));
    }
    let target =
        cursor_target(prev, cursor).or_else(|| Some(changed[0].target_id.clone()));
    let move_conf = match cursor_prev {
        Some(prev_cursor) => {
            let dx = (cursor.bbox.0 - prev_cursor.bbox.0).abs();
            let dy = (cursor.bbox.1 - prev_cursor.bbox.1).abs();
            ((dx + dy) * 20).min(2000)
        }
        None => 0,
    };
    let conf = (5200 + 300 * changed.len() as i64 + move_conf).min(9100);
    cand("drag", target, conf, json!({"changed": changed.len()}))
}

fn cursor_target(state: &ScreenState, cursor: &Cursor) -> Option<String> {
    let mut candidates: Vec<(f64, &crate::types::UiElement)> = state
        .element_graph
        .elements
        .iter()
        .filter(|el| el.interactable)
        .filter_map(|el| {
            let iou = bbox_iou(cursor.bbox, el.bbox);
            (iou > 0.0).then_some((iou, el))
        })
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                (a.1.bbox.1, a.1.bbox.0, &a.1.element_id).cmp(&(
                    b.1.bbox.1,
                    b.1.bbox.0,
                    &b.1.element_id,
                ))
            })
    });
    Some(candidates[0].1.element_id.clone())
}

fn impact_of(delta: &DeltaEvent) -> ActionImpact {
    let removed = delta.summary.get("element_removed").copied().unwrap_or(0);
    let added = delta.summary.get("element_added").copied().unwrap_or(0);
    let table_changes = delta.summary.get("table_cell_changed").copied().unwrap_or(0);
    let total = delta.summary.get("total_changes").copied().unwrap_or(0);
    ActionImpact {
        created: added > 0 && removed == 0,
        modified: total > 0,
        deleted: removed >= 3 || table_changes >= 12,
    }
}

fn action_id(
    delta: &DeltaEvent,
    primary: &ActionCandidate,
    alternatives: &[ActionCandidate],
    impact: &ActionImpact,
) -> String {
    let key = json!({
        "delta": delta.delta_id,
        "primary": {
            "kind": primary.kind,
            "target": primary.target_element_id,
            "conf": primary.confidence_bp,
        },
        "alts": alternatives
            .iter()
            .map(|a| json!({"k": a.kind, "t": a.target_element_id, "c": a.confidence_bp}))
            .collect::<Vec<_>>(),
        "impact": {"created": impact.created, "modified": impact.modified, "deleted": impact.deleted},
    });
    let digest = hash_serialize(&key);
    encode_component(&format!(
        "action-{}-{}-{}",
        delta.delta_id,
        primary.kind,
        &digest[..20]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Change, ElementGraph, ElementState, UiElement};
    use std::collections::BTreeMap;

    fn el(id: &str, bbox: crate::util::BBox, interactable: bool) -> UiElement {
        UiElement {
            element_id: id.to_string(),
            el_type: if interactable { "button" } else { "unknown" }.to_string(),
            bbox,
            text_refs: Vec::new(),
            label: None,
            interactable,
            state: ElementState::default(),
            parent_id: None,
            children_ids: Vec::new(),
            z: 1,
        }
    }

    fn state(state_id: &str, elements: Vec<UiElement>, focus: Option<&str>) -> ScreenState {
        ScreenState {
            state_id: state_id.to_string(),
            frame_id: "f".to_string(),
            frame_index: 0,
            ts_ms: 100,
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
            focus_element_id: focus.map(str::to_string),
            state_confidence_bp: 5000,
            diagnostics: Vec::new(),
        }
    }

    fn delta(changes: Vec<Change>) -> DeltaEvent {
        let mut summary: BTreeMap<String, i64> = BTreeMap::new();
        summary.insert("total_changes".to_string(), changes.len() as i64);
        summary.insert(
            "element_changed".to_string(),
            changes.iter().filter(|c| c.kind == "element.changed").count() as i64,
        );
        summary.insert("element_added".to_string(), 0);
        summary.insert("element_removed".to_string(), 0);
        summary.insert("table_cell_changed".to_string(), 0);
        DeltaEvent {
            delta_id: "delta-1".to_string(),
            from_state_id: "s1".to_string(),
            to_state_id: "s2".to_string(),
            ts_ms: 100,
            changes,
            summary,
        }
    }

    #[test]
    fn text_change_with_focus_infers_type() {
        let prev = state("s1", vec![el("box", (0, 0, 100, 40), true)], Some("box"));
        let next = state("s2", vec![el("box", (0, 0, 100, 40), true)], Some("box"));
        let d = delta(vec![Change {
            kind: "element.changed".to_string(),
            target_id: "box".to_string(),
            detail: json!({"text_changed": true}),
        }]);
        let action = infer_action(Some(&d), None, None, Some(&prev), &next).unwrap();
        assert_eq!(action.primary.kind, "type");
        assert_eq!(action.primary.target_element_id.as_deref(), Some("box"));
        assert!(action.primary.confidence_bp >= 5500);
        assert!(action.impact.modified);
    }

    #[test]
    fn cursor_over_button_with_changes_infers_click() {
        let prev = state("s1", vec![el("btn", (0, 0, 40, 40), true)], None);
        let next = state("s2", vec![el("btn", (0, 0, 40, 40), true)], None);
        let cursor = Cursor {
            bbox: (10, 10, 26, 26),
            cursor_type: "arrow".to_string(),
            confidence_bp: 9000,
        };
        let d = delta(vec![Change {
            kind: "element.changed".to_string(),
            target_id: "btn".to_string(),
            detail: json!({"state_changed": true}),
        }]);
        let action = infer_action(Some(&d), None, Some(&cursor), Some(&prev), &next).unwrap();
        assert_eq!(action.primary.kind, "click");
        assert_eq!(action.primary.target_element_id.as_deref(), Some("btn"));
    }

    #[test]
    fn uniform_vertical_shift_infers_scroll() {
        let prev = state(
            "s1",
            vec![el("a", (0, 100, 100, 140), false), el("b", (0, 200, 100, 240), false)],
            None,
        );
        let next = state(
            "s2",
            vec![el("a", (0, 40, 100, 80), false), el("b", (0, 140, 100, 180), false)],
            None,
        );
        let d = delta(vec![Change {
            kind: "element.changed".to_string(),
            target_id: "a".to_string(),
            detail: json!({"bbox_changed": true}),
        }]);
        let action = infer_action(Some(&d), None, None, Some(&prev), &next).unwrap();
        assert_eq!(action.primary.kind, "scroll");
    }

    #[test]
    fn no_signals_yields_unknown() {
        let prev = state("s1", Vec::new(), None);
        let next = state("s2", Vec::new(), None);
        let d = delta(vec![Change {
            kind: "chart.ticks_changed".to_string(),
            target_id: "c".to_string(),
            detail: json!({}),
        }]);
        let action = infer_action(Some(&d), None, None, Some(&prev), &next).unwrap();
        assert_eq!(action.primary.kind, "unknown");
        assert_eq!(action.primary.confidence_bp, 4000);
    }

    #[test]
    fn action_id_is_deterministic() {
        let prev = state("s1", vec![el("box", (0, 0, 100, 40), true)], Some("box"));
        let next = state("s2", vec![el("box", (0, 0, 100, 40), true)], Some("box"));
        let d = delta(vec![Change {
            kind: "element.changed".to_string(),
            target_id: "box".to_string(),
            detail: json!({"text_changed": true}),
        }]);
        let a = infer_action(Some(&d), None, None, Some(&prev), &next).unwrap();
        let b = infer_action(Some(&d), None, None, Some(&prev), &next).unwrap();
        assert_eq!(a, b);
    }
}
