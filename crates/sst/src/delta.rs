//! Delta events between consecutive states.

use std::collections::{BTreeMap, BTreeSet};

use canonical::{encode_component, normalize_text};
use serde_json::{json, Value};

use crate::matching::element_text_hash;
use crate::types::{Change, DeltaEvent, ScreenState, Table, UiElement};
use crate::util::{bbox_iou, hash_serialize};

/// Diff two states into an ordered, content-addressed delta event. Returns
/// `None` when there is no previous state or nothing changed.
pub fn build_delta(
    prev_state: Option<&ScreenState>,
    state: &ScreenState,
    bbox_shift_px: i64,
    table_match_iou_bp: i64,
) -> Option<DeltaEvent> {
    let prev = prev_state?;
    let mut changes = Vec::new();
    changes.extend(diff_elements(prev, state, bbox_shift_px));
    changes.extend(diff_tables(prev, state, table_match_iou_bp));
    changes.extend(diff_code(prev, state));
    changes.extend(diff_charts(prev, state));
    if changes.is_empty() {
        return None;
    }
    changes.sort_by(|a, b| {
        (&a.kind, &a.target_id, hash_serialize(&a.detail))
            .cmp(&(&b.kind, &b.target_id, hash_serialize(&b.detail)))
    });
    let summary = summarize(&changes);
    let delta_id = delta_id(&prev.state_id, &state.state_id, &summary, &changes);
    Some(DeltaEvent {
        delta_id,
        from_state_id: prev.state_id.clone(),
        to_state_id: state.state_id.clone(),
        ts_ms: state.ts_ms,
        changes,
        summary,
    })
}

fn elements_by_id(state: &ScreenState) -> BTreeMap<&str, &UiElement> {
    state
        .element_graph
        .elements
        .iter()
        .map(|el| (el.element_id.as_str(), el))
        .collect()
}

fn bbox_shift(a: &UiElement, b: &UiElement) -> i64 {
    (a.bbox.0 - b.bbox.0).abs()
        + (a.bbox.1 - b.bbox.1).abs()
        + (a.bbox.2 - b.bbox.2).abs()
        + (a.bbox.3 - b.bbox.3).abs()
}

fn diff_elements(prev: &ScreenState, state: &ScreenState, bbox_shift_px: i64) -> Vec<Change> {
    let prev_elements = elements_by_id(prev);
    let elements = elements_by_id(state);
    let prev_ids: BTreeSet<&str> = prev_elements.keys().copied().collect();
    let new_ids: BTreeSet<&str> = elements.keys().copied().collect();
    let mut changes = Vec::new();
    for element_id in new_ids.difference(&prev_ids) {
        changes.push(Change {
            kind: "element.added".to_string(),
            target_id: element_id.to_string(),
            detail: json!({}),
        });
    }
    for element_id in prev_ids.difference(&new_ids) {
        changes.push(Change {
            kind: "element.removed".to_string(),
            target_id: element_id.to_string(),
            detail: json!({}),
        });
    }
    for element_id in prev_ids.intersection(&new_ids) {
        let old = prev_elements[element_id];
        let new = elements[element_id];
        let mut detail = serde_json::Map::new();
        if bbox_shift(old, new) > bbox_shift_px {
            detail.insert("bbox_changed".to_string(), json!(true));
        }
        if element_text_hash(old, prev) != element_text_hash(new, state) {
            detail.insert("text_changed".to_string(), json!(true));
        }
        if old.state != new.state {
            detail.insert("state_changed".to_string(), json!(true));
        }
        if !detail.is_empty() {
            changes.push(Change {
                kind: "element.changed".to_string(),
                target_id: element_id.to_string(),
                detail: Value::Object(detail),
            });
        }
    }
    changes
}

fn diff_tables(prev: &ScreenState, state: &ScreenState, table_match_iou_bp: i64) -> Vec<Change> {
    if prev.tables.is_empty() || state.tables.is_empty() {
        return Vec::new();
    }
    let threshold = (table_match_iou_bp as f64 / 10_000.0).clamp(0.0, 1.0);
    let mut matches: Vec<(f64, &Table, &Table)> = Vec::new();
    for new in &state.tables {
        for old in &prev.tables {
            matches.push((bbox_iou(old.bbox, new.bbox), old, new));
        }
    }
    matches.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.table_id.cmp(&b.1.table_id))
            .then_with(|| a.2.table_id.cmp(&b.2.table_id))
    });
    let mut used_old = BTreeSet::new();
    let mut used_new = BTreeSet::new();
    let mut changes = Vec::new();
    for (iou, old, new) in matches {
        if iou < threshold {
            break;
        }
        if !used_old.insert(old.table_id.clone()) || !used_new.insert(new.table_id.clone()) {
            continue;
        }
        let old_cells: BTreeMap<(i64, i64), &str> = old
            .cells
            .iter()
            .map(|c| ((c.r, c.c), c.norm_text.as_str()))
            .collect();
        let new_cells: BTreeMap<(i64, i64), &str> = new
            .cells
            .iter()
            .map(|c| ((c.r, c.c), c.norm_text.as_str()))
            .collect();
        let addresses: BTreeSet<(i64, i64)> =
            old_cells.keys().chain(new_cells.keys()).copied().collect();
        for (r, c) in addresses {
            let before = normalize_text(old_cells.get(&(r, c)).unwrap_or(&""));
            let after = normalize_text(new_cells.get(&(r, c)).unwrap_or(&""));
            if before == after {
                continue;
            }
            changes.push(Change {
                kind: "table.cell_changed".to_string(),
                target_id: new.table_id.clone(),
                detail: json!({"r": r, "c": c, "before": before, "after": after}),
            });
        }
    }
    changes
}

fn diff_code(prev: &ScreenState, state: &ScreenState) -> Vec<Change> {
    let prev_blocks: BTreeMap<&str, _> = prev
        .code_blocks
        .iter()
        .map(|b| (b.code_id.as_str(), b))
        .collect();
    let blocks: BTreeMap<&str, _> = state
        .code_blocks
        .iter()
        .map(|b| (b.code_id.as_str(), b))
        .collect();
    let mut changes = Vec::new();
    for code_id in prev_blocks.keys().filter(|k| blocks.contains_key(*k)) {
        let old = prev_blocks[code_id];
        let new = blocks[code_id];
        if old.text == new.text {
            continue;
        }
        changes.push(Change {
            kind: "code.changed".to_string(),
            target_id: code_id.to_string(),
            detail: json!({"changes": line_opcodes(&old.lines, &new.lines)}),
        });
    }
    changes
}

fn diff_charts(prev: &ScreenState, state: &ScreenState) -> Vec<Change> {
    let prev_charts: BTreeMap<&str, _> = prev
        .charts
        .iter()
        .map(|c| (c.chart_id.as_str(), c))
        .collect();
    let charts: BTreeMap<&str, _> =
        state.charts.iter().map(|c| (c.chart_id.as_str(), c)).collect();
    let mut changes = Vec::new();
    for chart_id in prev_charts.keys().filter(|k| charts.contains_key(*k)) {
        let old = prev_charts[chart_id];
        let new = charts[chart_id];
        if old.ticks_y == new.ticks_y {
            continue;
        }
        changes.push(Change {
            kind: "chart.ticks_changed".to_string(),
            target_id: chart_id.to_string(),
            detail: json!({"before": old.ticks_y, "after": new.ticks_y}),
        });
    }
    changes
}

/// Line-level opcodes (`replace`/`delete`/`insert`) from an LCS alignment.
pub fn line_opcodes(old_lines: &[String], new_lines: &[String]) -> Vec<Value> {
    let n = old_lines.len();
    let m = new_lines.len();
    // LCS table over line equality.
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old_lines[i] == new_lines[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }
    let mut ops = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < n || j < m {
        if i < n && j < m && old_lines[i] == new_lines[j] {
            i += 1;
            j += 1;
            continue;
        }
        let (i1, j1) = (i, j);
        while i < n || j < m {
            if i < n && j < m && old_lines[i] == new_lines[j] {
                break;
            }
            if i < n && (j >= m || lcs[i + 1][j] >= lcs[i][j + 1]) {
                i += 1;
            } else if j < m {
                j += 1;
            }
        }
        let tag = if i1 < i && j1 < j {
            "replace"
        } else if i1 < i {
            "delete"
        } else {
            "insert"
        };
        ops.push(json!({
            "tag": tag,
            "old": old_lines[i1..i],
            "new": new_lines[j1..j],
            "i1": i1,
            "i2": i,
            "j1": j1,
            "j2": j,
        }));
    }
    ops
}

fn summarize(changes: &[Change]) -> BTreeMap<String, i64> {
    let mut summary: BTreeMap<String, i64> = [
        ("element_added", 0),
        ("element_removed", 0),
        ("element_changed", 0),
        ("table_cell_changed", 0),
        ("code_changed", 0),
        ("chart_changed", 0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    summary.insert("total_changes".to_string(), changes.len() as i64);
    for change in changes {
        let key = match change.kind.as_str() {
            "element.added" => "element_added",
            "element.removed" => "element_removed",
            "element.changed" => "element_changed",
            "table.cell_changed" => "table_cell_changed",
            "code.changed" => "code_changed",
            "chart.ticks_changed" => "chart_changed",
            _ => continue,
        };
        *summary.get_mut(key).expect("summary key") += 1;
    }
    summary
}

fn delta_id(
    from_state_id: &str,
    to_state_id: &str,
    summary: &BTreeMap<String, i64>,
    changes: &[Change],
) -> String {
    let change_hashes: Vec<String> = changes
        .iter()
        .map(|c| {
            hash_serialize(&json!({"k": c.kind, "t": c.target_id, "d": c.detail}))
        })
        .collect();
    let key = json!({
        "from": from_state_id,
        "to": to_state_id,
        "summary": summary,
        "change_hashes": change_hashes,
    });
    let digest = hash_serialize(&key);
    encode_component(&format!(
        "delta-{from_state_id}-{to_state_id}-{}",
        &digest[..20]
    ))
}
