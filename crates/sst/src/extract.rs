//! Deterministic structure extractors: tables, spreadsheets, code, charts.

use std::sync::OnceLock;

use canonical::{encode_component, normalize_text};
use regex::Regex;

use crate::types::{
    ActiveCell, Cell, Chart, ChartEvidence, CodeBlock, FormulaBar, Merge, SheetHeaders, Table,
    TextLine, Token,
};
use crate::util::{bbox_union, mid_in_bbox, BBox};

fn re_col() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]{1,3}$").expect("static regex"))
}

fn re_row() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]{1,5}$").expect("static regex"))
}

fn re_cell_ref() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]{1,3}[0-9]{1,5}$").expect("static regex"))
}

fn re_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]+(\.[0-9]+)?$").expect("static regex"))
}

fn re_sql() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(SELECT|FROM|WHERE|JOIN|GROUP|ORDER|INSERT|UPDATE|DELETE)\b")
            .expect("static regex")
    })
}

fn re_code_punct() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[{}();=]").expect("static regex"))
}

struct Row<'a> {
    tokens: Vec<&'a Token>,
    center_y: i64,
}

fn cluster_rows<'a>(tokens: &'a [Token], row_gap_px: i64) -> Vec<Row<'a>> {
    let mut ordered: Vec<&Token> = tokens.iter().collect();
    ordered.sort_by(|a, b| {
        (a.bbox.1, a.bbox.0, &a.token_id).cmp(&(b.bbox.1, b.bbox.0, &b.token_id))
    });
    let mut rows: Vec<Row> = Vec::new();
    for token in ordered {
        let mid = (token.bbox.1 + token.bbox.3) / 2;
        match rows.last_mut() {
            Some(prev) if (mid - prev.center_y).abs() <= row_gap_px => {
                prev.tokens.push(token);
                prev.center_y = (prev.center_y + mid) / 2;
            }
            _ => rows.push(Row {
                tokens: vec![token],
                center_y: mid,
            }),
        }
    }
    for row in rows.iter_mut() {
        row.tokens.sort_by(|a, b| {
            (a.bbox.0, a.bbox.1, &a.token_id).cmp(&(b.bbox.0, b.bbox.1, &b.token_id))
        });
    }
    rows
}

fn cluster_cols(rows: &[Row<'_>], col_gap_px: i64) -> Vec<i64> {
    let mut centers: Vec<i64> = Vec::new();
    for row in rows {
        for token in &row.tokens {
            let mid_x = (token.bbox.0 + token.bbox.2) / 2;
            let mut placed = false;
            for center in centers.iter_mut() {
                if (mid_x - *center).abs() <= col_gap_px {
                    *center = (*center + mid_x) / 2;
                    placed = true;
                    break;
                }
            }
            if !placed {
                centers.push(mid_x);
            }
        }
    }
    centers.sort_unstable();
    centers.dedup();
    centers
}

fn edges_from_centers(centers: &[i64]) -> Vec<i64> {
    if centers.is_empty() {
        return vec![0, 1];
    }
    let mut edges = vec![(centers[0] - 1).max(0)];
    for pair in centers.windows(2) {
        edges.push((pair[0] + pair[1]) / 2);
    }
    edges.push(centers[centers.len() - 1] + 1);
    for idx in 1..edges.len() {
        if edges[idx] <= edges[idx - 1] {
            edges[idx] = edges[idx - 1] + 1;
        }
    }
    edges
}

fn mean_conf_bp(tokens: &[&Token]) -> i64 {
    if tokens.is_empty() {
        return 0;
    }
    tokens.iter().map(|t| t.confidence_bp).sum::<i64>() / tokens.len() as i64
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn cells_to_csv(cells: &[Cell], rows: i64, cols: i64) -> String {
    let mut grid = vec![vec![String::new(); cols as usize]; rows as usize];
    for cell in cells {
        if cell.r >= 0 && cell.r < rows && cell.c >= 0 && cell.c < cols {
            grid[cell.r as usize][cell.c as usize] = cell.text.clone();
        }
    }
    grid.iter()
        .map(|row| row.iter().map(|f| csv_escape(f)).collect::<Vec<_>>().join(","))
        .collect::<Vec<_>>()
        .join("\n")
}

fn spanned_indices(start: i64, end: i64, edges: &[i64]) -> Vec<usize> {
    let mut indices = Vec::new();
    for idx in 0..edges.len().saturating_sub(1) {
        let a = edges[idx];
        let b = edges[idx + 1];
        if end <= a || start >= b {
            continue;
        }
        indices.push(idx);
    }
    indices
}

fn detect_merges(tokens: &[Token], row_edges: &[i64], col_edges: &[i64]) -> Vec<Merge> {
    let row_count = row_edges.len().saturating_sub(1) as i64;
    let col_count = col_edges.len().saturating_sub(1) as i64;
    let mut merges = std::collections::BTreeSet::new();
    for token in tokens {
        if token.norm_text.is_empty() {
            continue;
        }
        let rows = spanned_indices(token.bbox.1, token.bbox.3, row_edges);
        let cols = spanned_indices(token.bbox.0, token.bbox.2, col_edges);
        if rows.len() <= 1 && cols.len() <= 1 {
            continue;
        }
        let (r1, r2) = (*rows.first().unwrap_or(&0) as i64, *rows.last().unwrap_or(&0) as i64);
        let (c1, c2) = (*cols.first().unwrap_or(&0) as i64, *cols.last().unwrap_or(&0) as i64);
        if r1 <= r2 && r2 < row_count && c1 <= c2 && c2 < col_count {
            merges.insert((r1, c1, r2, c2));
        }
    }
    merges
        .into_iter()
        .map(|(r1, c1, r2, c2)| Merge { r1, c1, r2, c2 })
        .collect()
}

/// Cluster tokens into a row/column grid. Returns at most one table.
#[allow(clippy::too_many_arguments)]
pub fn extract_tables(
    tokens: &[Token],
    state_id: &str,
    min_rows: usize,
    min_cols: usize,
    max_cells: usize,
    row_gap_px: i64,
    col_gap_px: i64,
) -> Vec<Table> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let rows = cluster_rows(tokens, row_gap_px);
    if rows.len() < min_rows {
        return Vec::new();
    }
    let col_centers = cluster_cols(&rows, col_gap_px);
    if col_centers.len() < min_cols {
        return Vec::new();
    }
    let col_edges = edges_from_centers(&col_centers);
    let row_centers: Vec<i64> = rows.iter().map(|r| r.center_y).collect();
    let row_edges = edges_from_centers(&row_centers);
    let rows_n = row_edges.len().saturating_sub(1) as i64;
    let cols_n = col_edges.len().saturating_sub(1) as i64;
    if rows_n * cols_n <= 0 || rows_n * cols_n > max_cells as i64 {
        return Vec::new();
    }

    let mut cells = Vec::new();
    for r in 0..rows_n {
        for c in 0..cols_n {
            let cell_bbox: BBox = (
                col_edges[c as usize],
                row_edges[r as usize],
                col_edges[(c + 1) as usize],
                row_edges[(r + 1) as usize],
            );
            let mut members: Vec<&Token> = tokens
                .iter()
                .filter(|t| mid_in_bbox(t.bbox, cell_bbox))
                .collect();
            members.sort_by(|a, b| {
                (a.bbox.1, a.bbox.0, &a.token_id).cmp(&(b.bbox.1, b.bbox.0, &b.token_id))
            });
            let text = members
                .iter()
                .map(|t| t.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            cells.push(Cell {
                r,
                c,
                bbox: cell_bbox,
                norm_text: normalize_text(&text),
                confidence_bp: mean_conf_bp(&members),
                text,
            });
        }
    }
    let table_bbox = bbox_union(cells.iter().map(|c| c.bbox));
    let table_id = encode_component(&format!("table-{state_id}-{table_bbox:?}"));
    let csv = cells_to_csv(&cells, rows_n, cols_n);
    let merges = detect_merges(tokens, &row_edges, &col_edges);
    vec![Table {
        table_id,
        state_id: state_id.to_string(),
        bbox: table_bbox,
        rows: rows_n,
        cols: cols_n,
        row_y: row_edges,
        col_x: col_edges,
        merges,
        cells,
        csv,
        kind: "table".to_string(),
        active_cell: None,
        formula_bar: None,
        headers: None,
    }]
}

fn col_to_index(col: &str) -> i64 {
    let mut value: i64 = 0;
    for ch in col.chars() {
        if !ch.is_ascii_uppercase() {
            return -1;
        }
        value = value * 26 + (ch as i64 - 'A' as i64 + 1);
    }
    value - 1
}

fn detect_active_cell(tokens: &[Token], table: &Table) -> Option<ActiveCell> {
    if table.rows == 0 || table.cols == 0 {
        return None;
    }
    let mut candidates: Vec<&Token> = tokens
        .iter()
        .filter(|t| re_cell_ref().is_match(&t.norm_text))
        .collect();
    candidates.sort_by(|a, b| {
        (a.bbox.1, a.bbox.0, &a.token_id).cmp(&(b.bbox.1, b.bbox.0, &b.token_id))
    });
    for token in candidates {
        let cell_ref = token.norm_text.to_uppercase();
        let col_part: String = cell_ref.chars().filter(|c| c.is_ascii_alphabetic()).collect();
        let row_part: String = cell_ref.chars().filter(|c| c.is_ascii_digit()).collect();
        if col_part.is_empty() || row_part.is_empty() {
            continue;
        }
        let col_idx = col_to_index(&col_part);
        let Ok(row_num) = row_part.parse::<i64>() else {
            continue;
        };
        let row_idx = row_num - 1;
        if col_idx < 0 || row_idx < 0 || col_idx >= table.cols || row_idx >= table.rows {
            continue;
        }
        if let Some(cell) = table.cells.iter().find(|c| c.r == row_idx && c.c == col_idx) {
            return Some(ActiveCell {
                r#ref: cell_ref,
                r: row_idx,
                c: col_idx,
                bbox: cell.bbox,
            });
        }
    }
    None
}

fn detect_formula_bar(tokens: &[Token], table: &Table) -> Option<FormulaBar> {
    let (_, y1, _, y2) = table.bbox;
    let height = (y2 - y1).max(1);
    let upper_limit = y1 + (height / 4).max(1);
    let anchor = tokens.iter().find(|t| {
        let text = t.norm_text.to_lowercase();
        (text == "fx" || text == "f(x)") && t.bbox.1 <= upper_limit
    })?;
    let anchor_y = (anchor.bbox.1 + anchor.bbox.3) / 2;
    let mut line_tokens: Vec<&Token> = tokens
        .iter()
        .filter(|t| (((t.bbox.1 + t.bbox.3) / 2) - anchor_y).abs() <= 8)
        .collect();
    if line_tokens.is_empty() {
        return None;
    }
    line_tokens.sort_by(|a, b| (a.bbox.0, &a.token_id).cmp(&(b.bbox.0, &b.token_id)));
    let text = line_tokens
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    Some(FormulaBar {
        bbox: bbox_union(line_tokens.iter().map(|t| t.bbox)),
        text: normalize_text(&text),
    })
}

/// Promote a table to a spreadsheet when single-letter column headers and
/// numeric row headers are both present.
pub fn extract_spreadsheets(
    tokens: &[Token],
    tables: &[Table],
    state_id: &str,
    header_scan_rows: usize,
) -> Vec<Table> {
    if tokens.is_empty() || tables.is_empty() {
        return Vec::new();
    }
    let table = &tables[0];
    let rows = cluster_rows(tokens, 12);
    let header_rows = &rows[..rows.len().min(header_scan_rows.max(1))];
    let col_headers: std::collections::BTreeSet<String> = header_rows
        .iter()
        .flat_map(|row| row.tokens.iter())
        .filter(|t| re_col().is_match(&t.norm_text))
        .map(|t| t.norm_text.clone())
        .collect();
    let row_headers: std::collections::BTreeSet<String> = rows
        .iter()
        .flat_map(|row| row.tokens.iter())
        .filter(|t| re_row().is_match(&t.norm_text))
        .map(|t| t.norm_text.clone())
        .collect();
    if col_headers.is_empty() || row_headers.is_empty() {
        return Vec::new();
    }
    let mut sheet = table.clone();
    sheet.table_id = encode_component(&format!("sheet-{state_id}-{}", table.table_id));
    sheet.kind = "spreadsheet".to_string();
    sheet.active_cell = detect_active_cell(tokens, table);
    sheet.formula_bar = detect_formula_bar(tokens, table);
    sheet.headers = Some(SheetHeaders {
        columns: col_headers.into_iter().collect(),
        rows: row_headers.into_iter().collect(),
    });
    vec![sheet]
}

fn line_code_score(line: &TextLine) -> i64 {
    let mut score = 0;
    if re_sql().is_match(&line.text) {
        score += 2;
    }
    if re_code_punct().is_match(&line.text) {
        score += 1;
    }
    if line.text.contains('\t') || line.text.contains("    ") {
        score += 1;
    }
    score
}

fn indent_unit(tokens: &[Token]) -> i64 {
    let mut widths: Vec<i64> = tokens
        .iter()
        .filter(|t| !t.text.is_empty())
        .map(|t| {
            let width = (t.bbox.2 - t.bbox.0).max(1);
            (width / t.text.chars().count().max(1) as i64).max(1)
        })
        .collect();
    if widths.is_empty() {
        return 8;
    }
    widths.sort_unstable();
    widths[widths.len() / 2].max(4)
}

fn sql_balance_ok(text: &str) -> bool {
    let mut paren = 0i64;
    let mut single = 0u8;
    let mut double = 0u8;
    for ch in text.chars() {
        match ch {
            '(' => paren += 1,
            ')' => paren -= 1,
            '\'' => single ^= 1,
            '"' => double ^= 1,
            _ => {}
        }
    }
    paren == 0 && single == 0 && double == 0
}

/// Score lines for code-likeness and emit a single code block with inferred
/// indentation and a coarse language guess.
pub fn extract_code_blocks(
    tokens: &[Token],
    text_lines: &[TextLine],
    state_id: &str,
    min_keywords: usize,
) -> Vec<CodeBlock> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let code_lines: Vec<&TextLine> = text_lines
        .iter()
        .filter(|line| line_code_score(line) > 0)
        .collect();
    if code_lines.is_empty() {
        return Vec::new();
    }
    let keyword_hits = code_lines
        .iter()
        .filter(|line| re_sql().is_match(&line.text))
        .count();
    if keyword_hits < min_keywords && code_lines.len() < 3 {
        return Vec::new();
    }
    let mut lines_sorted = code_lines;
    lines_sorted.sort_by(|a, b| {
        (a.bbox.1, a.bbox.0, &a.line_id).cmp(&(b.bbox.1, b.bbox.0, &b.line_id))
    });
    let bbox = bbox_union(lines_sorted.iter().map(|l| l.bbox));
    let code_id = encode_component(&format!("code-{state_id}-{bbox:?}"));
    let unit = indent_unit(tokens);
    let token_map: std::collections::BTreeMap<&str, &Token> =
        tokens.iter().map(|t| (t.token_id.as_str(), t)).collect();

    let mut rendered = Vec::new();
    let mut line_numbers: Vec<Option<String>> = Vec::new();
    for line in &lines_sorted {
        let mut line_tokens: Vec<&Token> = line
            .token_ids
            .iter()
            .filter_map(|id| token_map.get(id.as_str()).copied())
            .collect();
        line_tokens.sort_by(|a, b| {
            (a.bbox.0, a.bbox.1, &a.token_id).cmp(&(b.bbox.0, b.bbox.1, &b.token_id))
        });
        let mut number = None;
        if let Some(first) = line_tokens.first() {
            if re_row().is_match(&first.norm_text) && line_tokens.len() > 1 {
                let num_width = first.bbox.2 - first.bbox.0;
                let line_width = (line.bbox.2 - line.bbox.0).max(1);
                if num_width <= (line_width / 5).max(6) {
                    number = Some(first.norm_text.clone());
                    line_tokens.remove(0);
                }
            }
        }
        line_numbers.push(number);
        let Some(first) = line_tokens.first() else {
            continue;
        };
        let indent_spaces = ((first.bbox.0 - bbox.0) / unit).max(0) as usize;
        let text = line_tokens
            .iter()
            .map(|t| t.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        rendered.push(format!("{}{}", " ".repeat(indent_spaces), normalize_text(&text)));
    }
    let code_text = rendered.join("\n").trim().to_string();
    let language = if re_sql().is_match(&code_text) { "sql" } else { "unknown" };
    let mut diagnostics = Vec::new();
    let mut confidence = if language == "sql" { 8500 } else { 6500 };
    if language == "sql" && !sql_balance_ok(&code_text) {
        diagnostics.push("sql_unbalanced".to_string());
        confidence = 4500;
    }
    vec![CodeBlock {
        code_id,
        state_id: state_id.to_string(),
        bbox,
        language: language.to_string(),
        text: code_text,
        lines: rendered,
        line_numbers,
        confidence_bp: confidence,
        diagnostics,
    }]
}

/// Numeric tick tokens in a shared region become a chart candidate.
pub fn extract_charts(tokens: &[Token], state_id: &str, min_ticks: usize) -> Vec<Chart> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let numeric: Vec<&Token> = tokens
        .iter()
        .filter(|t| re_number().is_match(&t.norm_text))
        .collect();
    if numeric.len() < min_ticks {
        return Vec::new();
    }
    let bbox = bbox_union(numeric.iter().map(|t| t.bbox));
    let ticks_y: Vec<String> = numeric[..numeric.len().min(min_ticks * 2)]
        .iter()
        .map(|t| t.norm_text.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    let chart_id = encode_component(&format!("chart-{state_id}-{bbox:?}"));
    vec![Chart {
        chart_id,
        state_id: state_id.to_string(),
        bbox,
        chart_type: "unknown".to_string(),
        labels: Vec::new(),
        ticks_x: Vec::new(),
        evidence: ChartEvidence {
            tick_count: ticks_y.len() as i64,
        },
        ticks_y,
        confidence_bp: 6000,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenFlags;

    fn token(id: &str, text: &str, bbox: BBox) -> Token {
        Token {
            token_id: id.to_string(),
            text: text.to_string(),
            norm_text: normalize_text(text),
            bbox,
            confidence_bp: 9000,
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

    fn grid_tokens() -> Vec<Token> {
        // 2x2 grid: rows at y=10 and y=60, columns at x=10 and x=150.
        vec![
            token("t00", "name", (10, 10, 60, 24)),
            token("t01", "count", (150, 10, 180, 24)),
            token("t10", "alpha", (10, 60, 60, 74)),
            token("t11", "42", (150, 60, 180, 74)),
        ]
    }

    #[test]
    fn grid_becomes_table_with_csv() {
        let tables = extract_tables(&grid_tokens(), "state-1", 2, 2, 2500, 18, 36);
        assert_eq!(tables.len(), 1);
        let table = &tables[0];
        assert_eq!(table.rows, 2);
        assert_eq!(table.cols, 2);
        assert_eq!(table.csv, "name,count\nalpha,42");
        assert_eq!(table.cells.len(), 4);
        assert_eq!(table.kind, "table");
    }

    #[test]
    fn table_extraction_is_deterministic() {
        let a = extract_tables(&grid_tokens(), "state-1", 2, 2, 2500, 18, 36);
        let b = extract_tables(&grid_tokens(), "state-1", 2, 2, 2500, 18, 36);
        assert_eq!(a, b);
    }

    #[test]
    fn too_few_rows_yields_nothing() {
        let tokens = vec![token("t0", "only", (10, 10, 60, 24))];
        assert!(extract_tables(&tokens, "s", 2, 2, 2500, 18, 36).is_empty());
    }

    #[test]
    fn spreadsheet_detected_from_headers() {
        let mut tokens = vec![
            token("h1", "A", (50, 5, 60, 15)),
            token("h2", "B", (150, 5, 160, 15)),
            token("r1", "1", (5, 30, 12, 42)),
            token("r2", "2", (5, 60, 12, 72)),
            token("v1", "x", (50, 30, 60, 42)),
            token("v2", "y", (150, 60, 160, 72)),
        ];
        tokens.push(token("ref", "B2", (200, 5, 220, 15)));
        let tables = extract_tables(&tokens, "s", 2, 2, 2500, 18, 36);
        assert!(!tables.is_empty());
        let sheets = extract_spreadsheets(&tokens, &tables, "s", 2);
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].kind, "spreadsheet");
        let headers = sheets[0].headers.as_ref().unwrap();
        assert!(headers.columns.contains(&"A".to_string()));
        assert!(headers.rows.contains(&"1".to_string()));
    }

    #[test]
    fn sql_lines_become_code_block() {
        let mut tokens = vec![
            token("t1", "SELECT", (10, 10, 80, 24)),
            token("t2", "name", (90, 10, 130, 24)),
            token("t3", "FROM", (10, 30, 60, 44)),
            token("t4", "users;", (70, 30, 130, 44)),
        ];
        let (lines, _blocks) = crate::layout::assemble_layout(&mut tokens, 12, 28, 48);
        let blocks = extract_code_blocks(&tokens, &lines, "s", 1);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, "sql");
        assert!(blocks[0].text.contains("SELECT name"));
        assert!(blocks[0].diagnostics.is_empty());
    }

    #[test]
    fn unbalanced_sql_is_flagged() {
        let mut tokens = vec![
            token("t1", "SELECT", (10, 10, 80, 24)),
            token("t2", "count(", (90, 10, 150, 24)),
        ];
        let (lines, _) = crate::layout::assemble_layout(&mut tokens, 12, 28, 48);
        let blocks = extract_code_blocks(&tokens, &lines, "s", 1);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].diagnostics, vec!["sql_unbalanced"]);
        assert_eq!(blocks[0].confidence_bp, 4500);
    }

    #[test]
    fn numeric_ticks_become_chart() {
        let tokens = vec![
            token("t1", "10", (10, 10, 30, 20)),
            token("t2", "20", (10, 40, 30, 50)),
            token("t3", "30", (10, 70, 30, 80)),
        ];
        let charts = extract_charts(&tokens, "s", 2);
        assert_eq!(charts.len(), 1);
        assert_eq!(charts[0].ticks_y, vec!["10", "20", "30"]);
        assert!(extract_charts(&tokens[..1], "s", 2).is_empty());
    }
}
