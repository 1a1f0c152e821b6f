//! Layout assembly: tokens into lines, lines into blocks.

use canonical::normalize_text;

use crate::types::{TextBlock, TextLine, Token};
use crate::util::bbox_union;

/// Cluster tokens into text lines by y-center proximity, then lines into
/// blocks by vertical gap and left-edge alignment. Tokens are annotated
/// with their `line_id`/`block_id` in place.
pub fn assemble_layout(
    tokens: &mut [Token],
    line_y_threshold_px: i64,
    block_gap_px: i64,
    align_tolerance_px: i64,
) -> (Vec<TextLine>, Vec<TextBlock>) {
    if tokens.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let mut order: Vec<usize> = (0..tokens.len()).collect();
    order.sort_by(|&a, &b| {
        (tokens[a].bbox.1, tokens[a].bbox.0, &tokens[a].token_id)
            .cmp(&(tokens[b].bbox.1, tokens[b].bbox.0, &tokens[b].token_id))
    });
    let mut heights: Vec<i64> = tokens
        .iter()
        .map(|t| (t.bbox.3 - t.bbox.1).max(1))
        .collect();
    heights.sort_unstable();
    let median_h = heights[heights.len() / 2];
    let line_thresh = line_y_threshold_px.max(median_h / 2).max(1);

    struct LineAcc {
        token_idx: Vec<usize>,
        mid_y: i64,
        count: i64,
    }
    let mut lines: Vec<LineAcc> = Vec::new();
    for &idx in &order {
        let bbox = tokens[idx].bbox;
        let mid_y = (bbox.1 + bbox.3) / 2;
        let mut placed = false;
        for line in lines.iter_mut() {
            if (mid_y - line.mid_y).abs() <= line_thresh {
                line.token_idx.push(idx);
                line.mid_y = (line.mid_y * line.count + mid_y) / (line.count + 1);
                line.count += 1;
                placed = true;
                break;
            }
        }
        if !placed {
            lines.push(LineAcc {
                token_idx: vec![idx],
                mid_y,
                count: 1,
            });
        }
    }

    let mut line_out: Vec<TextLine> = Vec::new();
    for (line_no, line) in lines.iter_mut().enumerate() {
        line.token_idx.sort_by(|&a, &b| {
            (tokens[a].bbox.0, tokens[a].bbox.2, &tokens[a].token_id)
                .cmp(&(tokens[b].bbox.0, tokens[b].bbox.2, &tokens[b].token_id))
        });
        let line_id = format!("line-{line_no:04}");
        let bbox = bbox_union(line.token_idx.iter().map(|&i| tokens[i].bbox));
        let text = line
            .token_idx
            .iter()
            .map(|&i| tokens[i].text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        for &i in &line.token_idx {
            tokens[i].line_id = Some(line_id.clone());
        }
        line_out.push(TextLine {
            line_id,
            token_ids: line.token_idx.iter().map(|&i| tokens[i].token_id.clone()).collect(),
            bbox,
            text: normalize_text(&text),
        });
    }
    line_out.sort_by(|a, b| {
        (a.bbox.1, a.bbox.0, &a.line_id).cmp(&(b.bbox.1, b.bbox.0, &b.line_id))
    });

    struct BlockAcc {
        lines: Vec<usize>,
        x1: i64,
        y2: i64,
    }
    let mut blocks: Vec<BlockAcc> = Vec::new();
    for (idx, line) in line_out.iter().enumerate() {
        match blocks.last_mut() {
            Some(prev) => {
                let gap = (line.bbox.1 - prev.y2).max(0);
                let aligned = (line.bbox.0 - prev.x1).abs() <= align_tolerance_px;
                if gap <= block_gap_px && aligned {
                    prev.lines.push(idx);
                    prev.y2 = prev.y2.max(line.bbox.3);
                    continue;
                }
                blocks.push(BlockAcc {
                    lines: vec![idx],
                    x1: line.bbox.0,
                    y2: line.bbox.3,
                });
            }
            None => blocks.push(BlockAcc {
                lines: vec![idx],
                x1: line.bbox.0,
                y2: line.bbox.3,
            }),
        }
    }

    let mut block_out: Vec<TextBlock> = Vec::new();
    for (block_no, block) in blocks.iter().enumerate() {
        let block_id = format!("block-{block_no:04}");
        let bbox = bbox_union(block.lines.iter().map(|&i| line_out[i].bbox));
        let text = block
            .lines
            .iter()
            .map(|&i| line_out[i].text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let line_ids: Vec<String> = block
            .lines
            .iter()
            .map(|&i| line_out[i].line_id.clone())
            .collect();
        for token in tokens.iter_mut() {
            if let Some(line_id) = &token.line_id {
                if line_ids.contains(line_id) {
                    token.block_id = Some(block_id.clone());
                }
            }
        }
        block_out.push(TextBlock {
            block_id,
            line_ids,
            bbox,
            text: normalize_text(&text),
        });
    }
    block_out.sort_by(|a, b| {
        (a.bbox.1, a.bbox.0, &a.block_id).cmp(&(b.bbox.1, b.bbox.0, &b.block_id))
    });
    (line_out, block_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenFlags;

    fn token(id: &str, text: &str, bbox: crate::util::BBox) -> Token {
        Token {
            token_id: id.to_string(),
            text: text.to_string(),
            norm_text: text.to_string(),
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

    #[test]
    fn words_on_one_row_form_a_line() {
        let mut tokens = vec![
            token("t2", "world", (60, 10, 110, 22)),
            token("t1", "hello", (10, 10, 55, 22)),
        ];
        let (lines, blocks) = assemble_layout(&mut tokens, 12, 28, 48);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "hello world");
        assert_eq!(blocks.len(), 1);
        assert_eq!(tokens[0].line_id.as_deref(), Some("line-0000"));
        assert_eq!(tokens[0].block_id.as_deref(), Some("block-0000"));
    }

    #[test]
    fn distant_rows_split_into_blocks() {
        let mut tokens = vec![
            token("t1", "top", (10, 10, 40, 22)),
            token("t2", "bottom", (10, 200, 60, 212)),
        ];
        let (lines, blocks) = assemble_layout(&mut tokens, 12, 28, 48);
        assert_eq!(lines.len(), 2);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text, "top");
        assert_eq!(blocks[1].text, "bottom");
    }

    #[test]
    fn close_aligned_rows_share_a_block() {
        let mut tokens = vec![
            token("t1", "first", (10, 10, 60, 22)),
            token("t2", "second", (12, 30, 70, 42)),
        ];
        let (_lines, blocks) = assemble_layout(&mut tokens, 12, 28, 48);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "first second");
    }
}
