//! OCR aggregation across providers.

use std::collections::BTreeMap;

use canonical::{encode_component, normalize_text};
use serde_json::json;
use tracing::debug;

use crate::frame::Patch;
use crate::providers::{ExtractorRegistry, RawToken, RunLimits};
use crate::types::{Diagnostic, Token, TokenFlags};
use crate::util::{bbox_iou, bp_clamp, BBox};

fn is_number(text: &str) -> bool {
    let mut parts = text.splitn(2, '.');
    let int_part = parts.next().unwrap_or_default();
    let frac_part = parts.next();
    !int_part.is_empty()
        && int_part.chars().all(|c| c.is_ascii_digit())
        && frac_part.is_none_or(|f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
}

fn monospace_hint(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lengths: std::collections::BTreeSet<usize> =
        text.split_whitespace().map(str::len).collect();
    lengths.len() <= 2 && text.chars().any(|c| matches!(c, '_' | '{' | '}' | ';'))
}

fn token(
    provider_id: &str,
    patch_id: &str,
    idx: usize,
    text: String,
    bbox: BBox,
    confidence_bp: i64,
    source: &str,
) -> Token {
    let norm = normalize_text(&text);
    Token {
        token_id: encode_component(&format!("tok-{provider_id}-{patch_id}-{idx:05}")),
        flags: TokenFlags {
            monospace_likely: monospace_hint(&text),
            is_number: is_number(&norm),
        },
        text,
        norm_text: norm,
        bbox,
        confidence_bp: bp_clamp(confidence_bp),
        source: source.to_string(),
        provider_id: provider_id.to_string(),
        patch_id: patch_id.to_string(),
        line_id: None,
        block_id: None,
    }
}

fn patch_to_frame_bbox(
    token_bbox: Option<BBox>,
    patch_bbox: BBox,
    frame_width: i64,
    frame_height: i64,
) -> BBox {
    let Some((px1, py1, px2, py2)) = token_bbox else {
        return patch_bbox;
    };
    let (ox1, oy1, _, _) = patch_bbox;
    let mut x1 = (ox1 + px1).clamp(0, frame_width);
    let mut y1 = (oy1 + py1).clamp(0, frame_height);
    let mut x2 = (ox1 + px2).clamp(0, frame_width);
    let mut y2 = (oy1 + py2).clamp(0, frame_height);
    if x2 < x1 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y2 < y1 {
        std::mem::swap(&mut y1, &mut y2);
    }
    (x1, y1, x2, y2)
}

fn approx_token_bbox(
    patch_bbox: BBox,
    line_no: i64,
    line_count: i64,
    word_no: i64,
    word_count: i64,
) -> BBox {
    let (x1, y1, x2, y2) = patch_bbox;
    let width = (x2 - x1).max(1);
    let height = (y2 - y1).max(1);
    let line_h = (height / line_count.max(1)).max(1);
    let word_w = (width / word_count.max(1)).max(1);
    let ty1 = y1 + line_no * line_h;
    let ty2 = (ty1 + line_h).min(y2);
    let tx1 = x1 + word_no * word_w;
    let tx2 = (tx1 + word_w).min(x2);
    (tx1, ty1, tx2, ty2)
}

fn tokens_from_provider(
    provider: &dyn crate::providers::TextExtractor,
    provider_id: &str,
    patch: &Patch,
    frame_width: i64,
    frame_height: i64,
) -> Result<Vec<Token>, crate::SstError> {
    let mut out = Vec::new();
    let raw: Vec<RawToken> = provider.extract_tokens(&patch.image_png)?;
    for (idx, item) in raw.iter().enumerate() {
        let bbox = patch_to_frame_bbox(item.bbox, patch.bbox, frame_width, frame_height);
        out.push(token(
            provider_id,
            &patch.patch_id,
            idx,
            item.text.clone(),
            bbox,
            item.confidence_bp,
            "ocr",
        ));
    }
    if !out.is_empty() {
        return Ok(out);
    }

    // Text-only provider: approximate per-word boxes from patch geometry.
    let text = provider.extract_text(&patch.image_png)?;
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let line_count = lines.len() as i64;
    let mut idx = 0;
    for (line_no, line) in lines.iter().enumerate() {
        let words: Vec<&str> = line.split_whitespace().collect();
        let word_count = words.len() as i64;
        for (word_no, word) in words.iter().enumerate() {
            let bbox = approx_token_bbox(
                patch.bbox,
                line_no as i64,
                line_count,
                word_no as i64,
                word_count,
            );
            out.push(token(
                provider_id,
                &patch.patch_id,
                idx,
                (*word).to_string(),
                bbox,
                6500,
                "ocr",
            ));
            idx += 1;
        }
    }
    Ok(out)
}

/// Call every registered provider over the selected patches, normalize and
/// postprocess the tokens (confidence filter, per-text NMS, stable sort,
/// cap). Abort/deadline are honored between provider calls with whatever
/// has been gathered so far.
#[allow(clippy::too_many_arguments)]
pub fn run_ocr_tokens(
    patches: &[Patch],
    registry: &ExtractorRegistry,
    frame_width: i64,
    frame_height: i64,
    min_conf_bp: i64,
    nms_iou_bp: i64,
    max_tokens: usize,
    max_patches: usize,
    allow_ocr: bool,
    limits: &RunLimits,
) -> (Vec<Token>, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();
    if !allow_ocr || registry.is_empty() {
        diagnostics.push(Diagnostic::with_detail("ocr.skipped", "ocr disabled or missing"));
        return (Vec::new(), diagnostics);
    }
    let selected = &patches[..patches.len().min(max_patches.max(1))];
    let mut tokens: Vec<Token> = Vec::new();
    for (provider_id, provider) in registry.iter() {
        for patch in selected {
            if limits.aborted() {
                diagnostics.push(Diagnostic::with_detail("ocr.aborted", provider_id));
                return (
                    postprocess_tokens(tokens, min_conf_bp, nms_iou_bp, max_tokens),
                    diagnostics,
                );
            }
            if limits.past_deadline() {
                diagnostics.push(Diagnostic::with_detail("ocr.deadline", provider_id));
                return (
                    postprocess_tokens(tokens, min_conf_bp, nms_iou_bp, max_tokens),
                    diagnostics,
                );
            }
            match tokens_from_provider(provider.as_ref(), provider_id, patch, frame_width, frame_height)
            {
                Ok(mut provider_tokens) => tokens.append(&mut provider_tokens),
                Err(err) => {
                    debug!(provider_id, %err, "ocr provider failed");
                    diagnostics.push(Diagnostic::with_detail(
                        "ocr.error",
                        format!("{provider_id}: {err}"),
                    ));
                }
            }
        }
    }
    (
        postprocess_tokens(tokens, min_conf_bp, nms_iou_bp, max_tokens),
        diagnostics,
    )
}

fn postprocess_tokens(
    tokens: Vec<Token>,
    min_conf_bp: i64,
    nms_iou_bp: i64,
    max_tokens: usize,
) -> Vec<Token> {
    let mut filtered: Vec<Token> = tokens
        .into_iter()
        .filter(|t| t.confidence_bp >= min_conf_bp && !t.norm_text.is_empty())
        .collect();
    filtered.sort_by(|a, b| {
        (a.bbox.1, a.bbox.0, &a.norm_text, &a.token_id)
            .cmp(&(b.bbox.1, b.bbox.0, &b.norm_text, &b.token_id))
    });
    let mut deduped = nms_by_text(filtered, nms_iou_bp);
    deduped.sort_by(|a, b| {
        (a.bbox.1, a.bbox.0, a.bbox.2, &a.token_id).cmp(&(b.bbox.1, b.bbox.0, b.bbox.2, &b.token_id))
    });
    deduped.truncate(max_tokens.max(1));
    deduped
}

/// Per-text non-maximum suppression: within a `norm_text` group, overlapping
/// boxes keep only the highest-confidence token.
fn nms_by_text(tokens: Vec<Token>, nms_iou_bp: i64) -> Vec<Token> {
    let threshold = (nms_iou_bp as f64 / 10_000.0).clamp(0.0, 1.0);
    let mut grouped: BTreeMap<String, Vec<Token>> = BTreeMap::new();
    for token in tokens {
        grouped.entry(token.norm_text.clone()).or_default().push(token);
    }
    let mut kept = Vec::new();
    for (_norm, mut group) in grouped {
        group.sort_by(|a, b| {
            (-a.confidence_bp, a.bbox.1, a.bbox.0, &a.token_id)
                .cmp(&(-b.confidence_bp, b.bbox.1, b.bbox.0, &b.token_id))
        });
        let mut local: Vec<Token> = Vec::new();
        for token in group {
            if local.iter().any(|prev| bbox_iou(token.bbox, prev.bbox) >= threshold) {
                continue;
            }
            local.push(token);
        }
        kept.extend(local);
    }
    kept
}

/// Full-frame text tokens from vision-language providers.
pub fn vlm_tokens(
    registry: Option<&ExtractorRegistry>,
    frame_png: &[u8],
    frame_width: i64,
    frame_height: i64,
    allow_vlm: bool,
    limits: &RunLimits,
) -> Vec<Token> {
    let Some(registry) = registry.filter(|r| allow_vlm && !r.is_empty()) else {
        return Vec::new();
    };
    let mut tokens = Vec::new();
    for (provider_id, provider) in registry.iter() {
        if limits.aborted() || limits.past_deadline() {
            break;
        }
        let Ok(raw) = provider.extract_text(frame_png) else {
            continue;
        };
        let text = normalize_text(&raw);
        if text.is_empty() {
            continue;
        }
        let digest = crate::util::hash_canonical_value(&json!(text));
        tokens.push(Token {
            token_id: encode_component(&format!("vlm-{provider_id}-{}", &digest[..12])),
            text: text.clone(),
            norm_text: text,
            bbox: (0, 0, frame_width, frame_height),
            confidence_bp: 6000,
            source: "vlm".to_string(),
            flags: TokenFlags {
                monospace_likely: false,
                is_number: false,
            },
            provider_id: provider_id.to_string(),
            patch_id: "full_frame".to_string(),
            line_id: None,
            block_id: None,
        });
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SstError;
    use std::sync::Arc;

    struct FixedTokens(Vec<RawToken>);

    impl crate::providers::TextExtractor for FixedTokens {
        fn extract_tokens(&self, _png: &[u8]) -> Result<Vec<RawToken>, SstError> {
            Ok(self.0.clone())
        }
        fn extract_text(&self, _png: &[u8]) -> Result<String, SstError> {
            Ok(String::new())
        }
    }

    struct TextOnly(&'static str);

    impl crate::providers::TextExtractor for TextOnly {
        fn extract_text(&self, _png: &[u8]) -> Result<String, SstError> {
            Ok(self.0.to_string())
        }
    }

    fn patch() -> Patch {
        Patch {
            patch_id: "full_frame".to_string(),
            bbox: (0, 0, 200, 100),
            width: 200,
            height: 100,
            image_png: Vec::new(),
        }
    }

    fn raw(text: &str, bbox: BBox, conf: i64) -> RawToken {
        RawToken {
            text: text.to_string(),
            bbox: Some(bbox),
            confidence_bp: conf,
        }
    }

    #[test]
    fn tokens_are_filtered_sorted_and_capped() {
        let mut registry = ExtractorRegistry::new();
        registry.register(
            "ocr.a",
            Arc::new(FixedTokens(vec![
                raw("low", (0, 0, 10, 10), 1000),
                raw("beta", (50, 0, 80, 10), 9000),
                raw("alpha", (0, 0, 30, 10), 9000),
            ])),
        );
        let (tokens, _diag) = run_ocr_tokens(
            &[patch()],
            &registry,
            200,
            100,
            3500,
            7000,
            4000,
            64,
            true,
            &RunLimits::none(),
        );
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].norm_text, "alpha");
        assert_eq!(tokens[1].norm_text, "beta");
    }

    #[test]
    fn nms_dedupes_same_text_overlaps() {
        let mut registry = ExtractorRegistry::new();
        registry.register(
            "ocr.a",
            Arc::new(FixedTokens(vec![
                raw("dup", (0, 0, 20, 10), 9000),
                raw("dup", (1, 0, 21, 10), 8000),
                raw("dup", (100, 50, 120, 60), 7000),
            ])),
        );
        let (tokens, _) = run_ocr_tokens(
            &[patch()],
            &registry,
            200,
            100,
            3500,
            7000,
            4000,
            64,
            true,
            &RunLimits::none(),
        );
        // Two survivors: the overlapping pair collapses to its best.
        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().any(|t| t.confidence_bp == 9000));
        assert!(tokens.iter().all(|t| t.confidence_bp != 8000));
    }

    #[test]
    fn text_only_provider_gets_approximate_boxes() {
        let mut registry = ExtractorRegistry::new();
        registry.register("ocr.plain", Arc::new(TextOnly("hello world\nsecond line")));
        let (tokens, _) = run_ocr_tokens(
            &[patch()],
            &registry,
            200,
            100,
            3500,
            7000,
            4000,
            64,
            true,
            &RunLimits::none(),
        );
        assert_eq!(tokens.len(), 4);
        let hello = tokens.iter().find(|t| t.norm_text == "hello").unwrap();
        let second = tokens.iter().find(|t| t.norm_text == "second").unwrap();
        assert!(hello.bbox.1 < second.bbox.1);
    }

    #[test]
    fn disabled_ocr_reports_skip() {
        let registry = ExtractorRegistry::new();
        let (tokens, diag) = run_ocr_tokens(
            &[patch()],
            &registry,
            200,
            100,
            3500,
            7000,
            4000,
            64,
            true,
            &RunLimits::none(),
        );
        assert!(tokens.is_empty());
        assert_eq!(diag[0].kind, "ocr.skipped");
    }

    #[test]
    fn provider_order_is_sorted_and_deterministic() {
        let mut registry = ExtractorRegistry::new();
        registry.register("ocr.b", Arc::new(FixedTokens(vec![raw("b", (0, 20, 10, 30), 9000)])));
        registry.register("ocr.a", Arc::new(FixedTokens(vec![raw("a", (0, 0, 10, 10), 9000)])));
        let run = || {
            run_ocr_tokens(
                &[patch()],
                &registry,
                200,
                100,
                3500,
                7000,
                4000,
                64,
                true,
                &RunLimits::none(),
            )
            .0
        };
        let first = run();
        let second = run();
        assert_eq!(first, second);
        assert!(first[0].token_id.starts_with("rid_"));
    }
}
