//! Geometry and scoring helpers.

use serde_json::Value;

/// Pixel-space bounding box `(x1, y1, x2, y2)`, serialized as an array.
pub type BBox = (i64, i64, i64, i64);

/// Clamp a basis-point value into `[0, 10000]`.
pub fn bp_clamp(value: i64) -> i64 {
    value.clamp(0, 10_000)
}

pub fn hamming_distance(a: &str, b: &str) -> usize {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return a.len().max(b.len());
    }
    a.chars().zip(b.chars()).filter(|(ca, cb)| ca != cb).count()
}

pub fn clamp_bbox(bbox: BBox, width: i64, height: i64) -> BBox {
    let (mut x1, mut y1, mut x2, mut y2) = (
        bbox.0.clamp(0, width),
        bbox.1.clamp(0, height),
        bbox.2.clamp(0, width),
        bbox.3.clamp(0, height),
    );
    if x2 < x1 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y2 < y1 {
        std::mem::swap(&mut y1, &mut y2);
    }
    (x1, y1, x2, y2)
}

pub fn bbox_area(bbox: BBox) -> i64 {
    (bbox.2 - bbox.0).max(0) * (bbox.3 - bbox.1).max(0)
}

pub fn bbox_iou(a: BBox, b: BBox) -> f64 {
    let ix1 = a.0.max(b.0);
    let iy1 = a.1.max(b.1);
    let ix2 = a.2.min(b.2);
    let iy2 = a.3.min(b.3);
    let inter = bbox_area((ix1, iy1, ix2, iy2));
    if inter <= 0 {
        return 0.0;
    }
    let union = bbox_area(a) + bbox_area(b) - inter;
    if union <= 0 {
        return 0.0;
    }
    inter as f64 / union as f64
}

pub fn bbox_union<I: IntoIterator<Item = BBox>>(bboxes: I) -> BBox {
    let mut iter = bboxes.into_iter();
    let Some(first) = iter.next() else {
        return (0, 0, 0, 0);
    };
    iter.fold(first, |acc, b| {
        (acc.0.min(b.0), acc.1.min(b.1), acc.2.max(b.2), acc.3.max(b.3))
    })
}

pub fn bbox_mid(bbox: BBox) -> (i64, i64) {
    ((bbox.0 + bbox.2) / 2, (bbox.1 + bbox.3) / 2)
}

pub fn mid_in_bbox(bbox: BBox, cell: BBox) -> bool {
    let (mx, my) = bbox_mid(bbox);
    cell.0 <= mx && mx < cell.2 && cell.1 <= my && my < cell.3
}

/// SHA-256 prefix over a serializable payload, used for compact identity
/// digests inside derived artifacts.
pub fn hash_canonical_value(value: &Value) -> String {
    canonical::sha256_canonical(value).unwrap_or_else(|_| canonical::sha256_text(&value.to_string()))
}

pub fn hash_serialize<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(v) => hash_canonical_value(&v),
        Err(_) => String::from("unhashable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        assert!((bbox_iou((0, 0, 10, 10), (0, 0, 10, 10)) - 1.0).abs() < 1e-9);
        assert_eq!(bbox_iou((0, 0, 10, 10), (20, 20, 30, 30)), 0.0);
    }

    #[test]
    fn union_spans_all() {
        assert_eq!(bbox_union([(0, 0, 2, 2), (5, 1, 9, 3)]), (0, 0, 9, 3));
        assert_eq!(bbox_union(Vec::<BBox>::new()), (0, 0, 0, 0));
    }

    #[test]
    fn clamp_normalizes_inverted_boxes() {
        assert_eq!(clamp_bbox((10, 10, 2, 2), 100, 100), (2, 2, 10, 10));
        assert_eq!(clamp_bbox((-5, -5, 200, 200), 100, 100), (0, 0, 100, 100));
    }

    #[test]
    fn hamming_handles_mismatched_lengths() {
        assert_eq!(hamming_distance("0101", "0111"), 1);
        assert_eq!(hamming_distance("01", "0111"), 4);
    }
}
