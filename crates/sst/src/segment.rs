//! Temporal segmentation: pHash distance plus a cheap pixel diff.

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use serde::Serialize;

use crate::util::hamming_distance;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SegmentDecision {
    pub boundary: bool,
    pub reason: String,
    pub phash_distance: usize,
    pub diff_score_bp: i64,
}

/// Decide whether this frame starts a new visual state. Returns the
/// decision plus the downscaled grayscale used for the next comparison.
#[allow(clippy::too_many_arguments)]
pub fn decide_boundary(
    phash: &str,
    prev_phash: Option<&str>,
    rgb: &RgbImage,
    prev_downscaled: Option<&[u8]>,
    d_stable: usize,
    d_boundary: usize,
    diff_threshold_bp: i64,
    downscale_px: u32,
) -> (SegmentDecision, Vec<u8>) {
    let downscaled = downscale_gray(rgb, downscale_px);
    let Some(prev) = prev_phash else {
        return (
            SegmentDecision {
                boundary: true,
                reason: "first_frame".to_string(),
                phash_distance: phash.len(),
                diff_score_bp: 10_000,
            },
            downscaled,
        );
    };
    let dist = hamming_distance(phash, prev);
    if dist <= d_stable {
        return (
            SegmentDecision {
                boundary: false,
                reason: "stable_phash".to_string(),
                phash_distance: dist,
                diff_score_bp: 0,
            },
            downscaled,
        );
    }
    if dist >= d_boundary {
        return (
            SegmentDecision {
                boundary: true,
                reason: "phash_boundary".to_string(),
                phash_distance: dist,
                diff_score_bp: 10_000,
            },
            downscaled,
        );
    }
    let diff_bp = diff_score_bp(&downscaled, prev_downscaled);
    let decision = if diff_bp >= diff_threshold_bp {
        SegmentDecision {
            boundary: true,
            reason: "diff_boundary".to_string(),
            phash_distance: dist,
            diff_score_bp: diff_bp,
        }
    } else {
        SegmentDecision {
            boundary: false,
            reason: "diff_stable".to_string(),
            phash_distance: dist,
            diff_score_bp: diff_bp,
        }
    };
    (decision, downscaled)
}

fn downscale_gray(rgb: &RgbImage, downscale_px: u32) -> Vec<u8> {
    DynamicImage::ImageRgb8(rgb.clone())
        .resize_exact(downscale_px, downscale_px, FilterType::Triangle)
        .to_luma8()
        .into_raw()
}

/// Mean absolute pixel difference in basis points; a missing or mismatched
/// previous frame scores as a full change.
fn diff_score_bp(current: &[u8], prev: Option<&[u8]>) -> i64 {
    let Some(prev) = prev else {
        return 10_000;
    };
    if prev.len() != current.len() || current.is_empty() {
        return 10_000;
    }
    let total: i64 = current
        .iter()
        .zip(prev.iter())
        .map(|(a, b)| (*a as i64 - *b as i64).abs())
        .sum();
    let max_total = 255 * current.len() as i64;
    (total * 10_000) / max_total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: u32, height: u32, value: u8) -> RgbImage {
        let mut img = RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = image::Rgb([value, value, value]);
        }
        img
    }

    #[test]
    fn first_frame_is_a_boundary() {
        let img = flat(32, 32, 128);
        let (decision, downscaled) =
            decide_boundary("0".repeat(64).as_str(), None, &img, None, 4, 12, 1800, 64);
        assert!(decision.boundary);
        assert_eq!(decision.reason, "first_frame");
        assert_eq!(downscaled.len(), 64 * 64);
    }

    #[test]
    fn identical_phash_is_stable() {
        let img = flat(32, 32, 128);
        let phash = "0".repeat(64);
        let (decision, _) =
            decide_boundary(&phash, Some(&phash), &img, None, 4, 12, 1800, 64);
        assert!(!decision.boundary);
        assert_eq!(decision.reason, "stable_phash");
    }

    #[test]
    fn large_phash_distance_is_a_boundary() {
        let img = flat(32, 32, 128);
        let a = "0".repeat(64);
        let b = "1".repeat(64);
        let (decision, _) = decide_boundary(&a, Some(&b), &img, None, 4, 12, 1800, 64);
        assert!(decision.boundary);
        assert_eq!(decision.reason, "phash_boundary");
    }

    #[test]
    fn mid_distance_falls_back_to_pixel_diff() {
        let img = flat(32, 32, 0);
        let prev = flat(32, 32, 255);
        let prev_down = downscale_gray(&prev, 64);
        let mut b = "0".repeat(64);
        b.replace_range(0..8, "11111111");
        let a = "0".repeat(64);
        let (decision, _) =
            decide_boundary(&a, Some(&b), &img, Some(&prev_down), 4, 12, 1800, 64);
        assert!(decision.boundary);
        assert_eq!(decision.reason, "diff_boundary");
        assert!(decision.diff_score_bp > 9000);
    }
}
