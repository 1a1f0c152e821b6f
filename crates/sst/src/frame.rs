//! Frame normalization, perceptual hashing, and tiling.

use std::io::Cursor;

use canonical::sha256_bytes_hex;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::error::SstError;
use crate::types::Token;
use crate::util::{clamp_bbox, BBox};

/// Decoded frame with identity hashes.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub rgb: RgbImage,
    pub width: i64,
    pub height: i64,
    pub image_sha256: String,
    pub phash: String,
}

/// One tile handed to OCR providers.
#[derive(Debug, Clone)]
pub struct Patch {
    pub patch_id: String,
    pub bbox: BBox,
    pub width: i64,
    pub height: i64,
    pub image_png: Vec<u8>,
}

/// Decode raw frame bytes, strip alpha onto white, and compute the SHA-256
/// of the input plus a 64-bit DCT perceptual hash.
pub fn normalize_image(
    image_bytes: &[u8],
    strip_alpha: bool,
    phash_size: u32,
    phash_downscale: u32,
) -> Result<NormalizedImage, SstError> {
    if image_bytes.is_empty() {
        return Err(SstError::InvalidFrame("missing image bytes".into()));
    }
    let decoded =
        image::load_from_memory(image_bytes).map_err(|e| SstError::ImageDecode(e.to_string()))?;
    let rgb = if strip_alpha {
        flatten_onto_white(&decoded)
    } else {
        decoded.to_rgb8()
    };
    let (width, height) = (rgb.width() as i64, rgb.height() as i64);
    if width <= 0 || height <= 0 {
        return Err(SstError::InvalidFrame("invalid image dimensions".into()));
    }
    let image_sha256 = sha256_bytes_hex(image_bytes);
    let phash = perceptual_hash(&rgb, phash_size, phash_downscale);
    if phash.len() != (phash_size * phash_size) as usize {
        return Err(SstError::InvalidFrame("invalid phash length".into()));
    }
    Ok(NormalizedImage {
        rgb,
        width,
        height,
        image_sha256,
        phash,
    })
}

fn flatten_onto_white(decoded: &DynamicImage) -> RgbImage {
    let rgba = decoded.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let blend = |c: u8| -> u8 { ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8 };
        out.put_pixel(x, y, image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    out
}

/// DCT perceptual hash: grayscale downscale, 2-D DCT, sign bits against the
/// median of the low-frequency block (DC term excluded, emitted as `0`).
pub fn perceptual_hash(rgb: &RgbImage, size: u32, downscale: u32) -> String {
    let gray = DynamicImage::ImageRgb8(rgb.clone())
        .resize_exact(downscale, downscale, FilterType::Lanczos3)
        .to_luma8();
    let n = downscale as usize;
    let mat: Vec<Vec<f64>> = (0..n)
        .map(|y| {
            (0..n)
                .map(|x| gray.get_pixel(x as u32, y as u32)[0] as f64)
                .collect()
        })
        .collect();
    let dct = dct_2d(&mat);

    let size = size as usize;
    let mut coeffs = Vec::with_capacity(size * size - 1);
    for y in 0..size {
        for x in 0..size {
            if x == 0 && y == 0 {
                continue;
            }
            coeffs.push(dct[y][x]);
        }
    }
    let median = median_of(&coeffs);
    let mut bits = String::with_capacity(size * size);
    for y in 0..size {
        for x in 0..size {
            if x == 0 && y == 0 {
                bits.push('0');
                continue;
            }
            bits.push(if dct[y][x] >= median { '1' } else { '0' });
        }
    }
    bits
}

fn median_of(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut data = values.to_vec();
    data.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = data.len() / 2;
    if data.len() % 2 == 1 {
        data[mid]
    } else {
        (data[mid - 1] + data[mid]) / 2.0
    }
}

fn dct_1d(vec: &[f64], cos_table: &[Vec<f64>]) -> Vec<f64> {
    let n = vec.len();
    (0..n)
        .map(|k| {
            let row = &cos_table[k];
            vec.iter().enumerate().map(|(i, v)| v * row[i]).sum()
        })
        .collect()
}

fn cos_table(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|k| {
            (0..n)
                .map(|i| (std::f64::consts::PI / n as f64 * (i as f64 + 0.5) * k as f64).cos())
                .collect()
        })
        .collect()
}

// Separable DCT: rows, then columns.
fn dct_2d(mat: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = mat.len();
    if n == 0 {
        return Vec::new();
    }
    let table = cos_table(n);
    let row_dct: Vec<Vec<f64>> = mat.iter().map(|row| dct_1d(row, &table)).collect();
    let m = row_dct[0].len();
    let mut out = vec![vec![0.0; m]; n];
    for x in 0..m {
        let col: Vec<f64> = (0..n).map(|y| row_dct[y][x]).collect();
        let col_dct = dct_1d(&col, &table);
        for y in 0..n {
            out[y][x] = col_dct[y];
        }
    }
    out
}

/// Tile the frame into fixed-size overlapping patches (plus an optional
/// full-frame patch and focus-refinement patches around low-confidence
/// tokens). Tiles are sorted `(y, x, -area, patch_id)` and must cover the
/// frame with unique ids.
#[allow(clippy::too_many_arguments)]
pub fn tile_image(
    rgb: &RgbImage,
    tile_max_px: i64,
    overlap_px: i64,
    add_full_frame: bool,
    focus_tokens: Option<&[Token]>,
    focus_conf_bp: i64,
    focus_padding_px: i64,
    focus_max_patches: i64,
    focus_cluster_gap_px: i64,
) -> Result<Vec<Patch>, SstError> {
    let width = rgb.width() as i64;
    let height = rgb.height() as i64;
    let mut tiles = Vec::new();
    if add_full_frame {
        tiles.push(make_patch(rgb, "full_frame".to_string(), (0, 0, width, height))?);
    }

    let step = (tile_max_px - overlap_px).max(1);
    for y1 in starts(height, tile_max_px, step) {
        for x1 in starts(width, tile_max_px, step) {
            let bbox = clamp_bbox(
                (x1, y1, (x1 + tile_max_px).min(width), (y1 + tile_max_px).min(height)),
                width,
                height,
            );
            let patch_id = format!("tile-{}-{}-{}-{}", bbox.1, bbox.0, bbox.3, bbox.2);
            tiles.push(make_patch(rgb, patch_id, bbox)?);
        }
    }

    if let Some(tokens) = focus_tokens {
        if focus_max_patches != 0 {
            let mut boxes =
                focus_bboxes(tokens, width, height, focus_conf_bp, focus_cluster_gap_px);
            if focus_max_patches > 0 {
                boxes.truncate(focus_max_patches as usize);
            }
            let mut existing: std::collections::BTreeSet<BBox> =
                tiles.iter().map(|t| t.bbox).collect();
            for (idx, bbox) in boxes.into_iter().enumerate() {
                let expanded = clamp_bbox(
                    (
                        bbox.0 - focus_padding_px,
                        bbox.1 - focus_padding_px,
                        bbox.2 + focus_padding_px,
                        bbox.3 + focus_padding_px,
                    ),
                    width,
                    height,
                );
                if !existing.insert(expanded) {
                    continue;
                }
                let patch_id = format!(
                    "focus-{idx}-{}-{}-{}-{}",
                    expanded.1, expanded.0, expanded.3, expanded.2
                );
                tiles.push(make_patch(rgb, patch_id, expanded)?);
            }
        }
    }

    tiles.sort_by(|a, b| {
        let area_a = (a.bbox.2 - a.bbox.0) * (a.bbox.3 - a.bbox.1);
        let area_b = (b.bbox.2 - b.bbox.0) * (b.bbox.3 - b.bbox.1);
        (a.bbox.1, a.bbox.0, -area_a, &a.patch_id).cmp(&(b.bbox.1, b.bbox.0, -area_b, &b.patch_id))
    });
    ensure_coverage(&tiles, width, height, add_full_frame)?;
    ensure_unique_ids(&tiles)?;
    Ok(tiles)
}

fn make_patch(rgb: &RgbImage, patch_id: String, bbox: BBox) -> Result<Patch, SstError> {
    let (x1, y1, x2, y2) = bbox;
    let crop = image::imageops::crop_imm(
        rgb,
        x1 as u32,
        y1 as u32,
        (x2 - x1).max(1) as u32,
        (y2 - y1).max(1) as u32,
    )
    .to_image();
    let mut png = Vec::new();
    DynamicImage::ImageRgb8(crop)
        .write_to(&mut Cursor::new(&mut png), image::ImageOutputFormat::Png)
        .map_err(|e| SstError::ImageDecode(e.to_string()))?;
    Ok(Patch {
        patch_id,
        bbox,
        width: x2 - x1,
        height: y2 - y1,
        image_png: png,
    })
}

fn starts(limit: i64, size: i64, step: i64) -> Vec<i64> {
    if limit <= size {
        return vec![0];
    }
    let mut starts: Vec<i64> = (0..=(limit - size)).step_by(step as usize).collect();
    let last = limit - size;
    if starts.last() != Some(&last) {
        starts.push(last);
    }
    starts
}

fn focus_bboxes(
    tokens: &[Token],
    width: i64,
    height: i64,
    conf_bp: i64,
    cluster_gap_px: i64,
) -> Vec<BBox> {
    let mut selected: Vec<BBox> = tokens
        .iter()
        .filter(|t| conf_bp == 0 || t.confidence_bp < conf_bp)
        .map(|t| clamp_bbox(t.bbox, width, height))
        .collect();
    if selected.is_empty() {
        return Vec::new();
    }
    selected.sort_by_key(|b| (b.1, b.0, b.3, b.2));
    let mut clusters: Vec<BBox> = Vec::new();
    for bbox in selected {
        let mut placed = false;
        for cluster in clusters.iter_mut() {
            let close = !(cluster.2 + cluster_gap_px < bbox.0
                || bbox.2 + cluster_gap_px < cluster.0
                || cluster.3 + cluster_gap_px < bbox.1
                || bbox.3 + cluster_gap_px < cluster.1);
            if close {
                *cluster = (
                    cluster.0.min(bbox.0),
                    cluster.1.min(bbox.1),
                    cluster.2.max(bbox.2),
                    cluster.3.max(bbox.3),
                );
                placed = true;
                break;
            }
        }
        if !placed {
            clusters.push(bbox);
        }
    }
    clusters.sort_by_key(|b| (b.1, b.0, b.3, b.2));
    clusters
}

// Coarse grid coverage check for tilings without a full-frame patch.
fn ensure_coverage(
    tiles: &[Patch],
    width: i64,
    height: i64,
    add_full_frame: bool,
) -> Result<(), SstError> {
    if add_full_frame {
        return Ok(());
    }
    let step_x = (width / 32).max(1);
    let step_y = (height / 32).max(1);
    let mut covered = std::collections::BTreeSet::new();
    for tile in tiles {
        let (x1, y1, x2, y2) = tile.bbox;
        let mut yy = y1;
        while yy < y2 {
            let mut xx = x1;
            while xx < x2 {
                covered.insert((xx / step_x, yy / step_y));
                xx += step_x;
            }
            yy += step_y;
        }
    }
    let total = ((width + step_x - 1) / step_x) * ((height + step_y - 1) / step_y);
    if (covered.len() as i64) < total {
        return Err(SstError::InvalidFrame("tile coverage incomplete".into()));
    }
    Ok(())
}

fn ensure_unique_ids(tiles: &[Patch]) -> Result<(), SstError> {
    let mut seen = std::collections::BTreeSet::new();
    for tile in tiles {
        if tile.patch_id.is_empty() {
            return Err(SstError::InvalidFrame("missing patch_id".into()));
        }
        if !seen.insert(tile.patch_id.as_str()) {
            return Err(SstError::InvalidFrame(format!(
                "duplicate patch_id: {}",
                tile.patch_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let mut img = RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = image::Rgb(color);
        }
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut png), image::ImageOutputFormat::Png)
            .unwrap();
        png
    }

    #[test]
    fn normalize_produces_stable_identity() {
        let png = solid_png(64, 48, [200, 10, 10]);
        let a = normalize_image(&png, true, 8, 32).unwrap();
        let b = normalize_image(&png, true, 8, 32).unwrap();
        assert_eq!(a.width, 64);
        assert_eq!(a.height, 48);
        assert_eq!(a.phash.len(), 64);
        assert_eq!(a.phash, b.phash);
        assert_eq!(a.image_sha256, b.image_sha256);
    }

    #[test]
    fn empty_bytes_rejected() {
        assert!(matches!(
            normalize_image(&[], true, 8, 32),
            Err(SstError::InvalidFrame(_))
        ));
    }

    #[test]
    fn tiling_covers_frame_with_unique_sorted_ids() {
        let png = solid_png(300, 200, [128, 128, 128]);
        let frame = normalize_image(&png, true, 8, 32).unwrap();
        let tiles = tile_image(&frame.rgb, 128, 16, true, None, 0, 24, 0, 48).unwrap();
        assert_eq!(tiles[0].patch_id, "full_frame");
        assert!(tiles.len() > 1);
        let run_twice = tile_image(&frame.rgb, 128, 16, true, None, 0, 24, 0, 48).unwrap();
        let ids: Vec<&str> = tiles.iter().map(|t| t.patch_id.as_str()).collect();
        let ids2: Vec<&str> = run_twice.iter().map(|t| t.patch_id.as_str()).collect();
        assert_eq!(ids, ids2);
    }

    #[test]
    fn small_frame_gets_single_tile() {
        let png = solid_png(50, 40, [0, 0, 0]);
        let frame = normalize_image(&png, true, 8, 32).unwrap();
        let tiles = tile_image(&frame.rgb, 1024, 64, false, None, 0, 24, 0, 48).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].bbox, (0, 0, 50, 40));
    }
}
