//! Luma image helpers: decoding, size capping, uniform enlargement and
//! contrast-limited adaptive histogram equalization (CLAHE).

use image::imageops::{self, FilterType};
use image::GrayImage;
use std::borrow::Cow;
use std::path::Path;

const CLAHE_TILES: u32 = 8;
/// Clip limit as a multiple of the mean histogram bin height (OpenCV convention).
const CLAHE_CLIP_LIMIT: f32 = 2.0;
/// Tiles smaller than this (in pixels per side) are merged into fewer tiles.
const CLAHE_MIN_TILE: u32 = 8;

/// Decode an image file of any supported colour type into 8-bit luma.
pub fn load_luma(path: &Path) -> Result<GrayImage, image::ImageError> {
    Ok(image::open(path)?.to_luma8())
}

/// Downscale so that the longer side is at most `max_dimension`.
///
/// Images already within the cap are borrowed unchanged.
pub fn fit_within(image: &GrayImage, max_dimension: u32) -> Cow<'_, GrayImage> {
    let longest = image.width().max(image.height());
    if max_dimension == 0 || longest <= max_dimension {
        return Cow::Borrowed(image);
    }
    let scale = max_dimension as f32 / longest as f32;
    let w = ((image.width() as f32 * scale) as u32).max(1);
    let h = ((image.height() as f32 * scale) as u32).max(1);
    tracing::trace!(from_w = image.width(), from_h = image.height(), w, h, "downscaling");
    Cow::Owned(imageops::resize(image, w, h, FilterType::Triangle))
}

/// Uniformly enlarge an image by `factor` using bilinear interpolation.
pub fn enlarge(image: &GrayImage, factor: f32) -> GrayImage {
    let w = ((image.width() as f32 * factor).round() as u32).max(1);
    let h = ((image.height() as f32 * factor).round() as u32).max(1);
    imageops::resize(image, w, h, FilterType::Triangle)
}

/// Return a contrast-equalized copy of `image` (CLAHE on the luma channel).
pub fn equalize_luma(image: &GrayImage) -> GrayImage {
    let mut out = image.clone();
    let (w, h) = out.dimensions();
    clahe_in_place(&mut out, w, h, CLAHE_TILES, CLAHE_CLIP_LIMIT);
    out
}

/// CLAHE over a `tiles x tiles` grid. Each tile gets a clipped histogram
/// turned into a lookup table; pixels blend the four nearest tile tables.
fn clahe_in_place(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 || gray.len() < w * h {
        return;
    }

    let tiles_x = tiles.min(width / CLAHE_MIN_TILE).max(1) as usize;
    let tiles_y = tiles.min(height / CLAHE_MIN_TILE).max(1) as usize;
    let tile_w = w / tiles_x;
    let tile_h = h / tiles_y;

    let mut luts: Vec<[f32; 256]> = Vec::with_capacity(tiles_x * tiles_y);
    for row in 0..tiles_y {
        for col in 0..tiles_x {
            let x0 = col * tile_w;
            let y0 = row * tile_h;
            // Last row/column absorbs the remainder.
            let x1 = if col + 1 == tiles_x { w } else { x0 + tile_w };
            let y1 = if row + 1 == tiles_y { h } else { y0 + tile_h };

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for &p in &gray[y * w + x0..y * w + x1] {
                    hist[p as usize] += 1;
                }
            }
            luts.push(tile_lut(&mut hist, (x1 - x0) * (y1 - y0), clip_limit));
        }
    }

    for y in 0..h {
        let fy = ((y as f32 + 0.5) / tile_h as f32 - 0.5).clamp(0.0, (tiles_y - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(tiles_y - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = ((x as f32 + 0.5) / tile_w as f32 - 0.5).clamp(0.0, (tiles_x - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(tiles_x - 1);
            let dx = fx - c0 as f32;

            let p = gray[y * w + x] as usize;
            let top = luts[r0 * tiles_x + c0][p] * (1.0 - dx) + luts[r0 * tiles_x + c1][p] * dx;
            let bot = luts[r1 * tiles_x + c0][p] * (1.0 - dx) + luts[r1 * tiles_x + c1][p] * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clip a tile histogram, redistribute the excess evenly and build a 0-255 CDF.
fn tile_lut(hist: &mut [u32; 256], pixels: usize, clip_limit: f32) -> [f32; 256] {
    let clip = ((clip_limit * pixels as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let per_bin = excess / 256;
    let leftover = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += per_bin + u32::from(i < leftover);
    }

    let mut lut = [0f32; 256];
    let mut acc = 0u32;
    for (slot, &count) in lut.iter_mut().zip(hist.iter()) {
        acc += count;
        *slot = acc as f32;
    }
    let cdf_min = lut.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let denom = pixels as f32 - cdf_min;
    for v in lut.iter_mut() {
        *v = if denom > 0.0 {
            ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0)
        } else {
            *v / pixels.max(1) as f32 * 255.0
        };
    }
    lut
}
