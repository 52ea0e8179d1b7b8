//! Face alignment to the canonical 112×112 ArcFace crop.
//!
//! With landmarks the face is warped by a least-squares similarity transform
//! onto the InsightFace reference points; without them the bounding box is
//! cropped square and resized.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// 4-DOF similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit from `src` points to `dst` points.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-12 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    /// Map a destination point back into source coordinates.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Bilinear sample with black outside the image.
fn sample(image: &GrayImage, x: f32, y: f32) -> f32 {
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let px = |xi: f32, yi: f32| -> f32 {
        if xi < 0.0 || yi < 0.0 {
            return 0.0;
        }
        image
            .get_pixel_checked(xi as u32, yi as u32)
            .map_or(0.0, |p| p.0[0] as f32)
    };
    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1.0, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1.0) * (1.0 - fx) * fy
        + px(x0 + 1.0, y0 + 1.0) * fx * fy
}

fn warp(image: &GrayImage, transform: &Similarity) -> GrayImage {
    GrayImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        let v = transform
            .invert_point(ox as f32, oy as f32)
            .map_or(0.0, |(sx, sy)| sample(image, sx, sy));
        image::Luma([v.round().clamp(0.0, 255.0) as u8])
    })
}

/// Align a face given its five landmarks.
pub fn align_face(image: &GrayImage, landmarks: &[(f32, f32); 5]) -> Option<GrayImage> {
    let transform = Similarity::fit(landmarks, &REFERENCE_LANDMARKS_112)?;
    Some(warp(image, &transform))
}

/// Crop the bounding box (expanded to a square around its centre) and resize
/// it to 112×112. Returns `None` when the box misses the image.
pub fn crop_face(image: &GrayImage, region: &BoundingBox) -> Option<GrayImage> {
    let side = region.width.max(region.height);
    if side < 1.0 {
        return None;
    }
    let cx = region.x + region.width / 2.0;
    let cy = region.y + region.height / 2.0;
    let x0 = (cx - side / 2.0).max(0.0);
    let y0 = (cy - side / 2.0).max(0.0);
    let x1 = (cx + side / 2.0).min(image.width() as f32);
    let y1 = (cy + side / 2.0).min(image.height() as f32);
    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return None;
    }
    let crop = imageops::crop_imm(
        image,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    )
    .to_image();
    Some(imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle))
}

/// Produce the 112×112 crop for a region, preferring landmark alignment.
pub fn aligned_crop(image: &GrayImage, region: &BoundingBox) -> Option<GrayImage> {
    region
        .landmarks
        .as_ref()
        .and_then(|lms| align_face(image, lms))
        .or_else(|| crop_face(image, region))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let t = Similarity::fit(&pts, &pts).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-3, "ty = {}", t.ty);
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → transform should have a ≈ 0.5
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let t = Similarity::fit(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}, expected ~0.5", t.a);
        assert!(t.b.abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_landmarks_rejected() {
        let src = [(10.0, 10.0); 5];
        assert!(Similarity::fit(&src, &REFERENCE_LANDMARKS_112).is_none());
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = GrayImage::from_pixel(640, 480, image::Luma([128]));
        let aligned = align_face(&frame, &REFERENCE_LANDMARKS_112).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A bright patch at the source left eye lands near the reference left eye.
        let mut frame = GrayImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for y in 58..63 {
            for x in 78..83 {
                frame.put_pixel(x, y, image::Luma([255]));
            }
        }

        let aligned = align_face(&frame, &src).unwrap();
        let (rx, ry) = (
            REFERENCE_LANDMARKS_112[0].0.round() as u32,
            REFERENCE_LANDMARKS_112[0].1.round() as u32,
        );
        let max_val = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap_or(0);
        assert!(max_val > 100, "expected bright patch near ({rx}, {ry}), max={max_val}");
    }

    #[test]
    fn test_crop_fallback_without_landmarks() {
        let frame = GrayImage::from_pixel(100, 80, image::Luma([50]));
        let region = BoundingBox {
            x: 10.0, y: 10.0, width: 40.0, height: 30.0,
            confidence: 1.0, landmarks: None,
        };
        let crop = aligned_crop(&frame, &region).unwrap();
        assert_eq!(crop.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert!(crop.pixels().all(|p| p.0[0] == 50));
    }

    #[test]
    fn test_crop_outside_image_is_none() {
        let frame = GrayImage::new(50, 50);
        let region = BoundingBox {
            x: 500.0, y: 500.0, width: 20.0, height: 20.0,
            confidence: 1.0, landmarks: None,
        };
        assert!(crop_face(&frame, &region).is_none());
    }
}
