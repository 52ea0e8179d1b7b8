//! Deterministic detector/embedder stand-ins and fixture writers shared by the
//! crate's tests.

use rollcall_core::{
    BoundingBox, DetectorError, Embedder, Embedding, FaceDetector, RecognizerError,
};
use image::GrayImage;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// "Detects" one face covering the whole image unless the image is black.
#[derive(Default)]
pub struct StubDetector {
    calls: AtomicUsize,
    seen: Mutex<Vec<(u32, u32)>>,
}

impl StubDetector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn largest_seen(&self) -> (u32, u32) {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .copied()
            .max()
            .unwrap_or((0, 0))
    }
}

impl FaceDetector for StubDetector {
    fn detect(&self, image: &GrayImage, _upsample: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(image.dimensions());
        if image.pixels().all(|p| p.0[0] == 0) {
            return Ok(Vec::new());
        }
        Ok(vec![BoundingBox {
            x: 0.0,
            y: 0.0,
            width: image.width() as f32,
            height: image.height() as f32,
            confidence: 0.99,
            landmarks: None,
        }])
    }
}

/// Embeds a region as its mean brightness scaled to [0, 1].
#[derive(Default)]
pub struct StubEmbedder {
    /// Fail for regions whose (rounded) mean brightness equals this value.
    pub fail_on: Option<u8>,
}

impl Embedder for StubEmbedder {
    fn embed(&self, image: &GrayImage, region: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let x0 = region.x.max(0.0) as u32;
        let y0 = region.y.max(0.0) as u32;
        let x1 = (region.right() as u32).min(image.width());
        let y1 = (region.bottom() as u32).min(image.height());
        let (mut sum, mut n) = (0u64, 0u64);
        for y in y0..y1 {
            for x in x0..x1 {
                sum += image.get_pixel(x, y).0[0] as u64;
                n += 1;
            }
        }
        if n == 0 {
            return Err(RecognizerError::EmptyRegion);
        }
        let mean = (sum as f32 / n as f32).round() as u8;
        if self.fail_on == Some(mean) {
            return Err(RecognizerError::InferenceFailed("stub failure".into()));
        }
        Ok(Embedding::new(vec![mean as f32 / 255.0]))
    }
}

/// Write a uniform `64x48` PNG of brightness `value` into `dir`.
pub fn write_photo(dir: &Path, name: &str, value: u8) {
    write_sized_photo(dir, name, 64, 48, value);
}

pub fn write_sized_photo(dir: &Path, name: &str, width: u32, height: u32, value: u8) {
    fs::create_dir_all(dir).unwrap();
    GrayImage::from_pixel(width, height, image::Luma([value]))
        .save(dir.join(name))
        .unwrap();
}

/// alice: two valid photos (100, 110); bob: one valid (200), one corrupt.
pub fn alice_and_bob(root: &Path) {
    write_photo(&root.join("alice"), "1.png", 100);
    write_photo(&root.join("alice"), "2.png", 110);
    write_photo(&root.join("bob"), "1.png", 200);
    fs::write(root.join("bob").join("2.jpg"), b"definitely not a jpeg").unwrap();
}

/// A uniform query image of the given brightness.
pub fn query(value: u8) -> GrayImage {
    GrayImage::from_pixel(64, 48, image::Luma([value]))
}
