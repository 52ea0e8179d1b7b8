//! Face localization cascade.
//!
//! Detection runs as a ranked list of strategies. Each strategy produces an
//! image variant and a detector pass over it; the first strategy that yields
//! at least one region wins, and the regions it found are only meaningful in
//! that variant's coordinate space, so the variant travels with them.

use crate::detector::FaceDetector;
use crate::imaging;
use crate::types::BoundingBox;
use image::GrayImage;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Upsample level of the primary pass.
pub const PRIMARY_UPSAMPLE: u32 = 1;
/// Upsample level of the first fallback.
pub const STRONG_UPSAMPLE: u32 = 2;
/// Uniform enlargement applied by the resize fallback.
pub const ENLARGE_FACTOR: f32 = 1.25;

/// One detection attempt in the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DetectionStrategy {
    /// Detect on the image as given.
    Upsample { level: u32 },
    /// Enlarge the whole image by `factor`, then detect.
    Enlarge { factor: f32, level: u32 },
    /// Equalize the luma channel of the image, then detect.
    Equalize { level: u32 },
}

impl fmt::Display for DetectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upsample { level } => write!(f, "upsample x{level}"),
            Self::Enlarge { factor, level } => write!(f, "enlarge {factor}x (upsample x{level})"),
            Self::Equalize { level } => write!(f, "equalize (upsample x{level})"),
        }
    }
}

impl DetectionStrategy {
    /// The image this strategy detects on, and its scale relative to the input.
    fn prepare<'a>(&self, image: &'a GrayImage) -> (Cow<'a, GrayImage>, f32) {
        match *self {
            Self::Upsample { .. } => (Cow::Borrowed(image), 1.0),
            Self::Enlarge { factor, .. } => (Cow::Owned(imaging::enlarge(image, factor)), factor),
            Self::Equalize { .. } => (Cow::Owned(imaging::equalize_luma(image)), 1.0),
        }
    }

    fn level(&self) -> u32 {
        match *self {
            Self::Upsample { level } | Self::Enlarge { level, .. } | Self::Equalize { level } => level,
        }
    }
}

/// Primary pass, stronger upsampling, 1.25× enlargement, luma equalization.
pub const DEFAULT_CASCADE: [DetectionStrategy; 4] = [
    DetectionStrategy::Upsample { level: PRIMARY_UPSAMPLE },
    DetectionStrategy::Upsample { level: STRONG_UPSAMPLE },
    DetectionStrategy::Enlarge { factor: ENLARGE_FACTOR, level: PRIMARY_UPSAMPLE },
    DetectionStrategy::Equalize { level: PRIMARY_UPSAMPLE },
];

/// Faces found by the winning strategy, together with the image they were found in.
#[derive(Debug, Clone)]
pub struct Localized<'a> {
    /// The image variant detection ran on; embed from this buffer.
    pub image: Cow<'a, GrayImage>,
    /// Regions sorted by area, largest first.
    pub regions: Vec<BoundingBox>,
    pub strategy: DetectionStrategy,
    /// Size of `image` relative to the caller's image.
    pub scale: f32,
}

impl Localized<'_> {
    /// The assumed subject: the region with the largest area.
    pub fn primary(&self) -> &BoundingBox {
        // The cascade never returns an empty region list.
        &self.regions[0]
    }
}

/// Runs the detection cascade over an image.
#[derive(Clone)]
pub struct FaceLocalizer {
    detector: Arc<dyn FaceDetector>,
    cascade: Vec<DetectionStrategy>,
}

impl FaceLocalizer {
    pub fn new(detector: Arc<dyn FaceDetector>) -> Self {
        Self::with_cascade(detector, DEFAULT_CASCADE.to_vec())
    }

    pub fn with_cascade(detector: Arc<dyn FaceDetector>, cascade: Vec<DetectionStrategy>) -> Self {
        Self { detector, cascade }
    }

    pub fn cascade(&self) -> &[DetectionStrategy] {
        &self.cascade
    }

    /// Find faces, falling back through the cascade until one pass succeeds.
    ///
    /// Returns `None` when every strategy came up empty. A detector error
    /// counts as an empty pass.
    pub fn locate<'a>(&self, image: &'a GrayImage) -> Option<Localized<'a>> {
        for (attempt, strategy) in self.cascade.iter().enumerate() {
            let (variant, scale) = strategy.prepare(image);
            let mut regions = match self.detector.detect(&variant, strategy.level()) {
                Ok(regions) => regions,
                Err(e) => {
                    tracing::debug!(%strategy, error = %e, "detection pass failed, treating as empty");
                    continue;
                }
            };
            if regions.is_empty() {
                tracing::trace!(%strategy, "detection pass found nothing");
                continue;
            }

            regions.sort_by(|a, b| b.area().total_cmp(&a.area()));
            if attempt > 0 {
                tracing::debug!(%strategy, faces = regions.len(), "fallback pass found faces");
            }
            return Some(Localized {
                image: variant,
                regions,
                strategy: *strategy,
                scale,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use std::sync::Mutex;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x, y, width: w, height: h, confidence: 0.9, landmarks: None,
        }
    }

    /// Replays a fixed script of pass results and records what it was asked.
    struct ScriptedDetector {
        script: Mutex<Vec<Result<Vec<BoundingBox>, DetectorError>>>,
        calls: Mutex<Vec<(u32, u32, u32)>>,
    }

    impl ScriptedDetector {
        fn new(mut script: Vec<Result<Vec<BoundingBox>, DetectorError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(u32, u32, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&self, image: &GrayImage, upsample: u32) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls.lock().unwrap().push((image.width(), image.height(), upsample));
            self.script.lock().unwrap().pop().unwrap_or(Ok(Vec::new()))
        }
    }

    #[test]
    fn test_primary_pass_wins() {
        let det = ScriptedDetector::new(vec![Ok(vec![bbox(0.0, 0.0, 10.0, 10.0)])]);
        let img = GrayImage::new(100, 80);
        let found = FaceLocalizer::new(det.clone()).locate(&img).unwrap();
        assert_eq!(found.strategy, DEFAULT_CASCADE[0]);
        assert_eq!(det.calls(), vec![(100, 80, PRIMARY_UPSAMPLE)]);
        assert!(matches!(found.image, Cow::Borrowed(_)));
    }

    #[test]
    fn test_falls_back_to_stronger_upsampling() {
        let det = ScriptedDetector::new(vec![Ok(vec![]), Ok(vec![bbox(1.0, 1.0, 4.0, 4.0)])]);
        let img = GrayImage::new(100, 80);
        let found = FaceLocalizer::new(det.clone()).locate(&img).unwrap();
        assert_eq!(found.strategy, DetectionStrategy::Upsample { level: STRONG_UPSAMPLE });
        assert_eq!(det.calls().len(), 2);
        assert_eq!(det.calls()[1].2, STRONG_UPSAMPLE);
    }

    #[test]
    fn test_enlarge_fallback_embeds_from_enlarged_image() {
        let det = ScriptedDetector::new(vec![
            Ok(vec![]),
            Ok(vec![]),
            Ok(vec![bbox(10.0, 10.0, 20.0, 20.0)]),
        ]);
        let img = GrayImage::new(100, 80);
        let found = FaceLocalizer::new(det.clone()).locate(&img).unwrap();
        assert_eq!(found.image.dimensions(), (125, 100));
        assert_eq!(found.scale, ENLARGE_FACTOR);
        assert_eq!(det.calls()[2], (125, 100, PRIMARY_UPSAMPLE));
    }

    #[test]
    fn test_errors_count_as_empty_passes() {
        let det = ScriptedDetector::new(vec![
            Err(DetectorError::InferenceFailed("boom".into())),
            Ok(vec![]),
            Err(DetectorError::EmptyImage),
            Ok(vec![bbox(0.0, 0.0, 5.0, 5.0)]),
        ]);
        let img = GrayImage::from_fn(64, 64, |x, _| image::Luma([100 + (x % 5) as u8]));
        let found = FaceLocalizer::new(det.clone()).locate(&img).unwrap();
        assert!(matches!(found.strategy, DetectionStrategy::Equalize { .. }));
        assert_eq!(found.image.dimensions(), (64, 64));
        assert_ne!(found.image.as_raw(), img.as_raw(), "equalized buffer is used");
        assert_eq!(det.calls().len(), 4);
    }

    #[test]
    fn test_no_face_after_all_fallbacks() {
        let det = ScriptedDetector::new(vec![]);
        let img = GrayImage::new(32, 32);
        assert!(FaceLocalizer::new(det.clone()).locate(&img).is_none());
        assert_eq!(det.calls().len(), DEFAULT_CASCADE.len());
    }

    #[test]
    fn test_largest_region_is_primary() {
        let det = ScriptedDetector::new(vec![Ok(vec![
            bbox(0.0, 0.0, 10.0, 10.0),
            bbox(50.0, 50.0, 30.0, 20.0),
            bbox(20.0, 20.0, 15.0, 15.0),
        ])]);
        let img = GrayImage::new(100, 100);
        let found = FaceLocalizer::new(det).locate(&img).unwrap();
        assert_eq!(found.primary().area(), 600.0);
        let areas: Vec<f32> = found.regions.iter().map(BoundingBox::area).collect();
        assert_eq!(areas, vec![600.0, 225.0, 100.0]);
    }
}
