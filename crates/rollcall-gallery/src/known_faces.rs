//! The recognition entry point: a refreshed gallery plus the detection and
//! embedding pipeline used to query it.

use crate::cache::{CacheError, EnrollmentTree, GalleryCache, Refresh};
use crate::scanner::{GalleryScanner, DEFAULT_MAX_DIMENSION};
use crate::snapshot::SnapshotStore;
use image::{DynamicImage, GrayImage};
use rollcall_core::{
    BoundingBox, Embedder, EuclideanMatcher, FaceDetector, FaceLocalizer, MatchResult, Matcher,
    DEFAULT_DISTANCE_SCALE,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// One detected face in a query image and what it matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch {
    /// Location in the caller's image.
    pub region: BoundingBox,
    pub result: MatchResult,
}

#[derive(Debug, Clone)]
pub struct KnownFacesOptions {
    /// Where to persist gallery snapshots; `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
    pub max_dimension: u32,
    pub distance_scale: f32,
}

impl Default for KnownFacesOptions {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            max_dimension: DEFAULT_MAX_DIMENSION,
            distance_scale: DEFAULT_DISTANCE_SCALE,
        }
    }
}

pub struct KnownFaces {
    cache: GalleryCache,
    localizer: FaceLocalizer,
    embedder: Arc<dyn Embedder>,
    matcher: Box<dyn Matcher + Send + Sync>,
}

impl KnownFaces {
    /// Recognize against the enrollment tree at `root`.
    ///
    /// Nothing is scanned until the first refresh or query.
    pub fn open(
        root: impl Into<PathBuf>,
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn Embedder>,
        options: KnownFacesOptions,
    ) -> Self {
        let localizer = FaceLocalizer::new(detector);
        let scanner = GalleryScanner::new(localizer.clone(), embedder.clone())
            .with_max_dimension(options.max_dimension);
        let mut cache = GalleryCache::new(EnrollmentTree::new(root, scanner));
        if let Some(path) = options.snapshot_path {
            cache = cache.with_snapshots(SnapshotStore::new(path));
        }
        Self::from_cache(
            cache,
            localizer,
            embedder,
            Box::new(EuclideanMatcher::new(options.distance_scale)),
        )
    }

    pub fn from_cache(
        cache: GalleryCache,
        localizer: FaceLocalizer,
        embedder: Arc<dyn Embedder>,
        matcher: Box<dyn Matcher + Send + Sync>,
    ) -> Self {
        Self {
            cache,
            localizer,
            embedder,
            matcher,
        }
    }

    pub fn cache(&self) -> &GalleryCache {
        &self.cache
    }

    pub fn localizer(&self) -> &FaceLocalizer {
        &self.localizer
    }

    /// Refresh the gallery if the enrollment tree changed. Idempotent.
    pub fn scan_or_refresh_if_needed(&self) -> Result<Refresh, CacheError> {
        self.cache.refresh_if_needed()
    }

    /// Match every face in `image` against the gallery.
    pub fn identify(&self, image: &DynamicImage, threshold: f32) -> Vec<FaceMatch> {
        self.identify_luma(&image.to_luma8(), threshold)
    }

    /// Match every face in a luma image against the gallery.
    ///
    /// An image without faces yields an empty list. A failed refresh is logged
    /// and matching proceeds against the last good gallery.
    pub fn identify_luma(&self, image: &GrayImage, threshold: f32) -> Vec<FaceMatch> {
        let gallery = match self.cache.get_current_gallery() {
            Ok(gallery) => gallery,
            Err(e) => {
                tracing::warn!(error = %e, "refresh failed, matching against previous gallery");
                self.cache.current()
            }
        };

        let Some(found) = self.localizer.locate(image) else {
            tracing::debug!("no faces in query image");
            return Vec::new();
        };

        let mut matches = Vec::with_capacity(found.regions.len());
        for region in &found.regions {
            let probe = match self.embedder.embed(&found.image, region) {
                Ok(probe) => probe,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping face that could not be embedded");
                    continue;
                }
            };
            let result = self.matcher.compare(&probe, gallery.faces(), threshold);
            tracing::debug!(
                label = %result.label,
                confidence = result.confidence,
                matched = result.matched,
                "face matched"
            );
            matches.push(FaceMatch {
                region: region.unscaled(found.scale),
                result,
            });
        }
        matches
    }
}
