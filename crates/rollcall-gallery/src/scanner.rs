//! Enrollment tree scanner.
//!
//! Layout: `<root>/<label>/<photo>.{jpg,jpeg,png}`. Every photo is decoded,
//! capped in size, localized and embedded; photos that fail any step are
//! skipped and recorded in the [`ScanReport`], never fatal.

use rollcall_core::{imaging, Embedder, Embedding, EnrolledFace, FaceLocalizer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Longer-side cap applied to enrollment photos before detection.
pub const DEFAULT_MAX_DIMENSION: u32 = 1280;

const PHOTO_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("cannot read enrollment root {}: {source}", path.display())]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a single enrollment photo contributed nothing.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    #[error("unreadable: {0}")]
    Unreadable(String),
    #[error("no face detected")]
    NoFace,
    #[error("face found but embedding failed: {0}")]
    NoEmbedding(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedPhoto {
    pub path: PathBuf,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabelReport {
    pub embedded: usize,
    pub skipped: Vec<SkippedPhoto>,
}

/// Per-label accounting of one scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    pub labels: BTreeMap<String, LabelReport>,
}

impl ScanReport {
    pub fn embedded(&self) -> usize {
        self.labels.values().map(|l| l.embedded).sum()
    }

    pub fn skipped(&self) -> usize {
        self.labels.values().map(|l| l.skipped.len()).sum()
    }

    pub fn label(&self, label: &str) -> Option<&LabelReport> {
        self.labels.get(label)
    }
}

/// Gallery entries plus the report of how they were produced.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub faces: Vec<EnrolledFace>,
    pub report: ScanReport,
}

/// One label directory and the photo files inside it.
#[derive(Debug)]
pub(crate) struct LabelDir {
    pub label: String,
    pub photos: Vec<PathBuf>,
    /// Set when the directory itself could not be listed.
    pub error: Option<String>,
}

/// Whether `path` has an enrollment photo extension (case-insensitive).
pub fn is_enrollment_photo(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| PHOTO_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// List label directories under `root` in name order, with their photos sorted.
pub(crate) fn list_labels(root: &Path) -> Result<Vec<LabelDir>, ScanError> {
    let unreadable = |source| ScanError::RootUnreadable {
        path: root.to_path_buf(),
        source,
    };

    let mut dirs: Vec<PathBuf> = fs::read_dir(root)
        .map_err(unreadable)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    Ok(dirs
        .into_iter()
        .map(|dir| {
            let label = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match fs::read_dir(&dir) {
                Ok(entries) => {
                    let mut photos: Vec<PathBuf> = entries
                        .flatten()
                        .map(|e| e.path())
                        .filter(|p| p.is_file() && is_enrollment_photo(p))
                        .collect();
                    photos.sort();
                    LabelDir { label, photos, error: None }
                }
                Err(e) => LabelDir {
                    label,
                    photos: Vec::new(),
                    error: Some(e.to_string()),
                },
            }
        })
        .collect())
}

/// Builds gallery entries from an enrollment tree.
#[derive(Clone)]
pub struct GalleryScanner {
    localizer: FaceLocalizer,
    embedder: Arc<dyn Embedder>,
    max_dimension: u32,
}

impl GalleryScanner {
    pub fn new(localizer: FaceLocalizer, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            localizer,
            embedder,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    pub fn model_version(&self) -> Option<&str> {
        self.embedder.model_version()
    }

    /// Scan every label under `root`.
    ///
    /// Fails only when `root` itself cannot be listed.
    pub fn scan(&self, root: &Path) -> Result<ScanOutcome, ScanError> {
        let labels = list_labels(root)?;
        let mut faces = Vec::new();
        let mut report = ScanReport::default();

        for dir in labels {
            let entry = report.labels.entry(dir.label.clone()).or_default();
            if let Some(error) = dir.error {
                tracing::warn!(label = %dir.label, %error, "cannot list label directory");
                entry.skipped.push(SkippedPhoto {
                    path: root.join(&dir.label),
                    reason: SkipReason::Unreadable(error),
                });
                continue;
            }

            for path in dir.photos {
                match self.embed_photo(&path) {
                    Ok(embedding) => {
                        entry.embedded += 1;
                        faces.push(EnrolledFace {
                            label: dir.label.clone(),
                            embedding,
                            source: Some(path),
                        });
                    }
                    Err(reason) => {
                        tracing::debug!(path = %path.display(), %reason, "skipping enrollment photo");
                        entry.skipped.push(SkippedPhoto { path, reason });
                    }
                }
            }

            if entry.embedded == 0 {
                tracing::warn!(label = %dir.label, skipped = entry.skipped.len(), "label has no valid encodings");
            } else {
                tracing::debug!(label = %dir.label, embedded = entry.embedded, "label scanned");
            }
        }

        tracing::info!(
            root = %root.display(),
            labels = report.labels.len(),
            embedded = report.embedded(),
            skipped = report.skipped(),
            "enrollment scan complete"
        );

        Ok(ScanOutcome { faces, report })
    }

    /// Decode, localize and embed one photo.
    pub fn embed_photo(&self, path: &Path) -> Result<Embedding, SkipReason> {
        let image = imaging::load_luma(path).map_err(|e| SkipReason::Unreadable(e.to_string()))?;
        let capped = imaging::fit_within(&image, self.max_dimension);
        let found = self.localizer.locate(&capped).ok_or(SkipReason::NoFace)?;
        if found.regions.len() > 1 {
            tracing::debug!(path = %path.display(), faces = found.regions.len(), "multiple faces, using largest");
        }
        self.embedder
            .embed(&found.image, found.primary())
            .map_err(|e| SkipReason::NoEmbedding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, StubDetector, StubEmbedder};
    use tempfile::TempDir;

    fn scanner(detector: Arc<StubDetector>, embedder: StubEmbedder) -> GalleryScanner {
        GalleryScanner::new(FaceLocalizer::new(detector), Arc::new(embedder))
    }

    #[test]
    fn test_alice_and_bob_with_corrupt_photo() {
        let dir = TempDir::new().unwrap();
        test_support::alice_and_bob(dir.path());

        let outcome = scanner(StubDetector::new(), StubEmbedder::default())
            .scan(dir.path())
            .unwrap();

        assert_eq!(outcome.faces.len(), 3);
        assert_eq!(outcome.faces.iter().filter(|f| f.label == "alice").count(), 2);
        assert_eq!(outcome.faces.iter().filter(|f| f.label == "bob").count(), 1);

        let bob = outcome.report.label("bob").unwrap();
        assert_eq!(bob.embedded, 1);
        assert_eq!(bob.skipped.len(), 1);
        assert!(matches!(bob.skipped[0].reason, SkipReason::Unreadable(_)));
        assert_eq!(outcome.report.skipped(), 1);
    }

    #[test]
    fn test_photo_without_face_is_skipped() {
        let dir = TempDir::new().unwrap();
        test_support::write_photo(&dir.path().join("carol"), "dark.png", 0);
        test_support::write_photo(&dir.path().join("carol"), "lit.png", 150);

        let outcome = scanner(StubDetector::new(), StubEmbedder::default())
            .scan(dir.path())
            .unwrap();
        let carol = outcome.report.label("carol").unwrap();
        assert_eq!(carol.embedded, 1);
        assert_eq!(carol.skipped[0].reason, SkipReason::NoFace);
    }

    #[test]
    fn test_embedding_failure_is_skipped() {
        let dir = TempDir::new().unwrap();
        test_support::write_photo(&dir.path().join("dave"), "a.png", 77);
        let embedder = StubEmbedder { fail_on: Some(77) };

        let outcome = scanner(StubDetector::new(), embedder).scan(dir.path()).unwrap();
        assert!(outcome.faces.is_empty());
        let dave = outcome.report.label("dave").unwrap();
        assert!(matches!(dave.skipped[0].reason, SkipReason::NoEmbedding(_)));
    }

    #[test]
    fn test_label_without_photos_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("notes.txt"), b"not a label").unwrap();

        let outcome = scanner(StubDetector::new(), StubEmbedder::default())
            .scan(dir.path())
            .unwrap();
        assert!(outcome.faces.is_empty());
        assert_eq!(outcome.report.labels.len(), 1);
        assert_eq!(outcome.report.label("empty"), Some(&LabelReport::default()));
    }

    #[test]
    fn test_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        let err = scanner(StubDetector::new(), StubEmbedder::default())
            .scan(&dir.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, ScanError::RootUnreadable { .. }));
    }

    #[test]
    fn test_large_photos_are_capped_before_detection() {
        let dir = TempDir::new().unwrap();
        test_support::write_sized_photo(&dir.path().join("erin"), "big.png", 2000, 1000, 120);
        let detector = StubDetector::new();

        scanner(detector.clone(), StubEmbedder::default())
            .with_max_dimension(500)
            .scan(dir.path())
            .unwrap();
        assert_eq!(detector.largest_seen(), (500, 250));
    }

    #[test]
    fn test_extension_filter() {
        assert!(is_enrollment_photo(Path::new("a/b.JPG")));
        assert!(is_enrollment_photo(Path::new("a/b.jpeg")));
        assert!(is_enrollment_photo(Path::new("b.png")));
        assert!(!is_enrollment_photo(Path::new("b.gif")));
        assert!(!is_enrollment_photo(Path::new("README")));
    }

    #[test]
    fn test_scan_order_is_deterministic() {
        let dir = TempDir::new().unwrap();
        test_support::alice_and_bob(dir.path());
        let s = scanner(StubDetector::new(), StubEmbedder::default());
        let first = s.scan(dir.path()).unwrap();
        let second = s.scan(dir.path()).unwrap();
        assert_eq!(first.faces, second.faces);
        assert_eq!(first.faces[0].label, "alice");
    }
}
