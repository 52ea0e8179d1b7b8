use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Label reported when no enrolled face is close enough to the probe.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Nominal same/different-person distance of the embedding model, used as a
/// linear normalizer when turning a distance into a confidence.
pub const DEFAULT_DISTANCE_SCALE: f32 = 0.6;

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates live in the pixel space of the image the detector ran on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn top(&self) -> f32 {
        self.y
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn left(&self) -> f32 {
        self.x
    }

    /// `(bottom - top) * (right - left)`, zero for degenerate boxes.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Map the box (and its landmarks) into an image scaled by `1 / factor`.
    ///
    /// Used to report regions found on an enlarged copy in the coordinates of
    /// the image the caller supplied.
    pub fn unscaled(&self, factor: f32) -> BoundingBox {
        if factor <= 0.0 || factor == 1.0 {
            return self.clone();
        }
        BoundingBox {
            x: self.x / factor,
            y: self.y / factor,
            width: self.width / factor,
            height: self.height / factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx / factor, ly / factor))),
        }
    }
}

/// Face embedding vector (128 or 512 values depending on the model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// `None` when the dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.dim() != other.dim() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// One enrolled photo: the person it belongs to and its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledFace {
    pub label: String,
    pub embedding: Embedding,
    /// Enrollment photo the embedding came from, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<PathBuf>,
}

impl EnrolledFace {
    pub fn new(label: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            label: label.into(),
            embedding,
            source: None,
        }
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Label of the closest enrolled face, or [`UNKNOWN_LABEL`].
    pub label: String,
    /// Normalized score in [0, 1]. Reported even when the match is rejected.
    pub confidence: f32,
    /// Distance to the nearest enrolled face; `None` for an empty gallery.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn unknown(confidence: f32, distance: Option<f32>) -> Self {
        Self {
            matched: false,
            label: UNKNOWN_LABEL.to_string(),
            confidence,
            distance,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[EnrolledFace], threshold: f32) -> MatchResult;
}

/// Nearest-neighbor matcher over Euclidean distance.
///
/// Confidence is `max(0, 1 - d_min / distance_scale)`. Every gallery entry is
/// visited; ties keep the entry encountered first. Entries of another
/// dimension and NaN distances are skipped, and a probe with non-finite
/// values matches nothing.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub distance_scale: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            distance_scale: DEFAULT_DISTANCE_SCALE,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(distance_scale: f32) -> Self {
        Self { distance_scale }
    }

    /// Map a distance to a confidence in [0, 1].
    pub fn confidence(&self, distance: f32) -> f32 {
        if self.distance_scale <= 0.0 {
            return if distance == 0.0 { 1.0 } else { 0.0 };
        }
        (1.0 - distance / self.distance_scale).clamp(0.0, 1.0)
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[EnrolledFace], threshold: f32) -> MatchResult {
        if !probe.is_finite() {
            tracing::warn!(dim = probe.dim(), "query embedding has non-finite values, not matching");
            return MatchResult::unknown(0.0, None);
        }

        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;
        let mut mismatched = 0usize;

        for (i, face) in gallery.iter().enumerate() {
            let Some(dist) = probe.euclidean_distance(&face.embedding) else {
                mismatched += 1;
                continue;
            };
            if dist.is_nan() {
                tracing::debug!(label = %face.label, "skipping gallery entry with NaN distance");
                continue;
            }
            // Strict comparison: the first entry at the minimum wins.
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        if mismatched > 0 {
            tracing::warn!(
                mismatched,
                query_dim = probe.dim(),
                "skipped gallery entries of a different embedding dimension"
            );
        }

        let Some(idx) = best_idx else {
            return MatchResult::unknown(0.0, None);
        };

        let confidence = self.confidence(best_dist);
        if confidence >= threshold {
            MatchResult {
                matched: true,
                label: gallery[idx].label.clone(),
                confidence,
                distance: Some(best_dist),
            }
        } else {
            MatchResult::unknown(confidence, Some(best_dist))
        }
    }
}
