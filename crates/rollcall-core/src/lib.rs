//! rollcall-core: face localization, embedding and nearest-neighbor matching.
//!
//! Detection (SCRFD) and embedding (ArcFace) run via ONNX Runtime behind the
//! [`FaceDetector`] and [`Embedder`] traits; the localizer cascade and the
//! matcher only ever see those traits.

pub mod alignment;
pub mod detector;
pub mod imaging;
pub mod localizer;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use localizer::{DetectionStrategy, FaceLocalizer, Localized, DEFAULT_CASCADE};
pub use recognizer::{ArcFaceEmbedder, Embedder, RecognizerError};
pub use types::{
    BoundingBox, Embedding, EnrolledFace, EuclideanMatcher, MatchResult, Matcher,
    DEFAULT_DISTANCE_SCALE, UNKNOWN_LABEL,
};

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const EMBEDDER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default location of the ONNX models: `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
