//! ONNX-backed [`Embedder`] for the insightface ArcFace `w600k_r50` model.
//!
//! Each region is aligned (or cropped) to 112x112, embedded to 512 values and
//! L2-normalized, so Euclidean distances between embeddings fall in [0, 2].

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// w600k_r50 normalizes symmetrically, unlike the detector.
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognition model not found at {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("region cannot be embedded: it does not overlap the image")]
    EmptyRegion,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns one face region of an image into one embedding.
pub trait Embedder: Send + Sync {
    fn embed(&self, image: &GrayImage, region: &BoundingBox) -> Result<Embedding, RecognizerError>;

    /// Version tag stamped on produced embeddings, if any.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

/// ArcFace-based face embedder.
pub struct ArcFaceEmbedder {
    session: Mutex<Session>,
}

impl ArcFaceEmbedder {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, version = ARCFACE_MODEL_VERSION, "recognition model loaded");

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Normalize an aligned luma crop into a `1x3x112x112` input, luma in every channel.
    fn preprocess(crop: &GrayImage) -> Array4<f32> {
        let side = ALIGNED_SIZE as usize;
        Array4::from_shape_fn((1, 3, side, side), |(_, _, y, x)| {
            crop.get_pixel_checked(x as u32, y as u32)
                .map(|p| (p.0[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD)
                .unwrap_or(0.0)
        })
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed(&self, image: &GrayImage, region: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let aligned = alignment::aligned_crop(image, region).ok_or(RecognizerError::EmptyRegion)?;
        let input = Self::preprocess(&aligned);

        let values = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| RecognizerError::InferenceFailed("recognizer session lock poisoned".into()))?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| RecognizerError::InferenceFailed(format!("embedding output: {e}")))?;
            data.to_vec()
        };
        if values.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "embedding has {} values, expected {ARCFACE_EMBEDDING_DIM}",
                values.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(values),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }

    fn model_version(&self) -> Option<&str> {
        Some(ARCFACE_MODEL_VERSION)
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.into_iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
