//! ONNX-backed [`FaceDetector`] for the insightface SCRFD `det_10g` model.
//!
//! Luma images are letterboxed onto a square canvas, run once, and the three
//! stride heads are decoded and merged with NMS. The upsample level picks the
//! canvas side, so small faces in large photos cover more anchor cells on
//! stronger passes.

use crate::types::BoundingBox;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// det_10g preprocessing and decoding parameters.
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MAX_UPSAMPLE: u32 = 3;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detection model not found at {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("image has no pixels")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detector: image in, candidate regions out.
///
/// Implementations must be callable from several threads at once.
pub trait FaceDetector: Send + Sync {
    /// Detect faces at the given upsample level (1 = moderate, higher = stronger).
    fn detect(&self, image: &GrayImage, upsample: u32) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// How an image was placed on the canvas, for mapping detections back.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Positions of one stride's `(score, bbox, kps)` tensors in the session outputs.
type OutputSlots = (usize, usize, usize);

pub struct ScrfdDetector {
    session: Mutex<Session>,
    /// Output slots for strides 8, 16 and 32.
    slots: [OutputSlots; 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected 9 detector outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }

        let slots = output_slots(&names);
        tracing::info!(path = model_path, ?slots, "detection model loaded");

        Ok(Self {
            session: Mutex::new(session),
            slots,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&self, image: &GrayImage, upsample: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }
        let canvas = canvas_size(upsample);
        let (input, letterbox) = letterbox(image, canvas);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("detector session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let head = |slot: usize, stride: usize| {
            outputs[slot]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("output {slot} (stride {stride}): {e}")))
        };

        let mut candidates = Vec::new();
        for (&stride, &(score, bbox, kps)) in SCRFD_STRIDES.iter().zip(self.slots.iter()) {
            let heads = StrideOutputs {
                scores: head(score, stride)?,
                bboxes: head(bbox, stride)?,
                kps: head(kps, stride)?,
            };
            candidates.extend(decode_stride(heads, stride, canvas, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::trace!(faces = faces.len(), canvas, "detection pass complete");
        Ok(faces)
    }
}

/// Letterbox canvas side for an upsample level: 640 px per level.
fn canvas_size(upsample: u32) -> usize {
    SCRFD_INPUT_SIZE * upsample.clamp(1, SCRFD_MAX_UPSAMPLE) as usize
}

/// Resize a luma image onto a square `canvas` (aspect preserved, padded with
/// the mean) and normalize it into an NCHW tensor.
fn letterbox(image: &GrayImage, canvas: usize) -> (Array4<f32>, Letterbox) {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let scale = (canvas as f32 / width as f32).min(canvas as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, canvas);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, canvas);
    let pad_x = (canvas - new_w) as f32 / 2.0;
    let pad_y = (canvas - new_h) as f32 / 2.0;

    let resized = image::imageops::resize(
        image,
        new_w as u32,
        new_h as u32,
        image::imageops::FilterType::Triangle,
    );

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    // Padding is SCRFD_MEAN, which normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, canvas, canvas));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let normalized = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = (x as usize + pad_x_start, y as usize + pad_y_start);
        // Luma fills all three input channels.
        tensor[[0, 0, ty, tx]] = normalized;
        tensor[[0, 1, ty, tx]] = normalized;
        tensor[[0, 2, ty, tx]] = normalized;
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Map output tensors to strides by name (`score_8`, `bbox_16`, ...), or fall
/// back to the export order: scores 0-2, boxes 3-5, keypoints 6-8.
fn output_slots(names: &[String]) -> [OutputSlots; 3] {
    let find = |head: &str, stride: usize| names.iter().position(|n| *n == format!("{head}_{stride}"));

    let named: Option<Vec<OutputSlots>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => [s8, s16, s32],
        _ => {
            tracing::debug!(?names, "unnamed detector outputs, using export order");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Raw per-stride output slices.
struct StrideOutputs<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Turn one stride's raw heads into boxes in source-image coordinates.
fn decode_stride(
    out: StrideOutputs<'_>,
    stride: usize,
    canvas: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = canvas / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unmap = |x: f32, y: f32| ((x - letterbox.pad_x) / letterbox.scale, (y - letterbox.pad_y) / letterbox.scale);

    let mut found = Vec::new();
    for idx in 0..num_anchors {
        let score = out.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid) as f32 * s;
        let anchor_cy = (cell / grid) as f32 * s;

        let Some(offsets) = out.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = unmap(anchor_cx - offsets[0] * s, anchor_cy - offsets[1] * s);
        let (x2, y2) = unmap(anchor_cx + offsets[2] * s, anchor_cy + offsets[3] * s);

        let landmarks = out.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| unmap(anchor_cx + k[i * 2] * s, anchor_cy + k[i * 2 + 1] * s))
        });

        found.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    found
}

/// Greedy NMS: keep the most confident box, drop any that overlap a kept one.
fn nms(mut candidates: Vec<BoundingBox>, max_iou: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = (a.right().min(b.right()) - a.left().max(b.left())).max(0.0);
    let overlap_h = (a.bottom().min(b.bottom()) - a.top().max(b.top())).max(0.0);
    let overlap = overlap_w * overlap_h;
    let union = a.area() + b.area() - overlap;
    if union > 0.0 { overlap / union } else { 0.0 }
}
