//! Leave-one-out evaluation of a gallery against itself.

use crate::gallery::Gallery;
use rollcall_core::{Matcher, UNKNOWN_LABEL};
use serde::Serialize;
use std::collections::BTreeMap;

/// Threshold used for offline tuning runs.
pub const OFFLINE_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabelEvaluation {
    pub total: usize,
    pub correct: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Evaluation {
    pub total: usize,
    pub correct: usize,
    pub wrong: usize,
    pub unknown: usize,
    /// Mean distance from each entry to its nearest other entry.
    pub mean_nearest_distance: Option<f32>,
    pub per_label: BTreeMap<String, LabelEvaluation>,
}

impl Evaluation {
    pub fn accuracy(&self) -> Option<f32> {
        (self.total > 0).then(|| self.correct as f32 / self.total as f32)
    }
}

/// Match every entry against the gallery with that entry held out.
pub fn leave_one_out(gallery: &Gallery, matcher: &dyn Matcher, threshold: f32) -> Evaluation {
    let faces = gallery.faces();
    let mut eval = Evaluation::default();
    if faces.len() < 2 {
        return eval;
    }

    // `rest` always holds every entry except faces[i], in gallery order.
    let mut rest = faces[1..].to_vec();
    let mut distance_sum = 0.0f64;
    let mut distance_count = 0usize;

    for (i, face) in faces.iter().enumerate() {
        if i > 0 {
            rest[i - 1] = faces[i - 1].clone();
        }
        let result = matcher.compare(&face.embedding, &rest, threshold);
        if let Some(d) = result.distance {
            distance_sum += d as f64;
            distance_count += 1;
        }

        let label = eval.per_label.entry(face.label.clone()).or_default();
        label.total += 1;
        eval.total += 1;
        if !result.matched || result.label == UNKNOWN_LABEL {
            eval.unknown += 1;
        } else if result.label == face.label {
            eval.correct += 1;
            label.correct += 1;
        } else {
            eval.wrong += 1;
        }
    }

    eval.mean_nearest_distance =
        (distance_count > 0).then(|| (distance_sum / distance_count as f64) as f32);

    tracing::info!(
        total = eval.total,
        correct = eval.correct,
        wrong = eval.wrong,
        unknown = eval.unknown,
        threshold,
        "leave-one-out evaluation complete"
    );
    eval
}
