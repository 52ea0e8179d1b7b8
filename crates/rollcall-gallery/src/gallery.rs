use crate::fingerprint::Fingerprint;
use rollcall_core::EnrolledFace;
use std::collections::BTreeMap;

/// An immutable build of the enrolled faces.
///
/// A refresh never mutates a `Gallery`; it builds a new one with the next
/// generation number and swaps it in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    faces: Vec<EnrolledFace>,
    fingerprint: Fingerprint,
    generation: u64,
}

impl Gallery {
    /// The gallery held before the first refresh: no faces, generation 0.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(faces: Vec<EnrolledFace>, fingerprint: Fingerprint, generation: u64) -> Self {
        Self {
            faces,
            fingerprint,
            generation,
        }
    }

    pub fn faces(&self) -> &[EnrolledFace] {
        &self.faces
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Whether this gallery can serve requests against a tree with fingerprint `live`.
    ///
    /// The generation-0 placeholder is never fresh. A refreshed gallery is
    /// fresh until the tree changes, even when it has no faces.
    pub fn is_fresh_for(&self, live: Fingerprint) -> bool {
        self.generation > 0 && self.fingerprint >= live
    }

    /// Number of enrolled embeddings per label.
    pub fn label_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for face in &self.faces {
            *counts.entry(face.label.as_str()).or_insert(0) += 1;
        }
        counts
    }
}
