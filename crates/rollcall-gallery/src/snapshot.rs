//! On-disk gallery snapshots.
//!
//! A snapshot stores the embeddings and labels of one scan as two parallel
//! lists, tagged with the tree fingerprint at scan time. It is trusted on
//! load only when that fingerprint is at least the live one; anything else
//! (stale, wrong format, wrong model, mismatched lists) is ignored whole.

use crate::fingerprint::Fingerprint;
use rollcall_core::{Embedding, EnrolledFace};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Bumped whenever the snapshot layout changes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub fingerprint: Fingerprint,
    pub model_version: Option<String>,
    pub saved_at_unix: u64,
    pub embeddings: Vec<Vec<f32>>,
    pub labels: Vec<String>,
}

impl Snapshot {
    pub fn new(faces: &[EnrolledFace], fingerprint: Fingerprint, model_version: Option<&str>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            fingerprint,
            model_version: model_version.map(str::to_string),
            saved_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            embeddings: faces.iter().map(|f| f.embedding.values.clone()).collect(),
            labels: faces.iter().map(|f| f.label.clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Rebuild gallery entries, rejecting structurally inconsistent snapshots.
    pub fn into_faces(self) -> Result<Vec<EnrolledFace>, SnapshotError> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::Invalid(format!(
                "format version {} (expected {SNAPSHOT_FORMAT_VERSION})",
                self.format_version
            )));
        }
        if self.embeddings.len() != self.labels.len() {
            return Err(SnapshotError::Invalid(format!(
                "{} embeddings but {} labels",
                self.embeddings.len(),
                self.labels.len()
            )));
        }
        if let Some(first) = self.embeddings.first() {
            if self.embeddings.iter().any(|e| e.len() != first.len()) {
                return Err(SnapshotError::Invalid("embeddings differ in length".into()));
            }
        }

        let model_version = self.model_version;
        Ok(self
            .embeddings
            .into_iter()
            .zip(self.labels)
            .map(|(values, label)| {
                EnrolledFace::new(
                    label,
                    Embedding {
                        values,
                        model_version: model_version.clone(),
                    },
                )
            })
            .collect())
    }
}

/// A snapshot file location.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot atomically (temp file in the same directory, then rename).
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), entries = snapshot.len(), "snapshot written");
        Ok(())
    }

    /// Read the snapshot file, `None` if it does not exist.
    pub fn read(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Load entries from the snapshot if it is usable against the live tree.
    ///
    /// Returns the entries and the fingerprint they were saved with, or `None`
    /// when there is no snapshot or it is stale or from another model.
    pub fn load_valid(
        &self,
        live: Fingerprint,
        model_version: Option<&str>,
    ) -> Result<Option<(Vec<EnrolledFace>, Fingerprint)>, SnapshotError> {
        let Some(snapshot) = self.read()? else {
            return Ok(None);
        };
        if snapshot.fingerprint < live {
            tracing::debug!(
                saved = %snapshot.fingerprint,
                %live,
                "snapshot is older than the enrollment tree, ignoring"
            );
            return Ok(None);
        }
        if snapshot.model_version.as_deref() != model_version {
            tracing::info!(
                saved = ?snapshot.model_version,
                active = ?model_version,
                "snapshot was built by a different embedding model, ignoring"
            );
            return Ok(None);
        }
        let fingerprint = snapshot.fingerprint;
        Ok(Some((snapshot.into_faces()?, fingerprint)))
    }
}
