//! rollcall-gallery: enrollment scanning, staleness fingerprints, snapshot
//! persistence and the fingerprint-guarded known-face cache.
//!
//! [`KnownFaces`] is the entry point: it owns a [`GalleryCache`] over an
//! enrollment tree and the localizer/embedder/matcher used to query it.

pub mod audit;
pub mod cache;
pub mod evaluate;
pub mod fingerprint;
pub mod gallery;
pub mod known_faces;
pub mod scanner;
pub mod snapshot;

#[cfg(test)]
mod test_support;

pub use audit::{audit, AuditIssue, AuditReport, LabelAudit, PhotoIssue};
pub use cache::{CacheError, EnrollmentTree, GalleryCache, GallerySource, Refresh, RefreshOutcome};
pub use evaluate::{leave_one_out, Evaluation, LabelEvaluation, OFFLINE_THRESHOLD};
pub use fingerprint::{fingerprint, Fingerprint};
pub use gallery::Gallery;
pub use known_faces::{FaceMatch, KnownFaces, KnownFacesOptions};
pub use scanner::{
    GalleryScanner, LabelReport, ScanError, ScanOutcome, ScanReport, SkipReason, SkippedPhoto,
    DEFAULT_MAX_DIMENSION,
};
pub use snapshot::{Snapshot, SnapshotError, SnapshotStore, SNAPSHOT_FORMAT_VERSION};
