//! Enrollment dataset quality report.

use crate::scanner::{list_labels, ScanError, DEFAULT_MAX_DIMENSION};
use rollcall_core::{imaging, FaceLocalizer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Photos whose longer side is below this are flagged as too small.
pub const MIN_SIDE: u32 = 100;
/// Photos whose longer side is above this are flagged as very large.
pub const MAX_SIDE: u32 = 2000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditIssue {
    Unreadable { error: String },
    TooSmall { width: u32, height: u32 },
    VeryLarge { width: u32, height: u32 },
    MultipleFaces { count: usize },
    NoFace,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoIssue {
    pub path: PathBuf,
    pub issue: AuditIssue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabelAudit {
    pub total_images: usize,
    pub valid_faces: usize,
    pub issues: Vec<PhotoIssue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditReport {
    pub labels: BTreeMap<String, LabelAudit>,
}

impl AuditReport {
    pub fn total_images(&self) -> usize {
        self.labels.values().map(|l| l.total_images).sum()
    }

    pub fn issue_count(&self) -> usize {
        self.labels.values().map(|l| l.issues.len()).sum()
    }
}

/// Inspect every enrollment photo under `root`.
pub fn audit(root: &Path, localizer: &FaceLocalizer) -> Result<AuditReport, ScanError> {
    let mut report = AuditReport::default();

    for dir in list_labels(root)? {
        let entry = report.labels.entry(dir.label.clone()).or_default();
        if let Some(error) = dir.error {
            entry.issues.push(PhotoIssue {
                path: root.join(&dir.label),
                issue: AuditIssue::Unreadable { error },
            });
            continue;
        }

        entry.total_images = dir.photos.len();
        for path in dir.photos {
            let issues = audit_photo(&path, localizer, &mut entry.valid_faces);
            entry
                .issues
                .extend(issues.into_iter().map(|issue| PhotoIssue { path: path.clone(), issue }));
        }
    }

    tracing::info!(
        labels = report.labels.len(),
        images = report.total_images(),
        issues = report.issue_count(),
        "dataset audit complete"
    );
    Ok(report)
}

fn audit_photo(path: &Path, localizer: &FaceLocalizer, valid_faces: &mut usize) -> Vec<AuditIssue> {
    let image = match imaging::load_luma(path) {
        Ok(image) => image,
        Err(e) => return vec![AuditIssue::Unreadable { error: e.to_string() }],
    };

    let mut issues = Vec::new();
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if longest < MIN_SIDE {
        issues.push(AuditIssue::TooSmall { width, height });
    } else if longest > MAX_SIDE {
        issues.push(AuditIssue::VeryLarge { width, height });
    }

    let capped = imaging::fit_within(&image, DEFAULT_MAX_DIMENSION);
    match localizer.locate(&capped) {
        Some(found) => {
            *valid_faces += 1;
            if found.regions.len() > 1 {
                issues.push(AuditIssue::MultipleFaces {
                    count: found.regions.len(),
                });
            }
        }
        None => issues.push(AuditIssue::NoFace),
    }
    issues
}
