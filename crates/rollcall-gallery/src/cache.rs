//! Fingerprint-guarded gallery cache.
//!
//! Readers clone an `Arc<Gallery>` out of an `RwLock` and never wait on a
//! scan. Refreshes are serialized by a separate mutex: check, load-or-scan,
//! swap and persist all happen while it is held, so concurrent callers that
//! find the cache stale block once and then observe the same new gallery.

use crate::fingerprint::{self, Fingerprint};
use crate::gallery::Gallery;
use crate::scanner::{GalleryScanner, ScanError, ScanOutcome, ScanReport};
use crate::snapshot::{Snapshot, SnapshotStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("gallery refresh failed: {0}")]
    Refresh(#[from] ScanError),
}

/// Where gallery entries come from.
pub trait GallerySource: Send + Sync {
    /// Current fingerprint of the underlying data.
    fn fingerprint(&self) -> Fingerprint;

    /// Build gallery entries from scratch.
    fn scan(&self) -> Result<ScanOutcome, ScanError>;

    /// Version tag of the embedder producing the entries, if known.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

/// An enrollment directory tree scanned with a [`GalleryScanner`].
pub struct EnrollmentTree {
    root: PathBuf,
    scanner: GalleryScanner,
}

impl EnrollmentTree {
    pub fn new(root: impl Into<PathBuf>, scanner: GalleryScanner) -> Self {
        Self {
            root: root.into(),
            scanner,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scanner(&self) -> &GalleryScanner {
        &self.scanner
    }
}

impl GallerySource for EnrollmentTree {
    fn fingerprint(&self) -> Fingerprint {
        fingerprint::fingerprint(&self.root)
    }

    fn scan(&self) -> Result<ScanOutcome, ScanError> {
        self.scanner.scan(&self.root)
    }

    fn model_version(&self) -> Option<&str> {
        self.scanner.model_version()
    }
}

/// How a refresh request was satisfied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// The held gallery was already fresh.
    Fresh,
    /// A valid snapshot was loaded.
    Loaded { entries: usize },
    /// The tree was scanned.
    Scanned { report: ScanReport },
    /// Another caller's refresh failed while this one waited; the prior gallery is returned.
    Waited,
}

/// The gallery a refresh request produced and how it got there.
#[derive(Debug, Clone)]
pub struct Refresh {
    pub gallery: Arc<Gallery>,
    pub outcome: RefreshOutcome,
}

pub struct GalleryCache {
    source: Box<dyn GallerySource>,
    store: Option<SnapshotStore>,
    current: RwLock<Arc<Gallery>>,
    refresh_lock: Mutex<()>,
    failed_refreshes: AtomicU64,
}

impl GalleryCache {
    pub fn new(source: impl GallerySource + 'static) -> Self {
        Self {
            source: Box::new(source),
            store: None,
            current: RwLock::new(Arc::new(Gallery::empty())),
            refresh_lock: Mutex::new(()),
            failed_refreshes: AtomicU64::new(0),
        }
    }

    /// Persist every scan to `store` and try it before scanning.
    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn snapshot_store(&self) -> Option<&SnapshotStore> {
        self.store.as_ref()
    }

    /// The held gallery, without any freshness check.
    pub fn current(&self) -> Arc<Gallery> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The gallery, refreshed first if the source changed since it was built.
    pub fn get_current_gallery(&self) -> Result<Arc<Gallery>, CacheError> {
        self.refresh_if_needed().map(|r| r.gallery)
    }

    /// Bring the held gallery up to date with the source.
    ///
    /// Idempotent: without source changes, only the first call does any work.
    pub fn refresh_if_needed(&self) -> Result<Refresh, CacheError> {
        let held = self.current();
        if held.is_fresh_for(self.source.fingerprint()) {
            return Ok(Refresh {
                gallery: held,
                outcome: RefreshOutcome::Fresh,
            });
        }

        let failures_before = self.failed_refreshes.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let held = self.current();
        let live = self.source.fingerprint();
        if held.is_fresh_for(live) {
            return Ok(Refresh {
                gallery: held,
                outcome: RefreshOutcome::Fresh,
            });
        }
        if self.failed_refreshes.load(Ordering::SeqCst) != failures_before {
            tracing::debug!("refresh failed while waiting, serving previous gallery");
            return Ok(Refresh {
                gallery: held,
                outcome: RefreshOutcome::Waited,
            });
        }

        let next_generation = held.generation() + 1;

        if let Some((faces, saved)) = self.load_snapshot(live) {
            let entries = faces.len();
            let gallery = Arc::new(Gallery::new(faces, saved, next_generation));
            self.swap(gallery.clone());
            tracing::info!(entries, generation = next_generation, "gallery loaded from snapshot");
            return Ok(Refresh {
                gallery,
                outcome: RefreshOutcome::Loaded { entries },
            });
        }

        let outcome = match self.source.scan() {
            Ok(outcome) => outcome,
            Err(e) => {
                self.failed_refreshes.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(error = %e, generation = held.generation(), "gallery refresh failed, keeping previous gallery");
                return Err(e.into());
            }
        };

        let ScanOutcome { faces, report } = outcome;
        let gallery = Arc::new(Gallery::new(faces, live, next_generation));
        self.swap(gallery.clone());
        self.persist(&gallery);
        tracing::info!(
            entries = gallery.len(),
            generation = next_generation,
            fingerprint = %live,
            "gallery rebuilt from enrollment tree"
        );

        Ok(Refresh {
            gallery,
            outcome: RefreshOutcome::Scanned { report },
        })
    }

    fn load_snapshot(&self, live: Fingerprint) -> Option<(Vec<rollcall_core::EnrolledFace>, Fingerprint)> {
        let store = self.store.as_ref()?;
        match store.load_valid(live, self.source.model_version()) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(path = %store.path().display(), error = %e, "unusable snapshot, rescanning");
                None
            }
        }
    }

    fn persist(&self, gallery: &Gallery) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = Snapshot::new(gallery.faces(), gallery.fingerprint(), self.source.model_version());
        if let Err(e) = store.save(&snapshot) {
            tracing::warn!(path = %store.path().display(), error = %e, "failed to persist gallery snapshot");
        }
    }

    fn swap(&self, gallery: Arc<Gallery>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = gallery;
    }
}
