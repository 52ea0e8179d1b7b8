//! Staleness fingerprint of an enrollment tree: the newest modification time
//! found anywhere under (and including) the root.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Latest modification time under an enrollment root, as time since the Unix epoch.
///
/// Ordered: a larger fingerprint means the tree changed more recently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Duration);

impl Fingerprint {
    /// Sentinel for a missing tree; older than any real fingerprint.
    pub const EPOCH: Fingerprint = Fingerprint(Duration::ZERO);

    pub fn from_system_time(time: SystemTime) -> Self {
        time.duration_since(UNIX_EPOCH)
            .map(Fingerprint)
            .unwrap_or(Self::EPOCH)
    }

    pub fn since_epoch(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for Fingerprint {
    fn from(d: Duration) -> Self {
        Fingerprint(d)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0.as_secs(), self.0.subsec_nanos())
    }
}

/// Compute the fingerprint of the tree rooted at `root`.
///
/// A missing root yields [`Fingerprint::EPOCH`]. Entries whose metadata cannot
/// be read are skipped. Symlinks are followed the same way the scanner follows
/// them, and both the link and its target count; each directory is walked once
/// so link cycles terminate.
pub fn fingerprint(root: &Path) -> Fingerprint {
    let Ok(meta) = fs::metadata(root) else {
        return Fingerprint::EPOCH;
    };
    let mut newest = mtime(&meta);
    if meta.is_dir() {
        let mut visited = HashSet::new();
        if let Ok(canonical) = fs::canonicalize(root) {
            visited.insert(canonical);
        }
        walk(root, &mut newest, &mut visited);
    }
    newest
}

fn mtime(meta: &fs::Metadata) -> Fingerprint {
    meta.modified()
        .map(Fingerprint::from_system_time)
        .unwrap_or(Fingerprint::EPOCH)
}

fn walk(dir: &Path, newest: &mut Fingerprint, visited: &mut HashSet<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "fingerprint: cannot list directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        // The link itself: re-pointing a symlink changes only this mtime.
        if let Ok(link) = entry.metadata() {
            *newest = (*newest).max(mtime(&link));
        }
        // Dangling links have no target to look at.
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        *newest = (*newest).max(mtime(&meta));
        if !meta.is_dir() {
            continue;
        }
        match fs::canonicalize(&path) {
            Ok(canonical) if !visited.insert(canonical.clone()) => {
                tracing::debug!(dir = %path.display(), "fingerprint: directory already walked");
            }
            _ => walk(&path, newest, visited),
        }
    }
}
