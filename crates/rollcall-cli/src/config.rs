use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration: defaults, then `$ROLLCALL_CONFIG`, then `ROLLCALL_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    /// Root of the enrollment tree (`<root>/<label>/<photo>`).
    pub enrollment_dir: PathBuf,
    /// Gallery snapshot file. Must live outside `enrollment_dir`.
    pub snapshot_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Confidence threshold for identification.
    pub live_threshold: f32,
    /// Confidence threshold for offline evaluation.
    pub offline_threshold: f32,
    pub distance_scale: f32,
    /// Longer-side cap for enrollment photos.
    pub max_enroll_dimension: u32,
    /// Whether to write gallery snapshots.
    pub persist: bool,
}

/// Config file contents; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    enrollment_dir: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    live_threshold: Option<f32>,
    offline_threshold: Option<f32>,
    distance_scale: Option<f32>,
    max_enroll_dimension: Option<u32>,
    persist: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enrollment_dir: PathBuf::from("dataset"),
            snapshot_path: data_dir().join("gallery.json"),
            model_dir: rollcall_core::default_model_dir(),
            live_threshold: 0.50,
            offline_threshold: rollcall_gallery::OFFLINE_THRESHOLD,
            distance_scale: rollcall_core::DEFAULT_DISTANCE_SCALE,
            max_enroll_dimension: rollcall_gallery::DEFAULT_MAX_DIMENSION,
            persist: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
            config.merge_file(Path::new(&path))?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(v) = file.enrollment_dir {
            self.enrollment_dir = v;
        }
        if let Some(v) = file.snapshot_path {
            self.snapshot_path = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        self.live_threshold = file.live_threshold.unwrap_or(self.live_threshold);
        self.offline_threshold = file.offline_threshold.unwrap_or(self.offline_threshold);
        self.distance_scale = file.distance_scale.unwrap_or(self.distance_scale);
        self.max_enroll_dimension = file.max_enroll_dimension.unwrap_or(self.max_enroll_dimension);
        self.persist = file.persist.unwrap_or(self.persist);
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(())
    }

    /// Override fields from `ROLLCALL_*` variables; unparsable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROLLCALL_ENROLLMENT_DIR") {
            self.enrollment_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_SNAPSHOT_PATH") {
            self.snapshot_path = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        self.live_threshold = env_f32(&var, "ROLLCALL_LIVE_THRESHOLD", self.live_threshold);
        self.offline_threshold = env_f32(&var, "ROLLCALL_OFFLINE_THRESHOLD", self.offline_threshold);
        self.distance_scale = env_f32(&var, "ROLLCALL_DISTANCE_SCALE", self.distance_scale);
        self.max_enroll_dimension =
            env_u32(&var, "ROLLCALL_MAX_ENROLL_DIMENSION", self.max_enroll_dimension);
        if let Some(v) = var("ROLLCALL_PERSIST") {
            self.persist = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(rollcall_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join(rollcall_core::EMBEDDER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Whether the snapshot file would land inside the enrollment tree.
    ///
    /// Both paths are made absolute and resolved through symlinks first, so
    /// `dataset` and `/srv/app/dataset/../dataset/g.json` compare equal.
    pub fn snapshot_inside_enrollment(&self) -> bool {
        resolve(&self.snapshot_path).starts_with(resolve(&self.enrollment_dir))
    }
}

/// Absolute form of `path` with its longest existing prefix canonicalized.
fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut existing = absolute.as_path();
    let mut missing: Vec<&OsStr> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing.iter().rev().fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_f32(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(var: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.enrollment_dir, PathBuf::from("dataset"));
        assert_eq!(config.live_threshold, 0.50);
        assert_eq!(config.offline_threshold, 0.60);
        assert_eq!(config.distance_scale, 0.6);
        assert_eq!(config.max_enroll_dimension, 1280);
        assert!(config.persist);
        assert!(config.snapshot_path.ends_with("rollcall/gallery.json"));
        assert!(config.detector_model_path().ends_with("det_10g.onnx"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            "enrollment_dir = \"/srv/faces\"\nlive_threshold = 0.55\npersist = false\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.merge_file(&path).unwrap();
        assert_eq!(config.enrollment_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.live_threshold, 0.55);
        assert!(!config.persist);
        assert_eq!(config.offline_threshold, 0.60);
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "live_threshold = 0.55\nmax_enroll_dimension = 800\n").unwrap();

        let mut config = Config::default();
        config.merge_file(&path).unwrap();
        config.apply_env(vars(&[
            ("ROLLCALL_LIVE_THRESHOLD", "0.7"),
            ("ROLLCALL_MAX_ENROLL_DIMENSION", "not-a-number"),
            ("ROLLCALL_PERSIST", "0"),
            ("ROLLCALL_SNAPSHOT_PATH", "/var/lib/rollcall/g.json"),
        ]));
        assert_eq!(config.live_threshold, 0.7);
        assert_eq!(config.max_enroll_dimension, 800);
        assert!(!config.persist);
        assert_eq!(config.snapshot_path, PathBuf::from("/var/lib/rollcall/g.json"));
    }

    #[test]
    fn test_snapshot_inside_enrollment_sees_through_path_spelling() {
        let dir = TempDir::new().unwrap();
        let dataset = dir.path().join("dataset");
        std::fs::create_dir(&dataset).unwrap();

        let mut config = Config {
            enrollment_dir: dataset.clone(),
            snapshot_path: dir.path().join("dataset/../dataset/state/g.json"),
            ..Config::default()
        };
        assert!(config.snapshot_inside_enrollment());

        config.snapshot_path = dir.path().join("state/g.json");
        assert!(!config.snapshot_inside_enrollment());

        config.snapshot_path = dir.path().join("dataset-old/g.json");
        assert!(!config.snapshot_inside_enrollment());
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_inside_enrollment_through_symlink() {
        let dir = TempDir::new().unwrap();
        let dataset = dir.path().join("dataset");
        std::fs::create_dir(&dataset).unwrap();
        std::os::unix::fs::symlink(&dataset, dir.path().join("alias")).unwrap();

        let config = Config {
            enrollment_dir: dataset,
            snapshot_path: dir.path().join("alias/g.json"),
            ..Config::default()
        };
        assert!(config.snapshot_inside_enrollment());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "treshold = 0.5\n").unwrap();
        let err = Config::default().merge_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::default()
            .merge_file(&dir.path().join("absent.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
