use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{ArcFaceEmbedder, EuclideanMatcher, FaceLocalizer, ScrfdDetector};
use rollcall_gallery::{KnownFaces, KnownFacesOptions, SnapshotStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "rollcall", about = "Known-face gallery and recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the gallery if the enrollment tree changed
    Scan,
    /// Identify the faces in one or more images
    Identify {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Minimum confidence for a positive match (default: live threshold)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Report enrollment photo quality per label
    Audit,
    /// Leave-one-out accuracy of the gallery against itself
    Evaluate {
        /// Minimum confidence for a positive match (default: offline threshold)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Keep the gallery fresh until interrupted
    Watch {
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
    /// Show configuration and snapshot state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Scan => {
            let faces = Arc::new(open_known_faces(&config)?);
            let refresh = tokio::task::spawn_blocking(move || faces.scan_or_refresh_if_needed())
                .await??;
            print_json(&json!({
                "refresh": refresh.outcome,
                "generation": refresh.gallery.generation(),
                "entries": refresh.gallery.len(),
                "labels": refresh.gallery.label_counts(),
            }))?;
        }
        Commands::Identify { images, threshold } => {
            let threshold = threshold.unwrap_or(config.live_threshold);
            let faces = Arc::new(open_known_faces(&config)?);

            // Refresh once up front so the per-image tasks do not queue on the refresh lock.
            let warm = faces.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || warm.scan_or_refresh_if_needed()).await? {
                tracing::warn!(error = %e, "initial refresh failed");
            }

            let tasks: Vec<_> = images
                .into_iter()
                .map(|path| {
                    let faces = faces.clone();
                    tokio::task::spawn_blocking(move || {
                        let result = image::open(&path)
                            .with_context(|| format!("failed to open {}", path.display()))
                            .map(|img| faces.identify(&img, threshold));
                        (path, result)
                    })
                })
                .collect();

            let mut results = Vec::with_capacity(tasks.len());
            for task in tasks {
                let (path, result) = task.await?;
                results.push(match result {
                    Ok(matches) => json!({ "image": path, "faces": matches }),
                    Err(e) => {
                        tracing::error!(image = %path.display(), error = %e, "identify failed");
                        json!({ "image": path, "error": format!("{e:#}") })
                    }
                });
            }
            print_json(&results)?;
        }
        Commands::Audit => {
            let detector = ScrfdDetector::load(&config.detector_model_path())
                .context("failed to load detection model")?;
            let root = config.enrollment_dir.clone();
            let report = tokio::task::spawn_blocking(move || {
                rollcall_gallery::audit(&root, &FaceLocalizer::new(Arc::new(detector)))
            })
            .await??;
            print_json(&report)?;
        }
        Commands::Evaluate { threshold } => {
            let threshold = threshold.unwrap_or(config.offline_threshold);
            let matcher = EuclideanMatcher::new(config.distance_scale);
            let faces = Arc::new(open_known_faces(&config)?);
            let evaluation = tokio::task::spawn_blocking(move || -> Result<_> {
                let gallery = faces.cache().get_current_gallery()?;
                Ok(rollcall_gallery::leave_one_out(&gallery, &matcher, threshold))
            })
            .await??;
            print_json(&json!({
                "threshold": threshold,
                "accuracy": evaluation.accuracy(),
                "evaluation": evaluation,
            }))?;
        }
        Commands::Watch { interval_secs } => {
            let faces = Arc::new(open_known_faces(&config)?);
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            tracing::info!(root = %config.enrollment_dir.display(), interval_secs, "watching enrollment tree");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let faces = faces.clone();
                        match tokio::task::spawn_blocking(move || faces.scan_or_refresh_if_needed()).await? {
                            Ok(refresh) => tracing::debug!(
                                generation = refresh.gallery.generation(),
                                outcome = ?refresh.outcome,
                                "refresh check"
                            ),
                            Err(e) => tracing::warn!(error = %e, "refresh failed"),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("stopping watch");
                        break;
                    }
                }
            }
        }
        Commands::Status => {
            let store = SnapshotStore::new(&config.snapshot_path);
            let snapshot = match store.read() {
                Ok(Some(s)) => json!({
                    "entries": s.len(),
                    "fingerprint": s.fingerprint.to_string(),
                    "model_version": s.model_version,
                    "saved_at_unix": s.saved_at_unix,
                }),
                Ok(None) => json!(null),
                Err(e) => json!({ "error": e.to_string() }),
            };
            print_json(&json!({
                "config": config,
                "enrollment_fingerprint": rollcall_gallery::fingerprint(&config.enrollment_dir).to_string(),
                "snapshot": snapshot,
            }))?;
        }
    }

    Ok(())
}

fn open_known_faces(config: &Config) -> Result<KnownFaces> {
    let detector = ScrfdDetector::load(&config.detector_model_path())
        .context("failed to load detection model")?;
    let embedder = ArcFaceEmbedder::load(&config.embedder_model_path())
        .context("failed to load recognition model")?;

    if config.persist && config.snapshot_inside_enrollment() {
        tracing::warn!(
            snapshot = %config.snapshot_path.display(),
            "snapshot inside the enrollment tree changes its fingerprint on every save"
        );
    }

    Ok(KnownFaces::open(
        config.enrollment_dir.clone(),
        Arc::new(detector),
        Arc::new(embedder),
        KnownFacesOptions {
            snapshot_path: config.persist.then(|| config.snapshot_path.clone()),
            max_dimension: config.max_enroll_dimension,
            distance_scale: config.distance_scale,
        },
    ))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
