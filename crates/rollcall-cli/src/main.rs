use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::progress::read_snapshot;
use rollcall_core::{
    ArtifactStore, Config, FeatureExtractor, PredictError, Predictor, Recognition, StatusBoard,
    Trainer, TrainingEngine, TrainingOutcome, TrainingStatus,
};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance: train and recognize")]
struct Cli {
    /// TOML config file (ROLLCALL_* environment variables still apply on top)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the classifier from the labeled corpus
    Train {
        /// Corpus root with one directory per student id
        #[arg(long)]
        corpus: Option<PathBuf>,
    },
    /// Recognize the student in an image
    Recognize {
        /// Image file (JPEG or PNG)
        image: PathBuf,
        /// Minimum confidence to accept a recognition
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Show the last training status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    match cli.command {
        Commands::Train { corpus } => train(&config, corpus).await,
        Commands::Recognize { image, threshold } => {
            recognize(&config, image, threshold.unwrap_or(config.confidence_threshold)).await
        }
        Commands::Status => {
            let status = read_snapshot(&config.status_path()).unwrap_or_default();
            println!("{}", status_json(&status));
            Ok(())
        }
    }
}

async fn train(config: &Config, corpus: Option<PathBuf>) -> Result<()> {
    let corpus = corpus.unwrap_or_else(|| config.corpus_dir());
    let extractor = FeatureExtractor::from_config(config).context("failed to load face locator")?;
    let trainer = Trainer::new(
        extractor,
        config.forest.clone(),
        ArtifactStore::new(config.model_path()),
    );
    let engine = TrainingEngine::new(trainer, corpus, StatusBoard::with_snapshot(config.status_path()));

    let job = match engine.start() {
        Ok(job) => job,
        Err(rollcall_core::EngineError::AlreadyRunning) => {
            println!("{}", json!({ "status": "already_running" }));
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("{}", json!({ "status": "started" }));

    let mut rx = engine.status().subscribe();
    let watcher = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            eprintln!("[{:>3}%] {}", status.progress, status.message);
        }
    });

    let outcome = job.wait().await;
    watcher.abort();

    match outcome? {
        TrainingOutcome::Trained(summary) => println!(
            "{}",
            json!({
                "status": "complete",
                "samples": summary.samples,
                "labels": summary.labels,
                "images_skipped": summary.images_skipped,
                "sha256": summary.digest,
            })
        ),
        TrainingOutcome::NoData => println!("{}", json!({ "status": "no_data" })),
    }
    Ok(())
}

async fn recognize(config: &Config, image: PathBuf, threshold: f32) -> Result<()> {
    let bytes = tokio::fs::read(&image)
        .await
        .with_context(|| format!("failed to read {}", image.display()))?;
    let extractor = FeatureExtractor::from_config(config).context("failed to load face locator")?;
    let predictor = Predictor::new(extractor, ArtifactStore::new(config.model_path()));

    let result = tokio::task::spawn_blocking(move || predictor.predict_from_bytes(&bytes)).await?;
    match result {
        Ok(recognition) => {
            println!("{}", recognition_json(&recognition, threshold));
            Ok(())
        }
        Err(e) => {
            println!("{}", json!({ "recognized": false, "error": e.to_string() }));
            if is_no_result(&e) {
                tracing::info!(error = %e, "recognition: image could not be decoded");
                Ok(())
            } else {
                Err(e.into())
            }
        }
    }
}

/// Caller-side acceptance: a prediction below `threshold` is reported as unrecognized.
fn recognition_json(recognition: &Recognition, threshold: f32) -> Value {
    match recognition {
        Recognition::Recognized(p) if p.confidence >= threshold => json!({
            "recognized": true,
            "student_id": p.label.0,
            "confidence": p.confidence,
        }),
        Recognition::Recognized(p) => json!({ "recognized": false, "confidence": p.confidence }),
        Recognition::NoFace => json!({ "recognized": false, "error": "no face detected" }),
        Recognition::NotTrained => json!({ "recognized": false, "error": "model not trained" }),
    }
}

/// Errors that are an ordinary "no result" answer rather than a fault.
fn is_no_result(err: &PredictError) -> bool {
    matches!(err, PredictError::Decode(_))
}

fn status_json(status: &TrainingStatus) -> Value {
    json!({
        "running": status.running,
        "progress": status.progress,
        "message": status.message,
        "updated_at": status.updated_at.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{Label, Prediction};

    #[test]
    fn test_recognized_above_threshold() {
        let r = Recognition::Recognized(Prediction { label: Label(17), confidence: 0.75 });
        let v = recognition_json(&r, 0.5);
        assert_eq!(v["recognized"], true);
        assert_eq!(v["student_id"], 17);
        assert_eq!(v["confidence"], 0.75);
    }

    #[test]
    fn test_below_threshold_not_recognized() {
        let r = Recognition::Recognized(Prediction { label: Label(3), confidence: 0.25 });
        let v = recognition_json(&r, 0.5);
        assert_eq!(v["recognized"], false);
        assert_eq!(v["confidence"], 0.25);
        assert!(v.get("student_id").is_none());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let r = Recognition::Recognized(Prediction { label: Label(3), confidence: 0.5 });
        assert_eq!(recognition_json(&r, 0.5)["recognized"], true);
    }

    #[test]
    fn test_no_face_and_not_trained() {
        assert_eq!(
            recognition_json(&Recognition::NoFace, 0.5),
            json!({ "recognized": false, "error": "no face detected" })
        );
        assert_eq!(
            recognition_json(&Recognition::NotTrained, 0.5)["error"],
            "model not trained"
        );
    }

    #[test]
    fn test_undecodable_image_is_no_result() {
        let decode = rollcall_core::pipeline::decode(b"not an image").unwrap_err();
        assert!(is_no_result(&PredictError::Decode(decode)));
        assert!(!is_no_result(&PredictError::IncompatibleModel { expected: 64, actual: 1024 }));
        assert!(!is_no_result(&PredictError::EmptyModel));
    }

    #[test]
    fn test_status_json_fields() {
        let v = status_json(&TrainingStatus::default());
        assert_eq!(v["running"], false);
        assert_eq!(v["progress"], 0);
        assert_eq!(v["message"], "No training yet.");
        assert!(v["updated_at"].is_string());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["rollcall", "recognize", "face.jpg", "--threshold", "0.7"]).unwrap();
        match cli.command {
            Commands::Recognize { image, threshold } => {
                assert_eq!(image, PathBuf::from("face.jpg"));
                assert_eq!(threshold, Some(0.7));
            }
            _ => panic!("expected recognize"),
        }

        let cli = Cli::try_parse_from(["rollcall", "--config", "r.toml", "train"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("r.toml")));
        assert!(matches!(cli.command, Commands::Train { corpus: None }));
    }
}
