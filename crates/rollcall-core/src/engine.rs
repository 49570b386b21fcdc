use crate::lock::TrainingLock;
use crate::progress::StatusBoard;
use crate::trainer::{TrainError, Trainer, TrainingOutcome};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("training is already running")]
    AlreadyRunning,
    #[error("training failed: {0}")]
    Train(#[from] TrainError),
    #[error("failed to spawn training thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to take training lock: {0}")]
    Lock(#[source] std::io::Error),
    #[error("training thread exited")]
    ChannelClosed,
}

/// Handle to one in-flight training run.
pub struct TrainingJob {
    reply: oneshot::Receiver<Result<TrainingOutcome, TrainError>>,
}

impl TrainingJob {
    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<TrainingOutcome, EngineError> {
        self.reply.await.map_err(|_| EngineError::ChannelClosed)?.map_err(Into::into)
    }

    /// Blocking variant of [`wait`](Self::wait) for non-async callers.
    pub fn blocking_wait(self) -> Result<TrainingOutcome, EngineError> {
        self.reply.blocking_recv().map_err(|_| EngineError::ChannelClosed)?.map_err(Into::into)
    }
}

/// Clears the active flag when the training thread ends, however it ends.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Clone-safe, single-flight training runner.
///
/// At most one run is active; a trigger while one is in flight is rejected
/// with [`EngineError::AlreadyRunning`] and does not disturb the active run.
/// When the status board has a snapshot file, the guard also spans processes
/// through a file lock next to it.
#[derive(Clone)]
pub struct TrainingEngine {
    trainer: Arc<Trainer>,
    corpus_root: Arc<PathBuf>,
    status: StatusBoard,
    active: Arc<AtomicBool>,
    lock_path: Option<Arc<PathBuf>>,
}

impl TrainingEngine {
    pub fn new(trainer: Trainer, corpus_root: impl Into<PathBuf>, status: StatusBoard) -> Self {
        let lock_path = status.lock_path().map(Arc::new);
        Self {
            trainer: Arc::new(trainer),
            corpus_root: Arc::new(corpus_root.into()),
            status,
            active: Arc::new(AtomicBool::new(false)),
            lock_path,
        }
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Start a training run on a dedicated OS thread.
    pub fn start(&self) -> Result<TrainingJob, EngineError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!("training trigger rejected: already running");
            return Err(EngineError::AlreadyRunning);
        }
        let guard = ActiveGuard(Arc::clone(&self.active));

        let lock = match self.lock_path.as_deref() {
            Some(path) => match TrainingLock::try_acquire(path) {
                Ok(Some(lock)) => Some(lock),
                Ok(None) => {
                    tracing::info!(lock = %path.display(), "training trigger rejected: another process is training");
                    return Err(EngineError::AlreadyRunning);
                }
                Err(e) => return Err(EngineError::Lock(e)),
            },
            None => None,
        };

        self.status.begin();

        let (reply_tx, reply_rx) = oneshot::channel();
        let trainer = Arc::clone(&self.trainer);
        let corpus_root = Arc::clone(&self.corpus_root);
        let status = self.status.clone();

        let spawned = std::thread::Builder::new()
            .name("rollcall-trainer".into())
            .spawn(move || {
                tracing::info!(corpus = %corpus_root.display(), "training thread started");

                let result = trainer.train(&corpus_root, &status);
                match &result {
                    Ok(_) => status.finish(None),
                    Err(e) => {
                        tracing::error!(error = %e, "training failed");
                        status.finish(Some(format!("Training failed: {e}")));
                    }
                }

                // Release only after the final status is out, but before
                // replying, so a waiter can immediately start the next run.
                drop(lock);
                drop(guard);
                let _ = reply_tx.send(result);
                tracing::info!("training thread exiting");
            });

        if let Err(e) = spawned {
            self.status.finish(Some(format!("Training failed: {e}")));
            return Err(EngineError::Spawn(e));
        }

        Ok(TrainingJob { reply: reply_rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::FaceLocator;
    use crate::embedder::Embedder;
    use crate::forest::ForestParams;
    use crate::pipeline::FeatureExtractor;
    use crate::progress::{read_snapshot, TrainingStatus};
    use crate::store::ArtifactStore;
    use crate::types::FaceRegion;
    use image::{GrayImage, Rgb, RgbImage};
    use std::path::Path;
    use std::sync::{mpsc, Mutex};

    /// Whole-image locator that blocks until released.
    struct Gated(Mutex<mpsc::Receiver<()>>);

    impl FaceLocator for Gated {
        fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion> {
            let _ = self.0.lock().unwrap().recv();
            vec![FaceRegion::new(0, 0, gray.width() as i32, gray.height() as i32)]
        }
    }

    struct Whole;

    impl FaceLocator for Whole {
        fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion> {
            vec![FaceRegion::new(0, 0, gray.width() as i32, gray.height() as i32)]
        }
    }

    fn write_corpus(root: &Path) {
        for (label, shade) in [("1", 40u8), ("2", 200u8)] {
            let dir = root.join(label);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..3u8 {
                let img = RgbImage::from_fn(16, 16, |x, y| {
                    let v = shade.saturating_add((x as u8 + y as u8 + i) % 8);
                    Rgb([v, v, v])
                });
                img.save(dir.join(format!("{i}.png"))).unwrap();
            }
        }
    }

    fn engine(root: &Path, locator: Arc<dyn FaceLocator>) -> TrainingEngine {
        let extractor = FeatureExtractor::new(locator, Embedder::new(8));
        let params = ForestParams { n_trees: 10, ..Default::default() };
        let store = ArtifactStore::new(root.join("model.json"));
        TrainingEngine::new(
            Trainer::new(extractor, params, store),
            root.join("corpus"),
            StatusBoard::new(TrainingStatus::default()),
        )
    }

    #[tokio::test]
    async fn test_training_completes_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(&dir.path().join("corpus"));
        let engine = engine(dir.path(), Arc::new(Whole));

        let outcome = engine.start().unwrap().wait().await.unwrap();
        assert!(matches!(outcome, TrainingOutcome::Trained(_)));

        let status = engine.status().current();
        assert!(!status.running);
        assert_eq!(status.progress, 100);
        assert_eq!(status.message, "Training complete");
        assert!(!engine.is_running());

        // A finished run does not block the next one.
        assert!(engine.start().unwrap().wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_trigger_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(&dir.path().join("corpus"));
        let (release, gate) = mpsc::channel();
        let engine = engine(dir.path(), Arc::new(Gated(Mutex::new(gate))));

        let job = engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.clone().start(), Err(EngineError::AlreadyRunning)));

        // The rejected trigger did not reset the active run's status.
        let status = engine.status().current();
        assert!(status.running);
        assert_eq!(status.message, "Starting training");

        for _ in 0..6 {
            release.send(()).unwrap();
        }
        let outcome = job.wait().await.unwrap();
        assert!(matches!(outcome, TrainingOutcome::Trained(_)));
        assert_eq!(engine.status().current().progress, 100);
    }

    fn snapshot_engine(root: &Path, locator: Arc<dyn FaceLocator>) -> TrainingEngine {
        let extractor = FeatureExtractor::new(locator, Embedder::new(8));
        let params = ForestParams { n_trees: 10, ..Default::default() };
        TrainingEngine::new(
            Trainer::new(extractor, params, ArtifactStore::new(root.join("model.json"))),
            root.join("corpus"),
            StatusBoard::with_snapshot(root.join("train_status.json")),
        )
    }

    #[tokio::test]
    async fn test_second_engine_on_same_paths_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(&dir.path().join("corpus"));
        let status_path = dir.path().join("train_status.json");
        let (release, gate) = mpsc::channel();

        let first = snapshot_engine(dir.path(), Arc::new(Gated(Mutex::new(gate))));
        let job = first.start().unwrap();

        // Another process sets up exactly the same way while the first run is live.
        let second = snapshot_engine(dir.path(), Arc::new(Whole));
        let restored = second.status().current();
        assert!(restored.running);
        assert_eq!(restored.message, "Starting training");
        assert!(matches!(second.start(), Err(EngineError::AlreadyRunning)));
        assert!(!second.is_running());

        let on_disk = read_snapshot(&status_path).unwrap();
        assert!(on_disk.running);
        assert_eq!(on_disk.message, "Starting training");

        for _ in 0..6 {
            release.send(()).unwrap();
        }
        assert!(matches!(job.wait().await.unwrap(), TrainingOutcome::Trained(_)));

        // Lock released with the run.
        let outcome = second.start().unwrap().wait().await.unwrap();
        assert!(matches!(outcome, TrainingOutcome::Trained(_)));
        assert_eq!(read_snapshot(&status_path).unwrap().message, "Training complete");
    }

    #[tokio::test]
    async fn test_missing_corpus_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), Arc::new(Whole));

        let err = engine.start().unwrap().wait().await.unwrap_err();
        assert!(matches!(err, EngineError::Train(TrainError::Corpus { .. })));

        let status = engine.status().current();
        assert!(!status.running);
        assert!(status.message.starts_with("Training failed"));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_blocking_wait() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(&dir.path().join("corpus"));
        let engine = engine(dir.path(), Arc::new(Whole));
        assert!(matches!(
            engine.start().unwrap().blocking_wait().unwrap(),
            TrainingOutcome::Trained(_)
        ));
    }
}
