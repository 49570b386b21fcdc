//! Training progress reporting and the published training status.

use crate::lock::{lock_path_for, TrainingLock};
use crate::store::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Sink for training progress. Implementations must return promptly.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, percent: u8, message: &str);
}

impl<F> ProgressReporter for F
where
    F: Fn(u8, &str) + Send + Sync,
{
    fn report(&self, percent: u8, message: &str) {
        self(percent, message)
    }
}

/// Reporter that discards everything.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _percent: u8, _message: &str) {}
}

/// Last known state of the training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatus {
    pub running: bool,
    pub progress: u8,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl TrainingStatus {
    pub fn idle(message: impl Into<String>) -> Self {
        Self { running: false, progress: 0, message: message.into(), updated_at: Utc::now() }
    }

    fn started() -> Self {
        Self { running: true, progress: 0, message: "Starting training".into(), updated_at: Utc::now() }
    }
}

impl Default for TrainingStatus {
    fn default() -> Self {
        Self::idle("No training yet.")
    }
}

/// Read a status snapshot file, if present and parseable.
pub fn read_snapshot(path: &Path) -> Option<TrainingStatus> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable status snapshot");
            None
        }
    }
}

/// Published training status.
///
/// Readers get the latest value from a watch channel; every update is also
/// written (best effort) to an optional snapshot file so the last state
/// survives restarts. Last write wins.
#[derive(Clone)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<TrainingStatus>>,
    snapshot: Option<Arc<PathBuf>>,
}

impl StatusBoard {
    /// In-memory board starting from `initial`.
    pub fn new(initial: TrainingStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx), snapshot: None }
    }

    /// Board backed by a snapshot file, restored from its last contents.
    ///
    /// A snapshot still marked running is checked against the training lock:
    /// if another process holds it the run is live and the snapshot is left
    /// alone, otherwise its owner died mid-run and it is restored as stopped.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (initial, interrupted) = match read_snapshot(&path) {
            Some(status) if status.running && !run_is_live(&path) => {
                tracing::warn!(
                    progress = status.progress,
                    "previous training run did not finish; marking as interrupted"
                );
                let status = TrainingStatus {
                    running: false,
                    message: "Training interrupted".into(),
                    updated_at: Utc::now(),
                    ..status
                };
                (status, true)
            }
            Some(status) => (status, false),
            None => (TrainingStatus::default(), false),
        };

        let board = Self { snapshot: Some(Arc::new(path)), ..Self::new(initial) };
        if interrupted {
            let current = board.current();
            board.persist(&current);
        }
        board
    }

    /// Lock file guarding runs that publish to this board's snapshot.
    pub fn lock_path(&self) -> Option<PathBuf> {
        self.snapshot.as_deref().map(|path| lock_path_for(path))
    }

    pub fn current(&self) -> TrainingStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrainingStatus> {
        self.tx.subscribe()
    }

    pub fn publish(&self, status: TrainingStatus) {
        self.persist(&status);
        self.tx.send_replace(status);
    }

    pub(crate) fn begin(&self) {
        self.publish(TrainingStatus::started());
    }

    /// Mark the run finished, keeping the last progress and message unless
    /// `message` overrides it.
    pub(crate) fn finish(&self, message: Option<String>) {
        let last = self.current();
        self.publish(TrainingStatus {
            running: false,
            message: message.unwrap_or(last.message),
            updated_at: Utc::now(),
            ..last
        });
    }

    fn persist(&self, status: &TrainingStatus) {
        let Some(path) = &self.snapshot else {
            return;
        };
        let result = serde_json::to_vec(status)
            .map_err(std::io::Error::from)
            .and_then(|bytes| write_atomic(path, &bytes));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to write status snapshot");
        }
    }
}

/// Whether another process currently holds the training lock for `status_path`.
fn run_is_live(status_path: &Path) -> bool {
    match TrainingLock::try_acquire(&lock_path_for(status_path)) {
        Ok(lock) => lock.is_none(),
        Err(e) => {
            tracing::warn!(error = %e, "cannot probe training lock; assuming the run is live");
            true
        }
    }
}

impl ProgressReporter for StatusBoard {
    fn report(&self, percent: u8, message: &str) {
        tracing::info!(progress = percent, message, "training progress");
        self.publish(TrainingStatus {
            running: true,
            progress: percent.min(100),
            message: message.to_string(),
            updated_at: Utc::now(),
        });
    }
}
