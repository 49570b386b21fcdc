//! rollcall-core: face-recognition pipeline for attendance.
//!
//! Faces are located with an OpenCV Haar cascade, reduced to a fixed-size
//! intensity embedding, and classified by a random forest trained on a
//! directory-per-student corpus.

pub mod cascade;
pub mod config;
pub mod detector;
pub mod embedder;
pub mod engine;
pub mod forest;
pub mod imaging;
pub mod lock;
pub mod pipeline;
pub mod predictor;
pub mod progress;
pub mod store;
pub mod trainer;
pub mod types;

pub use config::Config;
pub use detector::{CascadeLocator, DetectorParams, FaceLocator};
pub use embedder::Embedder;
pub use engine::{EngineError, TrainingEngine, TrainingJob};
pub use forest::{Classifier, ForestParams, RandomForest};
pub use lock::TrainingLock;
pub use pipeline::FeatureExtractor;
pub use predictor::{PredictError, Predictor, Recognition};
pub use progress::{NoProgress, ProgressReporter, StatusBoard, TrainingStatus};
pub use store::{ArtifactStore, ModelArtifact};
pub use trainer::{TrainError, Trainer, TrainingOutcome, TrainingSummary};
pub use types::{Embedding, FaceRegion, Label, Prediction};
