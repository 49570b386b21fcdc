use crate::detector::{DetectorError, DetectorParams};
use crate::embedder::DEFAULT_EMBEDDING_SIDE;
use crate::forest::ForestParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Caller-side acceptance threshold for recognition confidence.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Pipeline configuration.
///
/// Loaded from an optional TOML file, then overridden by `ROLLCALL_*`
/// environment variables. Unset paths are derived from `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for the corpus, model and status files.
    pub data_dir: PathBuf,
    /// Labeled corpus root (default: `<data_dir>/dataset`).
    pub corpus_dir: Option<PathBuf>,
    /// Classifier artifact (default: `<data_dir>/model.json`).
    pub model_path: Option<PathBuf>,
    /// Training status snapshot (default: `<data_dir>/train_status.json`).
    pub status_path: Option<PathBuf>,
    /// OpenCV Haar cascade XML (default: `<data_dir>/haarcascade_frontalface_default.xml`).
    pub cascade_path: Option<PathBuf>,
    pub detector: DetectorParams,
    /// Side of the square intensity patch; embeddings have `side²` values.
    pub embedding_side: u32,
    pub forest: ForestParams,
    /// Minimum confidence for the CLI to report a recognition.
    pub confidence_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            corpus_dir: None,
            model_path: None,
            status_path: None,
            cascade_path: None,
            detector: DetectorParams::default(),
            embedding_side: DEFAULT_EMBEDDING_SIDE,
            forest: ForestParams::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides().validated()
    }

    /// Load a TOML config file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.with_env_overrides().validated()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = env_path("ROLLCALL_DATA_DIR") {
            self.data_dir = dir;
        }
        self.corpus_dir = env_path("ROLLCALL_CORPUS_DIR").or(self.corpus_dir);
        self.model_path = env_path("ROLLCALL_MODEL_PATH").or(self.model_path);
        self.status_path = env_path("ROLLCALL_STATUS_PATH").or(self.status_path);
        self.cascade_path = env_path("ROLLCALL_CASCADE_PATH").or(self.cascade_path);

        self.detector.scale_step = env_parse("ROLLCALL_SCALE_STEP", self.detector.scale_step);
        self.detector.min_neighbors = env_parse("ROLLCALL_MIN_NEIGHBORS", self.detector.min_neighbors);
        self.detector.min_size = env_parse("ROLLCALL_MIN_FACE_SIZE", self.detector.min_size);
        self.embedding_side = env_parse("ROLLCALL_EMBEDDING_SIDE", self.embedding_side);
        self.forest.n_trees = env_parse("ROLLCALL_TREES", self.forest.n_trees);
        self.forest.seed = env_parse("ROLLCALL_SEED", self.forest.seed);
        if let Some(jobs) = std::env::var("ROLLCALL_JOBS").ok().and_then(|v| v.parse().ok()) {
            self.forest.n_jobs = Some(jobs);
        }
        self.confidence_threshold =
            env_parse("ROLLCALL_CONFIDENCE_THRESHOLD", self.confidence_threshold);
        self
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.detector.validate().map_err(|e| match e {
            DetectorError::InvalidParams(msg) => ConfigError::Invalid(msg),
            other => ConfigError::Invalid(other.to_string()),
        })?;
        if self.embedding_side == 0 {
            return Err(ConfigError::Invalid("embedding_side must be > 0".into()));
        }
        if self.forest.n_trees == 0 {
            return Err(ConfigError::Invalid("forest.n_trees must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        Ok(self)
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.corpus_dir.clone().unwrap_or_else(|| self.data_dir.join("dataset"))
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_path.clone().unwrap_or_else(|| self.data_dir.join("model.json"))
    }

    pub fn status_path(&self) -> PathBuf {
        self.status_path.clone().unwrap_or_else(|| self.data_dir.join("train_status.json"))
    }

    pub fn cascade_path(&self) -> PathBuf {
        self.cascade_path.clone().unwrap_or_else(|| self.data_dir.join(CASCADE_FILE))
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
