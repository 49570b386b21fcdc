//! Corpus walk, feature extraction and classifier fitting.
//!
//! Corpus layout: `corpus_root/<label>/<image files>`. Label directories are
//! processed in directory listing order.

use crate::forest::{Classifier, ForestError, ForestParams, RandomForest};
use crate::pipeline::{self, FeatureExtractor};
use crate::progress::ProgressReporter;
use crate::store::{ArtifactStore, ModelArtifact, StoreError};
use crate::types::Label;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Share of total progress reserved for feature extraction.
const EXTRACTION_PROGRESS_CAP: usize = 80;
const FITTING_PROGRESS: u8 = 85;
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("cannot read corpus directory {path}: {source}")]
    Corpus {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("classifier fit failed: {0}")]
    Fit(#[from] ForestError),
    #[error("failed to persist model: {0}")]
    Store(#[from] StoreError),
}

/// What a training run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome {
    Trained(TrainingSummary),
    /// No usable face in the corpus; any existing model was left untouched.
    NoData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub samples: usize,
    pub labels: usize,
    pub images_skipped: usize,
    /// SHA-256 of the persisted artifact.
    pub digest: String,
}

pub struct Trainer {
    extractor: FeatureExtractor,
    forest: ForestParams,
    store: ArtifactStore,
}

impl Trainer {
    pub fn new(extractor: FeatureExtractor, forest: ForestParams, store: ArtifactStore) -> Self {
        Self { extractor, forest, store }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Extract features from the corpus, fit the forest and persist it.
    pub fn train(
        &self,
        corpus_root: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<TrainingOutcome, TrainError> {
        let label_dirs = list_label_dirs(corpus_root)?;
        let total = label_dirs.len().max(1);
        tracing::info!(corpus = %corpus_root.display(), labels = label_dirs.len(), "training started");

        let dimension = self.extractor.embedder().dimension();
        let mut features: Vec<f32> = Vec::new();
        let mut targets: Vec<Label> = Vec::new();
        let mut skipped = 0usize;

        for (i, dir) in label_dirs.iter().enumerate() {
            let name = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            match name.parse::<Label>() {
                Ok(label) => {
                    let before = targets.len();
                    for file in list_images(dir) {
                        match self.embed_file(&file) {
                            Some(values) => {
                                features.extend(values);
                                targets.push(label);
                            }
                            None => skipped += 1,
                        }
                    }
                    tracing::debug!(%label, samples = targets.len() - before, "label processed");
                }
                Err(_) => {
                    tracing::warn!(dir = %dir.display(), "skipping corpus directory: name is not a student id");
                }
            }

            let processed = i + 1;
            let percent = (processed * EXTRACTION_PROGRESS_CAP / total) as u8;
            progress.report(percent, &format!("Processed {processed}/{total} students"));
        }

        if targets.is_empty() {
            tracing::warn!(skipped, "no training data found; keeping existing model");
            progress.report(0, "No training data found");
            return Ok(TrainingOutcome::NoData);
        }

        progress.report(FITTING_PROGRESS, "Training RandomForest...");
        let x = Array2::from_shape_vec((targets.len(), dimension), features)
            .map_err(ForestError::from)?;
        let classifier = RandomForest::fit(&self.forest, x.view(), &targets)?;
        let labels = classifier.classes().len();

        let artifact = ModelArtifact {
            embedding_side: self.extractor.embedder().side(),
            samples: targets.len(),
            classifier,
        };
        let digest = self.store.save(&artifact)?;
        progress.report(100, "Training complete");

        let summary = TrainingSummary {
            samples: targets.len(),
            labels,
            images_skipped: skipped,
            digest,
        };
        tracing::info!(
            samples = summary.samples,
            labels = summary.labels,
            skipped = summary.images_skipped,
            "training complete"
        );
        Ok(TrainingOutcome::Trained(summary))
    }

    /// Decode, locate and embed one corpus image; `None` skips it.
    fn embed_file(&self, path: &Path) -> Option<Vec<f32>> {
        let image = match pipeline::open(path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping undecodable image");
                return None;
            }
        };
        let embedding = self.extractor.extract(&image);
        if embedding.is_none() {
            tracing::debug!(path = %path.display(), "no face detected");
        }
        embedding.map(|e| e.values)
    }
}

/// Immediate subdirectories of the corpus root, in listing order.
fn list_label_dirs(corpus_root: &Path) -> Result<Vec<PathBuf>, TrainError> {
    let entries = std::fs::read_dir(corpus_root).map_err(|source| TrainError::Corpus {
        path: corpus_root.to_path_buf(),
        source,
    })?;

    Ok(entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable corpus entry");
                None
            }
        })
        .filter(|path| path.is_dir())
        .collect())
}

/// Image files directly inside a label directory, in listing order.
fn list_images(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot list label directory");
            return Vec::new();
        }
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_image_extension(path))
        .collect()
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_extensions() {
        assert!(has_image_extension(Path::new("a/b.jpg")));
        assert!(has_image_extension(Path::new("a/b.JPEG")));
        assert!(has_image_extension(Path::new("b.Png")));
        assert!(!has_image_extension(Path::new("b.gif")));
        assert!(!has_image_extension(Path::new("notes.txt")));
        assert!(!has_image_extension(Path::new("jpg")));
    }

    #[test]
    fn test_missing_corpus_is_error() {
        let err = list_label_dirs(Path::new("/nonexistent/corpus")).unwrap_err();
        assert!(matches!(err, TrainError::Corpus { .. }));
    }

    #[test]
    fn test_label_dirs_skip_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("1")).unwrap();
        std::fs::create_dir(dir.path().join("2")).unwrap();
        std::fs::write(dir.path().join("readme.txt"), "x").unwrap();
        let mut dirs = list_label_dirs(dir.path()).unwrap();
        dirs.sort();
        assert_eq!(dirs, vec![dir.path().join("1"), dir.path().join("2")]);
    }
}
