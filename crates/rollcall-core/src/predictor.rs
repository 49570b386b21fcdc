//! Recognition: image bytes → face → embedding → label and confidence.

use crate::forest::Classifier;
use crate::pipeline::{self, FeatureExtractor};
use crate::store::{ArtifactStore, ModelArtifact, StoreError};
use crate::types::{Embedding, Prediction};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("model expects {expected}-dim embeddings, got {actual}; retrain after changing the embedding size")]
    IncompatibleModel { expected: usize, actual: usize },
    #[error("model has no classes")]
    EmptyModel,
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of recognising one uploaded image.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    Recognized(Prediction),
    NoFace,
    NotTrained,
}

/// Most probable label for `embedding`.
///
/// Ties resolve to the lowest label. Confidence is returned as-is; callers
/// apply their own acceptance threshold.
pub fn predict<C: Classifier + ?Sized>(
    classifier: &C,
    embedding: &Embedding,
) -> Result<Prediction, PredictError> {
    if classifier.n_features() != embedding.len() {
        return Err(PredictError::IncompatibleModel {
            expected: classifier.n_features(),
            actual: embedding.len(),
        });
    }
    classifier.predict(&embedding.values).ok_or(PredictError::EmptyModel)
}

pub struct Predictor {
    extractor: FeatureExtractor,
    store: ArtifactStore,
}

impl Predictor {
    pub fn new(extractor: FeatureExtractor, store: ArtifactStore) -> Self {
        Self { extractor, store }
    }

    /// The persisted model, or `None` when no model has been trained yet.
    pub fn load(&self) -> Result<Option<ModelArtifact>, StoreError> {
        self.store.load()
    }

    /// Locate, embed and classify the face in an encoded image.
    ///
    /// The model is read fresh on every call so a concurrent retrain is
    /// picked up as soon as its artifact lands.
    pub fn predict_from_bytes(&self, bytes: &[u8]) -> Result<Recognition, PredictError> {
        let image = pipeline::decode(bytes)?;

        let Some(embedding) = self.extractor.extract(&image) else {
            tracing::debug!("recognition: no face detected");
            return Ok(Recognition::NoFace);
        };

        let Some(model) = self.load()? else {
            tracing::info!("recognition: model not trained");
            return Ok(Recognition::NotTrained);
        };

        let prediction = predict(&model.classifier, &embedding)?;
        tracing::info!(
            label = %prediction.label,
            confidence = prediction.confidence,
            "recognition complete"
        );
        Ok(Recognition::Recognized(prediction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Label;

    struct Fixed {
        classes: Vec<Label>,
        proba: Vec<f32>,
    }

    impl Classifier for Fixed {
        fn classes(&self) -> &[Label] {
            &self.classes
        }
        fn n_features(&self) -> usize {
            2
        }
        fn predict_proba(&self, _features: &[f32]) -> Vec<f32> {
            self.proba.clone()
        }
    }

    fn emb(n: usize) -> Embedding {
        Embedding { values: vec![0.5; n] }
    }

    #[test]
    fn test_predict_argmax() {
        let c = Fixed { classes: vec![Label(1), Label(2), Label(5)], proba: vec![0.2, 0.7, 0.1] };
        let p = predict(&c, &emb(2)).unwrap();
        assert_eq!(p.label, Label(2));
        assert!((p.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_predict_does_not_threshold() {
        let c = Fixed { classes: vec![Label(1), Label(2), Label(3)], proba: vec![0.3, 0.3, 0.4] };
        let p = predict(&c, &emb(2)).unwrap();
        assert_eq!(p.label, Label(3));
        assert!(p.confidence < 0.5);
    }

    #[test]
    fn test_predict_tie_lowest_label() {
        let c = Fixed { classes: vec![Label(4), Label(8)], proba: vec![0.5, 0.5] };
        assert_eq!(predict(&c, &emb(2)).unwrap().label, Label(4));
    }

    #[test]
    fn test_predict_dimension_mismatch() {
        let c = Fixed { classes: vec![Label(1)], proba: vec![1.0] };
        assert!(matches!(
            predict(&c, &emb(3)),
            Err(PredictError::IncompatibleModel { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_predict_empty_model() {
        let c = Fixed { classes: vec![], proba: vec![] };
        assert!(matches!(predict(&c, &emb(2)), Err(PredictError::EmptyModel)));
    }
}
