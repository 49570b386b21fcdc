//! Face locator + embedder composition shared by training and recognition.

use crate::config::Config;
use crate::detector::{CascadeLocator, DetectorError, FaceLocator};
use crate::embedder::Embedder;
use crate::types::Embedding;
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;

/// Decode encoded image bytes (JPEG, PNG, ...) into RGB.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Decode an image file, sniffing the format from its contents.
pub fn open(path: &Path) -> Result<RgbImage, image::ImageError> {
    Ok(image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?
        .to_rgb8())
}

/// Image → embedding: locate the first face, then embed it.
#[derive(Clone)]
pub struct FeatureExtractor {
    locator: Arc<dyn FaceLocator>,
    embedder: Embedder,
}

impl FeatureExtractor {
    pub fn new(locator: Arc<dyn FaceLocator>, embedder: Embedder) -> Self {
        Self { locator, embedder }
    }

    /// Load the configured cascade and build the extractor.
    pub fn from_config(config: &Config) -> Result<Self, DetectorError> {
        let cascade_path = config.cascade_path();
        let locator = CascadeLocator::load(&cascade_path.to_string_lossy(), config.detector.clone())?;
        Ok(Self::new(Arc::new(locator), Embedder::new(config.embedding_side)))
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    /// Embedding of the first located face, or `None` when no usable face was found.
    pub fn extract(&self, image: &RgbImage) -> Option<Embedding> {
        let region = self.locator.locate(image)?;
        self.embedder.embed(image, &region)
    }
}
