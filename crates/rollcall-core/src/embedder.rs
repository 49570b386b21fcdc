//! Intensity-patch face embedder.
//!
//! Crops the located face, converts it to intensity, area-resamples it to a
//! canonical square and flattens it into a vector in [0, 1].

use crate::imaging;
use crate::types::{Embedding, FaceRegion};
use image::RgbImage;

// --- Named constants ---
pub const DEFAULT_EMBEDDING_SIDE: u32 = 32;
const INTENSITY_SCALE: f32 = 255.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Embedder {
    side: u32,
}

impl Default for Embedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_SIDE)
    }
}

impl Embedder {
    /// Embedder producing `side × side` patches. A side of 0 is treated as 1.
    pub fn new(side: u32) -> Self {
        Self { side: side.max(1) }
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    /// Length of every embedding this embedder produces.
    pub fn dimension(&self) -> usize {
        (self.side * self.side) as usize
    }

    /// Embed the face in `region`.
    ///
    /// Returns `None` for regions with non-positive width or height, or when
    /// the region does not intersect the image.
    pub fn embed(&self, image: &RgbImage, region: &FaceRegion) -> Option<Embedding> {
        let Some((x, y, w, h)) = region.clip(image.width(), image.height()) else {
            tracing::trace!(?region, "rejecting empty face region");
            return None;
        };

        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        let gray = imaging::to_intensity(&crop);
        let patch = imaging::resize_area(&gray, self.side, self.side);

        let values = patch
            .as_raw()
            .iter()
            .map(|&p| f32::from(p) / INTENSITY_SCALE)
            .collect();

        Some(Embedding { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn textured(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) * 3 % 256) as u8])
        })
    }

    #[test]
    fn test_embedding_length_and_range() {
        let img = textured(200, 150);
        let emb = Embedder::default()
            .embed(&img, &FaceRegion::new(20, 10, 120, 100))
            .unwrap();
        assert_eq!(emb.len(), 1024);
        assert!(emb.values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_embedding_deterministic() {
        let img = textured(97, 83);
        let region = FaceRegion::new(3, 7, 61, 59);
        let embedder = Embedder::default();
        let a = embedder.embed(&img, &region).unwrap();
        let b = embedder.embed(&img, &region).unwrap();
        let bits = |e: &Embedding| e.values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a), bits(&b));
    }

    #[test]
    fn test_non_positive_regions_rejected() {
        let img = textured(64, 64);
        let embedder = Embedder::default();
        for region in [
            FaceRegion::new(0, 0, 0, 10),
            FaceRegion::new(0, 0, 10, 0),
            FaceRegion::new(5, 5, -4, 10),
            FaceRegion::new(5, 5, 10, -1),
        ] {
            assert!(embedder.embed(&img, &region).is_none(), "{region:?}");
        }
    }

    #[test]
    fn test_region_outside_image_rejected() {
        let img = textured(64, 64);
        assert!(Embedder::default()
            .embed(&img, &FaceRegion::new(100, 100, 20, 20))
            .is_none());
    }

    #[test]
    fn test_uniform_face_gives_constant_embedding() {
        let img = RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]));
        let emb = Embedder::new(8).embed(&img, &FaceRegion::new(0, 0, 64, 64)).unwrap();
        assert_eq!(emb.len(), 64);
        assert!(emb.values.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_small_face_is_upsampled() {
        let img = textured(40, 40);
        let emb = Embedder::default().embed(&img, &FaceRegion::new(10, 10, 12, 12)).unwrap();
        assert_eq!(emb.len(), Embedder::default().dimension());
    }
}
