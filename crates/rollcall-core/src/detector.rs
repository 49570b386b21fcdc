//! Haar cascade face locator.
//!
//! Scans an intensity pyramid with a boosted cascade and merges overlapping
//! hits into clusters. The first cluster (in scan order) is the located face.

use crate::cascade::{Cascade, CascadeError};
use crate::imaging::{self, IntegralImage};
use crate::types::FaceRegion;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
pub const DEFAULT_SCALE_STEP: f64 = 1.1;
pub const DEFAULT_MIN_NEIGHBORS: usize = 4;
/// Relative tolerance for merging candidate rectangles into one cluster.
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade: {0}")]
    Cascade(#[from] CascadeError),
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
}

/// Cascade scan parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Pyramid scale step between successive window sizes (> 1).
    pub scale_step: f64,
    /// A cluster needs strictly more than this many raw hits to be reported.
    /// 0 disables grouping.
    pub min_neighbors: usize,
    /// Smallest window side in pixels (0 = no limit).
    pub min_size: u32,
    /// Largest window side in pixels (0 = image size).
    pub max_size: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_step: DEFAULT_SCALE_STEP,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: 0,
            max_size: 0,
        }
    }
}

impl DetectorParams {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(self.scale_step > 1.0) || !self.scale_step.is_finite() {
            return Err(DetectorError::InvalidParams(format!(
                "scale_step must be > 1.0, got {}",
                self.scale_step
            )));
        }
        if self.max_size != 0 && self.max_size < self.min_size {
            return Err(DetectorError::InvalidParams(format!(
                "max_size {} below min_size {}",
                self.max_size, self.min_size
            )));
        }
        Ok(())
    }
}

/// Pluggable face locator.
///
/// Implementations return candidate regions in their own output order;
/// [`FaceLocator::locate`] always takes the first one.
pub trait FaceLocator: Send + Sync {
    /// Detect faces in a single-channel intensity image.
    fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion>;

    /// Locate one face in a colour image, or `None` when nothing was found.
    fn locate(&self, image: &RgbImage) -> Option<FaceRegion> {
        let gray = imaging::to_intensity(image);
        self.detect(&gray).into_iter().next()
    }
}

/// Viola-Jones cascade locator.
pub struct CascadeLocator {
    cascade: Cascade,
    params: DetectorParams,
}

impl CascadeLocator {
    pub fn new(cascade: Cascade, params: DetectorParams) -> Result<Self, DetectorError> {
        params.validate()?;
        Ok(Self { cascade, params })
    }

    /// Load an OpenCV cascade XML file from the given path.
    pub fn load(cascade_path: &str, params: DetectorParams) -> Result<Self, DetectorError> {
        let cascade = Cascade::load(cascade_path)?;
        tracing::debug!(?params, "cascade locator ready");
        Self::new(cascade, params)
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Raw cascade hits, ordered by scale, then row, then column.
    fn candidates(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let (win_w, win_h) = self.cascade.window_size();
        let (img_w, img_h) = gray.dimensions();
        let max_side = if self.params.max_size == 0 {
            img_w.max(img_h)
        } else {
            self.params.max_size
        };

        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let scaled_w = (f64::from(img_w) / factor).round() as u32;
            let scaled_h = (f64::from(img_h) / factor).round() as u32;
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }
            let window_w = (f64::from(win_w) * factor).round() as u32;
            let window_h = (f64::from(win_h) * factor).round() as u32;
            if window_w > max_side || window_h > max_side {
                break;
            }

            if window_w >= self.params.min_size && window_h >= self.params.min_size {
                let scaled = imaging::resize_bilinear(gray, scaled_w, scaled_h);
                let ii = IntegralImage::new(&scaled);
                let step = if factor > 2.0 { 1 } else { 2 };
                let range_w = scaled_w - win_w + 1;
                let range_h = scaled_h - win_h + 1;

                let mut y = 0;
                while y < range_h {
                    let mut x = 0;
                    while x < range_w {
                        let result = self.cascade.evaluate(&ii, x, y);
                        if result > 0 {
                            hits.push(FaceRegion::new(
                                (f64::from(x) * factor).round() as i32,
                                (f64::from(y) * factor).round() as i32,
                                window_w as i32,
                                window_h as i32,
                            ));
                        }
                        // Rejected by the first stage: the neighbour is unlikely too.
                        if result == 0 {
                            x += step;
                        }
                        x += step;
                    }
                    y += step;
                }
            }

            factor *= self.params.scale_step;
        }

        hits
    }
}

impl FaceLocator for CascadeLocator {
    fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let hits = self.candidates(gray);
        let faces = group_rectangles(&hits, self.params.min_neighbors, GROUP_EPS);
        tracing::debug!(
            width = gray.width(),
            height = gray.height(),
            hits = hits.len(),
            faces = faces.len(),
            "cascade scan complete"
        );
        faces
    }
}

/// Whether two rectangles are close enough to belong to the same cluster.
fn similar(a: &FaceRegion, b: &FaceRegion, eps: f64) -> bool {
    let delta = eps * f64::from(a.width.min(b.width) + a.height.min(b.height)) * 0.5;
    f64::from((a.x - b.x).abs()) <= delta
        && f64::from((a.y - b.y).abs()) <= delta
        && f64::from((a.x + a.width - b.x - b.width).abs()) <= delta
        && f64::from((a.y + a.height - b.y - b.height).abs()) <= delta
}

/// Partition rectangles into equivalence classes of the `similar` relation.
///
/// Class ids are assigned in order of each class's first member.
fn partition(rects: &[FaceRegion], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj.max(ri)] = ri.min(rj);
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; rects.len()];
    let mut labels = Vec::with_capacity(rects.len());
    let mut classes = 0;
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels.push(class_of_root[root]);
    }

    (labels, classes)
}

/// Merge raw detections into averaged clusters.
///
/// Clusters with `group_threshold` or fewer members are dropped, as are
/// clusters lying inside a better-supported one. A threshold of 0 returns
/// the input unchanged.
pub(crate) fn group_rectangles(rects: &[FaceRegion], group_threshold: usize, eps: f64) -> Vec<FaceRegion> {
    if group_threshold == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let (labels, classes) = partition(rects, eps);
    let mut sums = vec![[0i64; 4]; classes];
    let mut counts = vec![0usize; classes];
    for (r, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += i64::from(r.x);
        s[1] += i64::from(r.y);
        s[2] += i64::from(r.width);
        s[3] += i64::from(r.height);
        counts[label] += 1;
    }

    let clusters: Vec<(FaceRegion, usize)> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: i64| (v as f64 / n as f64).round() as i32;
            (FaceRegion::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3])), n)
        })
        .collect();

    let mut faces = Vec::new();
    for (i, &(r1, n1)) in clusters.iter().enumerate() {
        if n1 <= group_threshold {
            continue;
        }
        let nested = clusters.iter().enumerate().any(|(j, &(r2, n2))| {
            if j == i || n2 <= group_threshold {
                return false;
            }
            let dx = (f64::from(r2.width) * eps).round() as i32;
            let dy = (f64::from(r2.height) * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            faces.push(r1);
        }
    }

    faces
}
