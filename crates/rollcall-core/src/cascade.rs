//! Boosted Haar cascade model and window evaluation.
//!
//! Loads the OpenCV `<cascade>` XML format (HAAR features, stump or small-tree
//! weak classifiers), e.g. `haarcascade_frontalface_default.xml`.

use crate::imaging::IntegralImage;
use std::path::Path;
use thiserror::Error;

/// Subtracted from stage thresholds to absorb float rounding in the stored values.
const STAGE_THRESHOLD_EPS: f64 = 1e-5;
/// Minimum window side: variance normalisation uses the window shrunk by one pixel.
const MIN_WINDOW_SIDE: u32 = 3;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("missing element <{0}> in cascade")]
    MissingElement(&'static str),
    #[error("invalid value in <{element}>: {value:?}")]
    InvalidValue { element: &'static str, value: String },
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("inconsistent cascade: {0}")]
    Inconsistent(String),
}

/// One weighted rectangle of a Haar feature, in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaarRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// Haar-like feature: weighted sum of rectangle sums.
#[derive(Debug, Clone, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<HaarRect>,
}

impl HaarFeature {
    fn value(&self, ii: &IntegralImage, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| f64::from(r.weight) * ii.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// Internal node of a weak classifier tree.
///
/// `left`/`right` > 0 index another node; ≤ 0 index leaf `-left`/`-right`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeNode {
    pub feature: usize,
    pub threshold: f32,
    pub left: i32,
    pub right: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

impl WeakClassifier {
    /// Decision stump: `value < threshold` votes `below`, otherwise `above`.
    pub fn stump(feature: usize, threshold: f32, below: f32, above: f32) -> Self {
        Self {
            nodes: vec![TreeNode { feature, threshold, left: 0, right: -1 }],
            leaves: vec![below, above],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// A validated boosted cascade of Haar feature classifiers.
#[derive(Debug, Clone)]
pub struct Cascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl Cascade {
    /// Build a cascade, checking every index and rectangle against the window.
    pub fn new(
        window_width: u32,
        window_height: u32,
        stages: Vec<Stage>,
        features: Vec<HaarFeature>,
    ) -> Result<Self, CascadeError> {
        if window_width < MIN_WINDOW_SIDE || window_height < MIN_WINDOW_SIDE {
            return Err(CascadeError::Inconsistent(format!(
                "window {window_width}x{window_height} is smaller than {MIN_WINDOW_SIDE}x{MIN_WINDOW_SIDE}"
            )));
        }
        if stages.is_empty() {
            return Err(CascadeError::Inconsistent("cascade has no stages".into()));
        }

        for (fi, feature) in features.iter().enumerate() {
            for r in &feature.rects {
                if r.width == 0
                    || r.height == 0
                    || r.x + r.width > window_width
                    || r.y + r.height > window_height
                {
                    return Err(CascadeError::Inconsistent(format!(
                        "feature {fi} rectangle {r:?} outside {window_width}x{window_height} window"
                    )));
                }
            }
        }

        for (si, stage) in stages.iter().enumerate() {
            for weak in &stage.classifiers {
                if weak.nodes.is_empty() {
                    return Err(CascadeError::Inconsistent(format!("stage {si} has an empty tree")));
                }
                for node in &weak.nodes {
                    if node.feature >= features.len() {
                        return Err(CascadeError::Inconsistent(format!(
                            "stage {si} references feature {} of {}",
                            node.feature,
                            features.len()
                        )));
                    }
                    for child in [node.left, node.right] {
                        let ok = if child > 0 {
                            (child as usize) < weak.nodes.len()
                        } else {
                            (child.unsigned_abs() as usize) < weak.leaves.len()
                        };
                        if !ok {
                            return Err(CascadeError::Inconsistent(format!(
                                "stage {si} tree child {child} out of range"
                            )));
                        }
                    }
                }
            }
        }

        Ok(Self { window_width, window_height, stages, features })
    }

    /// Load an OpenCV cascade XML file.
    pub fn load(path: &str) -> Result<Self, CascadeError> {
        if !Path::new(path).exists() {
            return Err(CascadeError::NotFound(path.to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.to_string(),
            source,
        })?;
        let cascade = Self::from_opencv_xml(&text)?;

        tracing::info!(
            path,
            window = ?cascade.window_size(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse the OpenCV `<cascade>` XML format.
    pub fn from_opencv_xml(text: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(text)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or(CascadeError::MissingElement("cascade"))?;

        if let Some(stage_type) = child(root, "stageType") {
            let stage_type = text_of(stage_type);
            if !stage_type.eq_ignore_ascii_case("BOOST") {
                return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
            }
        }
        let feature_type = text_of(require(root, "featureType")?);
        if !feature_type.eq_ignore_ascii_case("HAAR") {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let window_width: u32 = parse_one(require(root, "width")?, "width")?;
        let window_height: u32 = parse_one(require(root, "height")?, "height")?;

        let mut stages = Vec::new();
        for stage_node in items(require(root, "stages")?) {
            let threshold: f32 = parse_one(require(stage_node, "stageThreshold")?, "stageThreshold")?;
            let mut classifiers = Vec::new();
            for weak_node in items(require(stage_node, "weakClassifiers")?) {
                classifiers.push(parse_weak(weak_node)?);
            }
            stages.push(Stage { threshold, classifiers });
        }

        let mut features = Vec::new();
        for feature_node in items(require(root, "features")?) {
            if let Some(tilted) = child(feature_node, "tilted") {
                if text_of(tilted) != "0" {
                    return Err(CascadeError::Unsupported("tilted Haar features".into()));
                }
            }
            let mut rects = Vec::new();
            for rect_node in items(require(feature_node, "rects")?) {
                let v: Vec<f32> = parse_all(rect_node, "rects")?;
                if v.len() != 5 || v[..4].iter().any(|c| *c < 0.0) {
                    return Err(invalid("rects", rect_node));
                }
                rects.push(HaarRect {
                    x: v[0] as u32,
                    y: v[1] as u32,
                    width: v[2] as u32,
                    height: v[3] as u32,
                    weight: v[4],
                });
            }
            features.push(HaarFeature { rects });
        }

        Self::new(window_width, window_height, stages, features)
    }

    /// Detection window size `(width, height)` in pixels.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run the cascade on the window whose top-left corner is `(x, y)`.
    ///
    /// Returns 1 when every stage accepts, otherwise `-i` for the rejecting
    /// stage `i` (so 0 means rejected by the first stage).
    pub(crate) fn evaluate(&self, ii: &IntegralImage, x: u32, y: u32) -> i32 {
        let inner_w = self.window_width - 2;
        let inner_h = self.window_height - 2;
        let area = f64::from(inner_w * inner_h);
        let sum = ii.sum(x + 1, y + 1, inner_w, inner_h) as f64;
        let sq = ii.sq_sum(x + 1, y + 1, inner_w, inner_h);
        let nf = area * sq - sum * sum;
        let inv_norm = if nf > 0.0 { 1.0 / nf.sqrt() } else { 1.0 };

        for (si, stage) in self.stages.iter().enumerate() {
            let mut total = 0.0f64;
            for weak in &stage.classifiers {
                let mut idx = 0i32;
                loop {
                    let node = &weak.nodes[idx as usize];
                    let value = self.features[node.feature].value(ii, x, y) * inv_norm;
                    idx = if value < f64::from(node.threshold) { node.left } else { node.right };
                    if idx <= 0 {
                        break;
                    }
                }
                total += f64::from(weak.leaves[idx.unsigned_abs() as usize]);
            }
            if total < f64::from(stage.threshold) - STAGE_THRESHOLD_EPS {
                return -(si as i32);
            }
        }

        1
    }
}

fn parse_weak(node: roxmltree::Node) -> Result<WeakClassifier, CascadeError> {
    let internal = require(node, "internalNodes")?;
    let raw: Vec<f64> = parse_all(internal, "internalNodes")?;
    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(invalid("internalNodes", internal));
    }
    let nodes = raw
        .chunks_exact(4)
        .map(|c| {
            if c[2] < 0.0 {
                return Err(invalid("internalNodes", internal));
            }
            Ok(TreeNode {
                left: c[0] as i32,
                right: c[1] as i32,
                feature: c[2] as usize,
                threshold: c[3] as f32,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let leaves = parse_all(require(node, "leafValues")?, "leafValues")?;
    Ok(WeakClassifier { nodes, leaves })
}

fn child<'a, 'i>(node: roxmltree::Node<'a, 'i>, name: &str) -> Option<roxmltree::Node<'a, 'i>> {
    node.children().find(|c| c.has_tag_name(name))
}

fn require<'a, 'i>(
    node: roxmltree::Node<'a, 'i>,
    name: &'static str,
) -> Result<roxmltree::Node<'a, 'i>, CascadeError> {
    child(node, name).ok_or(CascadeError::MissingElement(name))
}

/// OpenCV stores sequences as `<_>` children.
fn items<'a, 'i>(node: roxmltree::Node<'a, 'i>) -> impl Iterator<Item = roxmltree::Node<'a, 'i>> {
    node.children().filter(|c| c.is_element() && c.has_tag_name("_"))
}

fn text_of(node: roxmltree::Node) -> String {
    node.children()
        .filter(|c| c.is_text())
        .filter_map(|c| c.text())
        .collect::<String>()
        .trim()
        .to_string()
}

fn invalid(element: &'static str, node: roxmltree::Node) -> CascadeError {
    CascadeError::InvalidValue { element, value: text_of(node) }
}

fn parse_one<T: std::str::FromStr>(node: roxmltree::Node, element: &'static str) -> Result<T, CascadeError> {
    text_of(node).parse().map_err(|_| invalid(element, node))
}

fn parse_all<T: std::str::FromStr>(node: roxmltree::Node, element: &'static str) -> Result<Vec<T>, CascadeError> {
    text_of(node)
        .split_whitespace()
        .map(|tok| tok.parse().map_err(|_| invalid(element, node)))
        .collect()
}
