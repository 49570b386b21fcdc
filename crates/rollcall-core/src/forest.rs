//! Random forest classifier over embeddings.
//!
//! Bootstrap-aggregated CART trees with Gini impurity and per-node random
//! feature subsets. Trees are grown in parallel from seeds drawn up front, so
//! a fixed master seed gives the same forest on any number of threads.

use crate::types::{Label, Prediction};
use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants ---
pub const DEFAULT_TREES: usize = 150;
pub const DEFAULT_SEED: u64 = 42;
const DEFAULT_MIN_SAMPLES_SPLIT: usize = 2;

#[derive(Error, Debug)]
pub enum ForestError {
    #[error("no training samples")]
    Empty,
    #[error("{samples} samples but {labels} labels")]
    LengthMismatch { samples: usize, labels: usize },
    #[error("forest needs at least one tree")]
    NoTrees,
    #[error("invalid training matrix: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A trained model mapping feature vectors to a label distribution.
pub trait Classifier {
    /// Class labels in the order used by [`Classifier::predict_proba`].
    fn classes(&self) -> &[Label];

    /// Expected feature vector length.
    fn n_features(&self) -> usize;

    /// Probability of every class, aligned with [`Classifier::classes`].
    fn predict_proba(&self, features: &[f32]) -> Vec<f32>;

    /// Most probable class. Ties go to the earliest class in [`Classifier::classes`].
    fn predict(&self, features: &[f32]) -> Option<Prediction> {
        let proba = self.predict_proba(features);
        let mut best: Option<(usize, f32)> = None;
        for (i, &p) in proba.iter().enumerate() {
            if best.map_or(true, |(_, b)| p > b) {
                best = Some((i, p));
            }
        }
        best.and_then(|(i, confidence)| {
            self.classes().get(i).map(|&label| Prediction { label, confidence })
        })
    }
}

/// Forest hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub n_trees: usize,
    pub seed: u64,
    /// Worker threads for tree construction (`None` = all cores).
    pub n_jobs: Option<usize>,
    /// Features tried per split (`None` = floor(sqrt(n_features))).
    pub max_features: Option<usize>,
    pub min_samples_split: usize,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: DEFAULT_TREES,
            seed: DEFAULT_SEED,
            n_jobs: None,
            max_features: None,
            min_samples_split: DEFAULT_MIN_SAMPLES_SPLIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
    Leaf {
        distribution: Vec<f32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TreeNodes")]
struct DecisionTree {
    nodes: Vec<Node>,
}

/// Unchecked form of a tree as stored in an artifact.
#[derive(Deserialize)]
struct TreeNodes {
    nodes: Vec<Node>,
}

impl TryFrom<TreeNodes> for DecisionTree {
    type Error = String;

    /// Children must point forward into the node list, so every walk ends at a leaf.
    fn try_from(raw: TreeNodes) -> Result<Self, Self::Error> {
        if raw.nodes.is_empty() {
            return Err("decision tree has no nodes".into());
        }
        for (id, node) in raw.nodes.iter().enumerate() {
            if let Node::Split { left, right, .. } = node {
                for child in [*left, *right] {
                    if child <= id || child >= raw.nodes.len() {
                        return Err(format!(
                            "node {id} points to child {child} of {} nodes",
                            raw.nodes.len()
                        ));
                    }
                }
            }
        }
        Ok(Self { nodes: raw.nodes })
    }
}

impl DecisionTree {
    fn distribution(&self, features: &[f32]) -> &[f32] {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Split { feature, threshold, left, right } => {
                    let value = features.get(*feature).copied().unwrap_or(0.0);
                    idx = if value <= *threshold { *left } else { *right };
                }
                Node::Leaf { distribution } => return distribution,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    classes: Vec<Label>,
    n_features: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Fit a forest on the rows of `x` with targets `y`.
    pub fn fit(params: &ForestParams, x: ArrayView2<f32>, y: &[Label]) -> Result<Self, ForestError> {
        let (n_samples, n_features) = x.dim();
        if n_samples == 0 || n_features == 0 {
            return Err(ForestError::Empty);
        }
        if n_samples != y.len() {
            return Err(ForestError::LengthMismatch { samples: n_samples, labels: y.len() });
        }
        if params.n_trees == 0 {
            return Err(ForestError::NoTrees);
        }

        let mut classes = y.to_vec();
        classes.sort_unstable();
        classes.dedup();
        let targets: Vec<usize> = y
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or(0))
            .collect();

        let max_features = params
            .max_features
            .unwrap_or_else(|| (n_features as f64).sqrt() as usize)
            .clamp(1, n_features);

        let mut master = StdRng::seed_from_u64(params.seed);
        let seeds: Vec<u64> = (0..params.n_trees).map(|_| master.gen()).collect();

        let grower = TreeGrower {
            x,
            y: &targets,
            n_classes: classes.len(),
            max_features,
            min_samples_split: params.min_samples_split.max(2),
        };
        let grow_all = || seeds.par_iter().map(|&seed| grower.grow(seed)).collect::<Vec<_>>();

        let trees = match params.n_jobs {
            Some(jobs) => rayon::ThreadPoolBuilder::new()
                .num_threads(jobs.max(1))
                .build()?
                .install(grow_all),
            None => grow_all(),
        };

        tracing::debug!(
            samples = n_samples,
            features = n_features,
            classes = classes.len(),
            trees = trees.len(),
            max_features,
            "random forest fitted"
        );

        Ok(Self { classes, n_features, trees })
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

impl Classifier for RandomForest {
    fn classes(&self) -> &[Label] {
        &self.classes
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict_proba(&self, features: &[f32]) -> Vec<f32> {
        let mut proba = vec![0.0f32; self.classes.len()];
        if self.trees.is_empty() {
            return proba;
        }
        for tree in &self.trees {
            for (acc, p) in proba.iter_mut().zip(tree.distribution(features)) {
                *acc += p;
            }
        }
        let n = self.trees.len() as f32;
        proba.iter_mut().for_each(|p| *p /= n);
        proba
    }
}

struct TreeGrower<'a> {
    x: ArrayView2<'a, f32>,
    y: &'a [usize],
    n_classes: usize,
    max_features: usize,
    min_samples_split: usize,
}

struct SplitChoice {
    feature: usize,
    threshold: f32,
    impurity: f64,
}

impl TreeGrower<'_> {
    fn grow(&self, seed: u64) -> DecisionTree {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = self.y.len();
        let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();

        let mut nodes = vec![Node::Leaf { distribution: Vec::new() }];
        let mut pending = vec![(0usize, bootstrap)];

        while let Some((id, samples)) = pending.pop() {
            let counts = self.class_counts(&samples);
            let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;

            let split = if pure || samples.len() < self.min_samples_split {
                None
            } else {
                self.best_split(&samples, &counts, &mut rng)
            };

            match split {
                Some(choice) => {
                    let (left, right): (Vec<usize>, Vec<usize>) = samples
                        .into_iter()
                        .partition(|&i| self.x[[i, choice.feature]] <= choice.threshold);
                    let left_id = nodes.len();
                    let right_id = left_id + 1;
                    nodes.push(Node::Leaf { distribution: Vec::new() });
                    nodes.push(Node::Leaf { distribution: Vec::new() });
                    nodes[id] = Node::Split {
                        feature: choice.feature,
                        threshold: choice.threshold,
                        left: left_id,
                        right: right_id,
                    };
                    pending.push((right_id, right));
                    pending.push((left_id, left));
                }
                None => {
                    let total = samples.len().max(1) as f32;
                    nodes[id] = Node::Leaf {
                        distribution: counts.iter().map(|&c| c as f32 / total).collect(),
                    };
                }
            }
        }

        DecisionTree { nodes }
    }

    fn class_counts(&self, samples: &[usize]) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_classes];
        for &i in samples {
            counts[self.y[i]] += 1;
        }
        counts
    }

    /// Best Gini split over randomly ordered features, stopping once
    /// `max_features` non-constant features have been examined.
    fn best_split(&self, samples: &[usize], counts: &[usize], rng: &mut StdRng) -> Option<SplitChoice> {
        let n = samples.len();
        let mut features: Vec<usize> = (0..self.x.ncols()).collect();
        features.shuffle(rng);

        let mut best: Option<SplitChoice> = None;
        let mut visited = 0;
        let mut column: Vec<(f32, usize)> = Vec::with_capacity(n);

        for feature in features {
            if visited >= self.max_features {
                break;
            }
            column.clear();
            column.extend(samples.iter().map(|&i| (self.x[[i, feature]], self.y[i])));
            column.sort_by(|a, b| a.0.total_cmp(&b.0));

            let (lo, hi) = (column[0].0, column[n - 1].0);
            if lo == hi {
                continue;
            }
            visited += 1;

            let mut left = vec![0usize; self.n_classes];
            let mut right = counts.to_vec();
            for j in 0..n - 1 {
                let (value, class) = column[j];
                left[class] += 1;
                right[class] -= 1;
                let next = column[j + 1].0;
                if value == next {
                    continue;
                }
                let n_left = j + 1;
                let n_right = n - n_left;
                let impurity = (n_left as f64 * gini(&left, n_left)
                    + n_right as f64 * gini(&right, n_right))
                    / n as f64;
                if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                    let mut threshold = value + (next - value) / 2.0;
                    if threshold >= next || !threshold.is_finite() {
                        threshold = value;
                    }
                    best = Some(SplitChoice { feature, threshold, impurity });
                }
            }
        }

        best
    }
}

fn gini(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let t = total as f64;
    1.0 - counts.iter().map(|&c| (c as f64 / t).powi(2)).sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Two well separated blobs in 4 dimensions.
    fn blobs() -> (Array2<f32>, Vec<Label>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..12 {
            let jitter = (i % 4) as f32 * 0.01;
            if i % 2 == 0 {
                rows.extend([0.1 + jitter, 0.2, 0.15 - jitter, 0.3]);
                labels.push(Label(7));
            } else {
                rows.extend([0.9 - jitter, 0.8, 0.85 + jitter, 0.7]);
                labels.push(Label(3));
            }
        }
        (Array2::from_shape_vec((12, 4), rows).unwrap(), labels)
    }

    fn small_params() -> ForestParams {
        ForestParams { n_trees: 25, ..Default::default() }
    }

    #[test]
    fn test_classes_sorted() {
        let (x, y) = blobs();
        let forest = RandomForest::fit(&small_params(), x.view(), &y).unwrap();
        assert_eq!(forest.classes(), &[Label(3), Label(7)]);
        assert_eq!(forest.n_features(), 4);
        assert_eq!(forest.tree_count(), 25);
    }

    #[test]
    fn test_predicts_separable_blobs() {
        let (x, y) = blobs();
        let forest = RandomForest::fit(&small_params(), x.view(), &y).unwrap();

        let a = forest.predict(&[0.12, 0.2, 0.14, 0.3]).unwrap();
        assert_eq!(a.label, Label(7));
        assert!(a.confidence > 0.5);

        let b = forest.predict(&[0.88, 0.8, 0.86, 0.7]).unwrap();
        assert_eq!(b.label, Label(3));
        assert!(b.confidence > 0.5);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let (x, y) = blobs();
        let forest = RandomForest::fit(&small_params(), x.view(), &y).unwrap();
        let p = forest.predict_proba(&[0.5, 0.5, 0.5, 0.5]);
        assert_eq!(p.len(), 2);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_same_seed_same_forest_any_thread_count() {
        let (x, y) = blobs();
        let single = ForestParams { n_jobs: Some(1), ..small_params() };
        let multi = ForestParams { n_jobs: Some(4), ..small_params() };
        let a = RandomForest::fit(&single, x.view(), &y).unwrap();
        let b = RandomForest::fit(&multi, x.view(), &y).unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
    }

    #[test]
    fn test_different_seed_changes_forest() {
        let (x, y) = blobs();
        let a = RandomForest::fit(&small_params(), x.view(), &y).unwrap();
        let b = RandomForest::fit(&ForestParams { seed: 7, ..small_params() }, x.view(), &y).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_single_class() {
        let x = Array2::from_shape_vec((3, 2), vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]).unwrap();
        let y = vec![Label(1); 3];
        let forest = RandomForest::fit(&small_params(), x.view(), &y).unwrap();
        let p = forest.predict(&[0.9, 0.9]).unwrap();
        assert_eq!(p.label, Label(1));
        assert_eq!(p.confidence, 1.0);
    }

    #[test]
    fn test_tie_goes_to_first_class() {
        // Identical rows with different labels cannot be split.
        let x = Array2::from_shape_vec((2, 2), vec![0.5, 0.5, 0.5, 0.5]).unwrap();
        let y = vec![Label(9), Label(2)];
        let params = ForestParams { n_trees: 1, ..Default::default() };
        let forest = RandomForest::fit(&params, x.view(), &y).unwrap();
        let p = forest.predict_proba(&[0.5, 0.5]);
        if p[0] == p[1] {
            assert_eq!(forest.predict(&[0.5, 0.5]).unwrap().label, Label(2));
        }
    }

    #[test]
    fn test_fit_errors() {
        let empty = Array2::<f32>::zeros((0, 4));
        assert!(matches!(
            RandomForest::fit(&small_params(), empty.view(), &[]),
            Err(ForestError::Empty)
        ));

        let (x, _) = blobs();
        assert!(matches!(
            RandomForest::fit(&small_params(), x.view(), &[Label(1)]),
            Err(ForestError::LengthMismatch { .. })
        ));

        let (x, y) = blobs();
        let none = ForestParams { n_trees: 0, ..Default::default() };
        assert!(matches!(RandomForest::fit(&none, x.view(), &y), Err(ForestError::NoTrees)));
    }

    /// Serialized `blobs` forest with `edit` applied to the first split root.
    fn tampered(edit: impl Fn(&mut serde_json::Value)) -> Vec<u8> {
        let (x, y) = blobs();
        let forest = RandomForest::fit(&small_params(), x.view(), &y).unwrap();
        let mut json = serde_json::to_value(&forest).unwrap();
        let root = json["trees"]
            .as_array_mut()
            .unwrap()
            .iter_mut()
            .map(|tree| &mut tree["nodes"][0])
            .find(|node| node["kind"] == "split")
            .unwrap();
        edit(root);
        serde_json::to_vec(&json).unwrap()
    }

    #[test]
    fn test_serialized_forest_loads() {
        let bytes = tampered(|_| {});
        let forest: RandomForest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(forest.tree_count(), 25);
    }

    #[test]
    fn test_out_of_range_child_rejected_on_load() {
        let bytes = tampered(|root| root["right"] = 999.into());
        let err = serde_json::from_slice::<RandomForest>(&bytes).unwrap_err();
        assert!(err.to_string().contains("child 999"), "{err}");
    }

    #[test]
    fn test_cyclic_child_rejected_on_load() {
        let bytes = tampered(|root| root["left"] = 0.into());
        assert!(serde_json::from_slice::<RandomForest>(&bytes).is_err());
    }

    #[test]
    fn test_gini() {
        assert_eq!(gini(&[4, 0], 4), 0.0);
        assert!((gini(&[2, 2], 4) - 0.5).abs() < 1e-12);
        assert_eq!(gini(&[0, 0], 0), 0.0);
    }
}
