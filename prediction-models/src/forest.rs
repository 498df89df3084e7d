// Random forest family
// Per horizon: a 3-class direction forest voting with leaf class
// frequencies, plus a regression forest for the expected move size.

use crate::family::{normalize_probs, FamilyForecast, ModelError, ModelFamily};
use crate::training::TrainingSet;
use common::Horizon;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Direction classes: DOWN, FLAT, UP
const N_CLASSES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum TreeTask {
    Classification,
    Regression,
}

/// Tunable knobs for forest training
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestSettings {
    #[serde(default = "default_n_trees")]
    pub n_trees: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_min_samples_split")]
    pub min_samples_split: usize,
    #[serde(default = "default_min_samples_leaf")]
    pub min_samples_leaf: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_n_trees() -> usize {
    60
}

fn default_max_depth() -> usize {
    6
}

fn default_min_samples_split() -> usize {
    4
}

fn default_min_samples_leaf() -> usize {
    2
}

fn default_seed() -> u64 {
    42
}

impl Default for ForestSettings {
    fn default() -> Self {
        Self {
            n_trees: default_n_trees(),
            max_depth: default_max_depth(),
            min_samples_split: default_min_samples_split(),
            min_samples_leaf: default_min_samples_leaf(),
            seed: default_seed(),
        }
    }
}

/// Binary split node; leaves carry the class distribution
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeNode {
    feature_idx: Option<usize>,
    threshold: Option<f64>,
    /// Leaf output: majority class index or mean target
    value: f64,
    class_probs: Option<Vec<f64>>,
    n_samples: usize,
    left: Option<Box<TreeNode>>,
    right: Option<Box<TreeNode>>,
}

impl TreeNode {
    fn leaf(value: f64, class_probs: Option<Vec<f64>>, n_samples: usize) -> Self {
        Self {
            feature_idx: None,
            threshold: None,
            value,
            class_probs,
            n_samples,
            left: None,
            right: None,
        }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecisionTree {
    task: TreeTask,
    max_depth: usize,
    min_samples_split: usize,
    min_samples_leaf: usize,
    max_features: usize,
    root: Option<Box<TreeNode>>,
}

impl DecisionTree {
    fn new(
        task: TreeTask,
        settings: &ForestSettings,
        max_features: usize,
    ) -> Self {
        Self {
            task,
            max_depth: settings.max_depth,
            min_samples_split: settings.min_samples_split,
            min_samples_leaf: settings.min_samples_leaf,
            max_features,
            root: None,
        }
    }

    fn fit(&mut self, features: &[Vec<f64>], labels: &[f64], indices: &[usize], rng: &mut ChaCha8Rng) {
        self.root = Some(Box::new(self.build_node(features, labels, indices, 0, rng)));
    }

    fn build_node(
        &self,
        features: &[Vec<f64>],
        labels: &[f64],
        indices: &[usize],
        depth: usize,
        rng: &mut ChaCha8Rng,
    ) -> TreeNode {
        let n = indices.len();
        let first = labels[indices[0]];
        let pure = indices.iter().all(|&i| (labels[i] - first).abs() < f64::EPSILON);

        if depth >= self.max_depth || n < self.min_samples_split || pure {
            return self.make_leaf(labels, indices);
        }

        let split = match self.find_best_split(features, labels, indices, rng) {
            Some(split) => split,
            None => return self.make_leaf(labels, indices),
        };

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .copied()
            .partition(|&i| features[i][split.feature_idx] <= split.threshold);

        let left = self.build_node(features, labels, &left_idx, depth + 1, rng);
        let right = self.build_node(features, labels, &right_idx, depth + 1, rng);

        TreeNode {
            feature_idx: Some(split.feature_idx),
            threshold: Some(split.threshold),
            value: 0.0,
            class_probs: None,
            n_samples: n,
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
        }
    }

    fn make_leaf(&self, labels: &[f64], indices: &[usize]) -> TreeNode {
        match self.task {
            TreeTask::Classification => {
                let probs = class_frequencies(labels, indices);
                let majority = probs
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(idx, _)| idx as f64)
                    .unwrap_or(0.0);
                TreeNode::leaf(majority, Some(probs), indices.len())
            }
            TreeTask::Regression => {
                let mean = indices.iter().map(|&i| labels[i]).sum::<f64>() / indices.len() as f64;
                TreeNode::leaf(mean, None, indices.len())
            }
        }
    }

    fn find_best_split(
        &self,
        features: &[Vec<f64>],
        labels: &[f64],
        indices: &[usize],
        rng: &mut ChaCha8Rng,
    ) -> Option<Split> {
        let n_features = features[indices[0]].len();
        let mut candidates: Vec<usize> = (0..n_features).collect();
        candidates.shuffle(rng);
        candidates.truncate(self.max_features.max(1));

        let parent_impurity = self.impurity(labels, indices);
        let mut best: Option<Split> = None;
        let mut best_gain = 1e-9;

        for &feature_idx in &candidates {
            let mut values: Vec<f64> = indices.iter().map(|&i| features[i][feature_idx]).collect();
            values.sort_by(f64::total_cmp);
            values.dedup();
            if values.len() < 2 {
                continue;
            }

            let min_leaf = self.min_samples_leaf.max(1);
            for pair in values.windows(2) {
                let threshold = (pair[0] + pair[1]) / 2.0;
                let (left, right): (Vec<usize>, Vec<usize>) = indices
                    .iter()
                    .copied()
                    .partition(|&i| features[i][feature_idx] <= threshold);
                if left.len() < min_leaf || right.len() < min_leaf {
                    continue;
                }

                let n = indices.len() as f64;
                let weighted = (left.len() as f64 / n) * self.impurity(labels, &left)
                    + (right.len() as f64 / n) * self.impurity(labels, &right);
                let gain = parent_impurity - weighted;
                if gain > best_gain {
                    best_gain = gain;
                    best = Some(Split {
                        feature_idx,
                        threshold,
                    });
                }
            }
        }

        best
    }

    fn impurity(&self, labels: &[f64], indices: &[usize]) -> f64 {
        match self.task {
            TreeTask::Classification => gini(labels, indices),
            TreeTask::Regression => variance(labels, indices),
        }
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        self.descend(row).map(|node| node.value).unwrap_or(0.0)
    }

    fn class_probs_row(&self, row: &[f64]) -> Vec<f64> {
        self.descend(row)
            .and_then(|node| node.class_probs.clone())
            .unwrap_or_else(|| vec![1.0 / N_CLASSES as f64; N_CLASSES])
    }

    fn descend(&self, row: &[f64]) -> Option<&TreeNode> {
        let mut node = self.root.as_deref()?;
        while !node.is_leaf() {
            let feature_idx = node.feature_idx?;
            let threshold = node.threshold?;
            let next = if row.get(feature_idx).copied().unwrap_or(0.0) <= threshold {
                node.left.as_deref()
            } else {
                node.right.as_deref()
            };
            match next {
                Some(child) => node = child,
                None => break,
            }
        }
        Some(node)
    }
}

struct Split {
    feature_idx: usize,
    threshold: f64,
}

fn class_frequencies(labels: &[f64], indices: &[usize]) -> Vec<f64> {
    let mut counts = vec![0usize; N_CLASSES];
    for &i in indices {
        let class = (labels[i].round() as usize).min(N_CLASSES - 1);
        counts[class] += 1;
    }
    let total = indices.len().max(1) as f64;
    counts.iter().map(|&c| c as f64 / total).collect()
}

fn gini(labels: &[f64], indices: &[usize]) -> f64 {
    let probs = class_frequencies(labels, indices);
    1.0 - probs.iter().map(|p| p * p).sum::<f64>()
}

fn variance(labels: &[f64], indices: &[usize]) -> f64 {
    if indices.is_empty() {
        return 0.0;
    }
    let n = indices.len() as f64;
    let mean = indices.iter().map(|&i| labels[i]).sum::<f64>() / n;
    indices.iter().map(|&i| (labels[i] - mean).powi(2)).sum::<f64>() / n
}

/// Bagged ensemble of decision trees with per-tree feature subsampling
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RandomForest {
    task: TreeTask,
    trees: Vec<DecisionTree>,
    n_features: usize,
}

impl RandomForest {
    fn fit(
        task: TreeTask,
        features: &[Vec<f64>],
        labels: &[f64],
        settings: &ForestSettings,
    ) -> Result<Self, ModelError> {
        if features.is_empty() || features.len() != labels.len() {
            return Err(ModelError::InvalidData(format!(
                "forest needs matching features and labels, got {} and {}",
                features.len(),
                labels.len()
            )));
        }
        let n_features = features[0].len();
        let max_features = match task {
            TreeTask::Classification => (n_features as f64).sqrt().ceil() as usize,
            TreeTask::Regression => (n_features / 3).max(1),
        };

        let n = features.len();
        let trees: Vec<DecisionTree> = (0..settings.n_trees)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = ChaCha8Rng::seed_from_u64(settings.seed.wrapping_add(tree_idx as u64));
                let indices: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                let mut tree = DecisionTree::new(task, settings, max_features);
                tree.fit(features, labels, &indices, &mut rng);
                tree
            })
            .collect();

        Ok(Self {
            task,
            trees,
            n_features,
        })
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / self.trees.len() as f64
    }

    /// Mean of per-tree leaf class frequencies
    fn class_probs_row(&self, row: &[f64]) -> [f64; N_CLASSES] {
        let mut sums = [0.0; N_CLASSES];
        for tree in &self.trees {
            let probs = tree.class_probs_row(row);
            for (sum, p) in sums.iter_mut().zip(probs.iter()) {
                *sum += p;
            }
        }
        normalize_probs(&mut sums);
        sums
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HorizonForest {
    horizon: Horizon,
    classifier: RandomForest,
    regressor: RandomForest,
}

/// Forest model family: independent direction and magnitude forests
/// per horizon, trained from the same feature matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestFamily {
    horizons: Vec<HorizonForest>,
}

impl ForestFamily {
    pub fn fit(set: &TrainingSet, settings: &ForestSettings) -> Result<Self, ModelError> {
        if set.is_empty() {
            return Err(ModelError::TrainingFailed(
                "empty training set".to_string(),
            ));
        }

        let mut horizons = Vec::with_capacity(set.targets.len());
        for targets in &set.targets {
            let class_labels: Vec<f64> = targets.classes.iter().map(|&c| c as f64).collect();
            let classifier = RandomForest::fit(
                TreeTask::Classification,
                &set.features,
                &class_labels,
                settings,
            )?;
            let regressor = RandomForest::fit(
                TreeTask::Regression,
                &set.features,
                &targets.returns_pct,
                settings,
            )?;
            horizons.push(HorizonForest {
                horizon: targets.horizon,
                classifier,
                regressor,
            });
        }

        Ok(Self { horizons })
    }

    fn horizon_forest(&self, horizon: Horizon) -> Result<&HorizonForest, ModelError> {
        self.horizons
            .iter()
            .find(|h| h.horizon == horizon)
            .ok_or(ModelError::NotTrained(horizon))
    }
}

impl ModelFamily for ForestFamily {
    fn name(&self) -> &'static str {
        "forest"
    }

    fn forecast(&self, features: &[f64], horizon: Horizon) -> Result<FamilyForecast, ModelError> {
        let forest = self.horizon_forest(horizon)?;
        if features.len() != forest.classifier.n_features {
            return Err(ModelError::InvalidData(format!(
                "expected {} features, got {}",
                forest.classifier.n_features,
                features.len()
            )));
        }
        let class_probs = forest.classifier.class_probs_row(features);
        let magnitude_pct = forest.regressor.predict_row(features);
        Ok(FamilyForecast::new(class_probs, magnitude_pct))
    }
}
