//! CART regression tree splitting on squared-error reduction.

use mp_types::{FeatureMatrix, MpResult, TargetVector, TrainingError};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::Regressor;

/// Decision tree configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    /// Maximum depth (None = grow until leaves are pure or too small)
    pub max_depth: Option<usize>,
    /// Minimum samples required to split a node
    pub min_samples_split: usize,
    /// Minimum samples in each leaf
    pub min_samples_leaf: usize,
    /// Features considered per split (None = all)
    pub max_features: Option<usize>,
    pub seed: u64,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Best split found for one node.
struct Candidate {
    feature: usize,
    threshold: f64,
    /// Squared-error reduction
    gain: f64,
}

/// Regression tree stored as a flat node arena; node 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTreeRegressor {
    params: TreeParams,
    nodes: Vec<Node>,
    n_features: usize,
}

impl DecisionTreeRegressor {
    pub fn new(params: TreeParams) -> Self {
        Self {
            params,
            nodes: Vec::new(),
            n_features: 0,
        }
    }

    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    pub fn is_fitted(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    pub fn depth(&self) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut deepest = 0;
        let mut pending = vec![(0usize, 0usize)];
        while let Some((at, depth)) = pending.pop() {
            match self.nodes[at] {
                Node::Leaf { .. } => deepest = deepest.max(depth),
                Node::Split { left, right, .. } => {
                    pending.push((left, depth + 1));
                    pending.push((right, depth + 1));
                }
            }
        }
        deepest
    }

    /// Fit on the rows of `features` listed in `rows` (repeats allowed, as
    /// produced by bootstrap sampling).
    pub fn fit_rows(&mut self, features: &FeatureMatrix, target: &TargetVector, rows: &[usize]) -> MpResult<()> {
        check_shapes(features, target)?;
        if rows.is_empty() {
            return Err(fit_failed("no training rows"));
        }
        if self.params.min_samples_leaf == 0 || self.params.min_samples_split < 2 {
            return Err(fit_failed("min_samples_leaf must be >= 1 and min_samples_split >= 2"));
        }

        self.n_features = features.n_cols();
        self.nodes.clear();
        let mut rng = ChaCha8Rng::seed_from_u64(self.params.seed);
        let mut rows = rows.to_vec();
        self.grow(features, target.as_slice(), &mut rows, &mut rng);
        Ok(())
    }

    /// Grow the tree depth-first with an explicit stack of
    /// `(node, start, end, depth)` ranges over `rows`. Left subtrees are
    /// expanded before right ones.
    fn grow(&mut self, features: &FeatureMatrix, y: &[f64], rows: &mut [usize], rng: &mut ChaCha8Rng) {
        self.nodes.push(Node::Leaf { value: 0.0 });
        let mut pending = vec![(0usize, 0usize, rows.len(), 0usize)];

        while let Some((at, start, end, depth)) = pending.pop() {
            let node_rows = &mut rows[start..end];
            let n = node_rows.len();
            let mean = node_rows.iter().map(|&r| y[r]).sum::<f64>() / n as f64;
            let sse: f64 = node_rows.iter().map(|&r| (y[r] - mean).powi(2)).sum();
            self.nodes[at] = Node::Leaf { value: mean };

            let depth_reached = self.params.max_depth.is_some_and(|max| depth >= max);
            if depth_reached
                || n < self.params.min_samples_split
                || n < 2 * self.params.min_samples_leaf
                || sse <= 1e-12
            {
                continue;
            }

            let Some(split) = self.best_split(features, y, node_rows, rng) else {
                continue;
            };

            // In-place partition: left block first.
            let mut boundary = 0;
            for i in 0..n {
                if features.get(node_rows[i], split.feature) <= split.threshold {
                    node_rows.swap(i, boundary);
                    boundary += 1;
                }
            }
            // A one-sided partition would revisit the same rows.
            if boundary == 0 || boundary == n {
                continue;
            }

            let left = self.nodes.len();
            let right = left + 1;
            self.nodes.push(Node::Leaf { value: mean });
            self.nodes.push(Node::Leaf { value: mean });
            self.nodes[at] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
            };
            pending.push((right, start + boundary, end, depth + 1));
            pending.push((left, start, start + boundary, depth + 1));
        }
    }

    /// Sorted scan over a random subset of features.
    fn best_split(
        &self,
        features: &FeatureMatrix,
        y: &[f64],
        rows: &[usize],
        rng: &mut ChaCha8Rng,
    ) -> Option<Candidate> {
        let n = rows.len();
        let min_leaf = self.params.min_samples_leaf;
        let n_try = self
            .params
            .max_features
            .unwrap_or(self.n_features)
            .clamp(1, self.n_features);

        let mut candidates: Vec<usize> = (0..self.n_features).collect();
        candidates.shuffle(rng);
        candidates.truncate(n_try);

        let total_sum: f64 = rows.iter().map(|&r| y[r]).sum();
        let parent_score = total_sum * total_sum / n as f64;

        let mut best: Option<Candidate> = None;
        let mut order: Vec<(f64, f64)> = Vec::with_capacity(n);
        for feature in candidates {
            order.clear();
            order.extend(rows.iter().map(|&r| (features.get(r, feature), y[r])));
            order.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_sum = 0.0;
            for i in 0..n - 1 {
                left_sum += order[i].1;
                let n_left = i + 1;
                if n_left < min_leaf || n - n_left < min_leaf || order[i].0 == order[i + 1].0 {
                    continue;
                }
                let right_sum = total_sum - left_sum;
                // SSE reduction = sum_l^2/n_l + sum_r^2/n_r - sum^2/n
                let gain = left_sum * left_sum / n_left as f64
                    + right_sum * right_sum / (n - n_left) as f64
                    - parent_score;
                if gain > 1e-12 && best.as_ref().map_or(true, |b| gain > b.gain) {
                    let mut threshold = (order[i].0 + order[i + 1].0) / 2.0;
                    if threshold >= order[i + 1].0 {
                        threshold = order[i].0;
                    }
                    if !threshold.is_finite() {
                        continue;
                    }
                    best = Some(Candidate {
                        feature,
                        threshold,
                        gain,
                    });
                }
            }
        }
        best
    }

    pub fn predict_row(&self, row: &[f64]) -> f64 {
        let mut at = 0;
        loop {
            match self.nodes[at] {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => at = if row[feature] <= threshold { left } else { right },
            }
        }
    }
}

impl Regressor for DecisionTreeRegressor {
    fn fit(&mut self, features: &FeatureMatrix, target: &TargetVector) -> MpResult<()> {
        let rows: Vec<usize> = (0..features.n_rows()).collect();
        self.fit_rows(features, target, &rows)
    }

    fn predict(&self, features: &FeatureMatrix) -> MpResult<Vec<f64>> {
        if !self.is_fitted() {
            return Err(fit_failed("tree has not been fitted"));
        }
        if features.n_cols() != self.n_features {
            return Err(fit_failed(&format!(
                "fitted on {} features, asked to predict with {}",
                self.n_features,
                features.n_cols()
            )));
        }
        Ok(features.iter_rows().map(|row| self.predict_row(row)).collect())
    }

    fn name(&self) -> &str {
        "decision_tree"
    }
}

pub(crate) fn check_shapes(features: &FeatureMatrix, target: &TargetVector) -> MpResult<()> {
    if features.n_rows() != target.len() {
        return Err(fit_failed(&format!(
            "{} feature rows but {} targets",
            features.n_rows(),
            target.len()
        )));
    }
    if features.is_empty() || features.n_cols() == 0 {
        return Err(fit_failed("empty training data"));
    }
    if let Some((row, col, value)) = features.first_non_finite() {
        return Err(fit_failed(&format!(
            "non-finite feature {} at row {}, column {}",
            value, row, col
        )));
    }
    Ok(())
}

pub(crate) fn fit_failed(message: &str) -> mp_types::MpError {
    TrainingError::FitFailed {
        message: message.to_string(),
    }
    .into()
}
