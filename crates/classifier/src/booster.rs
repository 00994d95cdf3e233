//! Multinomial gradient-boosted regression trees over sparse features.
//!
//! One regression tree per class per boosting stage, fitted to the
//! softmax residuals `y_k - p_k`. Splits are chosen by Friedman's MSE
//! improvement with an exhaustive threshold search; samples with
//! `x[feature] <= threshold` go left. Features are assumed non-negative
//! (TF-IDF weights), so absent entries always fall on the left.

use medrisk_features::SparseVector;
use medrisk_model::{ClassProbabilities, RiskClass, NUM_CLASSES};
use serde::{Deserialize, Serialize};

use crate::pipeline::RiskEstimator;
use crate::ClassifierError;

/// Settings for [`GradientBoostedTrees`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoosterConfig {
    /// Number of boosting stages
    pub n_estimators: usize,
    /// Shrinkage applied to every tree
    pub learning_rate: f64,
    /// Maximum depth of each tree
    pub max_depth: usize,
    /// Minimum samples a node needs to be split
    pub min_samples_split: usize,
    /// Minimum samples in each leaf
    pub min_samples_leaf: usize,
}

impl Default for BoosterConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 3,
            min_samples_split: 2,
            min_samples_leaf: 1,
        }
    }
}

impl BoosterConfig {
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if !(self.learning_rate > 0.0) {
            return Err(ClassifierError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.min_samples_leaf == 0 || self.min_samples_split < 2 {
            return Err(ClassifierError::InvalidConfig(
                "min_samples_leaf must be >= 1 and min_samples_split >= 2".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

/// A fitted regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub fn predict(&self, x: &SparseVector) -> f64 {
        let mut id = 0;
        loop {
            match &self.nodes[id] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    id = if x.get(*feature) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    /// Children must come after their parent, so traversal always ends at a leaf.
    pub fn validate(&self, n_features: usize) -> Result<(), ClassifierError> {
        if self.nodes.is_empty() {
            return Err(ClassifierError::CorruptArtifact("tree has no nodes".to_string()));
        }
        for (id, node) in self.nodes.iter().enumerate() {
            let Node::Split {
                feature,
                threshold,
                left,
                right,
            } = node
            else {
                continue;
            };
            let forward = |child: usize| child > id && child < self.nodes.len();
            if !forward(*left) || !forward(*right) {
                return Err(ClassifierError::CorruptArtifact(format!(
                    "node {id} has children ({left}, {right}) outside {} nodes",
                    self.nodes.len()
                )));
            }
            if *feature >= n_features || !threshold.is_finite() {
                return Err(ClassifierError::CorruptArtifact(format!(
                    "node {id} splits on feature {feature} at {threshold} with {n_features} features"
                )));
            }
        }
        Ok(())
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }
}

/// Column-major view of the training matrix, each column sorted by
/// descending value.
struct Columns {
    columns: Vec<Vec<(usize, f64)>>,
}

impl Columns {
    fn build(rows: &[SparseVector], n_features: usize) -> Self {
        let mut columns = vec![Vec::new(); n_features];
        for (row, x) in rows.iter().enumerate() {
            for &(feature, value) in x.entries() {
                if feature < n_features {
                    columns[feature].push((row, value));
                }
            }
        }
        for column in &mut columns {
            column.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        }
        Self { columns }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeStats {
    sum: f64,
    count: usize,
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
    right: NodeStats,
}

/// Running right-hand accumulator while scanning one column for one node.
#[derive(Debug, Clone, Copy, Default)]
struct Scan {
    right: NodeStats,
    last: f64,
}

fn friedman_improvement(total: NodeStats, right: NodeStats) -> f64 {
    let left_count = (total.count - right.count) as f64;
    let right_count = right.count as f64;
    let left_sum = total.sum - right.sum;
    let diff = right_count * left_sum - left_count * right.sum;
    diff * diff / (left_count * right_count)
}

struct TreeBuilder<'a> {
    columns: &'a Columns,
    residual: &'a [f64],
    hessian: &'a [f64],
    config: &'a BoosterConfig,
}

impl TreeBuilder<'_> {
    fn consider(
        &self,
        best: &mut Option<SplitCandidate>,
        total: NodeStats,
        right: NodeStats,
        feature: usize,
        threshold: f64,
    ) {
        let left_count = total.count - right.count;
        if left_count < self.config.min_samples_leaf || right.count < self.config.min_samples_leaf {
            return;
        }
        let gain = friedman_improvement(total, right);
        if gain > best.map_or(0.0, |b| b.gain) {
            *best = Some(SplitCandidate {
                feature,
                threshold,
                gain,
                right,
            });
        }
    }

    /// Grow one tree level by level.
    fn build(&self, n_rows: usize) -> RegressionTree {
        let mut nodes = vec![Node::Leaf { value: 0.0 }];
        let mut node_of = vec![0usize; n_rows];
        let mut stats = vec![NodeStats {
            sum: self.residual.iter().sum(),
            count: n_rows,
        }];

        let mut frontier: Vec<usize> = vec![0];
        for _depth in 0..self.config.max_depth {
            let splittable: Vec<usize> = frontier
                .iter()
                .copied()
                .filter(|&id| stats[id].count >= self.config.min_samples_split)
                .collect();
            if splittable.is_empty() {
                break;
            }

            let mut slot_of = vec![usize::MAX; nodes.len()];
            for (slot, &id) in splittable.iter().enumerate() {
                slot_of[id] = slot;
            }

            let mut best: Vec<Option<SplitCandidate>> = vec![None; splittable.len()];
            let mut scans = vec![Scan::default(); splittable.len()];

            for (feature, column) in self.columns.columns.iter().enumerate() {
                scans.fill(Scan::default());
                for &(row, value) in column {
                    let slot = slot_of[node_of[row]];
                    if slot == usize::MAX {
                        continue;
                    }
                    let scan = scans[slot];
                    if scan.right.count > 0 && value < scan.last {
                        let mut threshold = (value + scan.last) / 2.0;
                        if threshold >= scan.last {
                            threshold = value;
                        }
                        self.consider(
                            &mut best[slot],
                            stats[splittable[slot]],
                            scan.right,
                            feature,
                            threshold,
                        );
                    }
                    let scan = &mut scans[slot];
                    scan.right.sum += self.residual[row];
                    scan.right.count += 1;
                    scan.last = value;
                }
                // Split between the implicit zeros and the smallest stored value
                for (slot, scan) in scans.iter().enumerate() {
                    let total = stats[splittable[slot]];
                    if scan.right.count > 0 && scan.right.count < total.count {
                        self.consider(&mut best[slot], total, scan.right, feature, scan.last / 2.0);
                    }
                }
            }

            let mut next_frontier = Vec::new();
            let mut applied: Vec<(usize, SplitCandidate, usize, usize)> = Vec::new();
            for (slot, candidate) in best.into_iter().enumerate() {
                let Some(candidate) = candidate else { continue };
                let id = splittable[slot];
                let total = stats[id];
                let left_id = nodes.len();
                let right_id = left_id + 1;
                nodes.push(Node::Leaf { value: 0.0 });
                nodes.push(Node::Leaf { value: 0.0 });
                stats.push(NodeStats {
                    sum: total.sum - candidate.right.sum,
                    count: total.count - candidate.right.count,
                });
                stats.push(candidate.right);
                nodes[id] = Node::Split {
                    feature: candidate.feature,
                    threshold: candidate.threshold,
                    left: left_id,
                    right: right_id,
                };
                applied.push((id, candidate, left_id, right_id));
                next_frontier.push(left_id);
                next_frontier.push(right_id);
            }

            if applied.is_empty() {
                break;
            }

            for &(id, _, left_id, _) in &applied {
                for assigned in node_of.iter_mut().filter(|n| **n == id) {
                    *assigned = left_id;
                }
            }
            for &(_, candidate, left_id, right_id) in &applied {
                for &(row, value) in &self.columns.columns[candidate.feature] {
                    if node_of[row] == left_id && value > candidate.threshold {
                        node_of[row] = right_id;
                    }
                }
            }

            frontier = next_frontier;
        }

        self.fill_leaves(&mut nodes, &node_of);
        RegressionTree { nodes }
    }

    /// Newton step for multinomial deviance: ((K-1)/K) * sum(r) / sum(p(1-p)).
    fn fill_leaves(&self, nodes: &mut [Node], node_of: &[usize]) {
        let mut numerator = vec![0.0; nodes.len()];
        let mut denominator = vec![0.0; nodes.len()];
        for (row, &id) in node_of.iter().enumerate() {
            numerator[id] += self.residual[row];
            denominator[id] += self.hessian[row];
        }

        let k = NUM_CLASSES as f64;
        for (id, node) in nodes.iter_mut().enumerate() {
            if let Node::Leaf { value } = node {
                *value = if denominator[id].abs() < 1e-150 {
                    0.0
                } else {
                    (k - 1.0) / k * numerator[id] / denominator[id]
                };
            }
        }
    }
}

fn softmax(raw: &[f64; NUM_CLASSES]) -> [f64; NUM_CLASSES] {
    let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp = raw.map(|r| (r - max).exp());
    let total: f64 = exp.iter().sum();
    exp.map(|e| e / total)
}

/// Fitted gradient-boosted classifier over the three risk classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    config: BoosterConfig,
    n_features: usize,
    init: [f64; NUM_CLASSES],
    stages: Vec<[RegressionTree; NUM_CLASSES]>,
}

impl GradientBoostedTrees {
    /// Fit on sparse rows with parallel labels.
    pub fn fit(
        rows: &[SparseVector],
        labels: &[RiskClass],
        n_features: usize,
        config: BoosterConfig,
    ) -> Result<Self, ClassifierError> {
        config.validate()?;
        if rows.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }
        if rows.len() != labels.len() {
            return Err(ClassifierError::LengthMismatch {
                rows: rows.len(),
                labels: labels.len(),
            });
        }

        let n = rows.len();
        let mut counts = [0usize; NUM_CLASSES];
        for label in labels {
            counts[label.index()] += 1;
        }
        let eps = f64::from(f32::EPSILON);
        let init = counts.map(|c| (c as f64 / n as f64).clamp(eps, 1.0 - eps).ln());

        let columns = Columns::build(rows, n_features);
        let mut raw = vec![init; n];
        let mut residual = vec![0.0; n];
        let mut hessian = vec![0.0; n];
        let mut stages = Vec::with_capacity(config.n_estimators);

        for stage in 0..config.n_estimators {
            let probabilities: Vec<[f64; NUM_CLASSES]> = raw.iter().map(softmax).collect();

            let trees: [RegressionTree; NUM_CLASSES] = std::array::from_fn(|k| {
                for i in 0..n {
                    let p = probabilities[i][k];
                    let y = if labels[i].index() == k { 1.0 } else { 0.0 };
                    residual[i] = y - p;
                    hessian[i] = p * (1.0 - p);
                }
                let builder = TreeBuilder {
                    columns: &columns,
                    residual: &residual,
                    hessian: &hessian,
                    config: &config,
                };
                builder.build(n)
            });

            for (i, x) in rows.iter().enumerate() {
                for (k, tree) in trees.iter().enumerate() {
                    raw[i][k] += config.learning_rate * tree.predict(x);
                }
            }

            if (stage + 1) % 10 == 0 || stage + 1 == config.n_estimators {
                let deviance = raw
                    .iter()
                    .zip(labels)
                    .map(|(r, y)| -softmax(r)[y.index()].max(1e-300).ln())
                    .sum::<f64>()
                    / n as f64;
                tracing::debug!(stage = stage + 1, deviance, "Boosting progress");
            }

            stages.push(trees);
        }

        Ok(Self {
            config,
            n_features,
            init,
            stages,
        })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Check a deserialized model before serving from it.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        self.config
            .validate()
            .map_err(|e| ClassifierError::CorruptArtifact(e.to_string()))?;
        if self.init.iter().any(|v| !v.is_finite()) {
            return Err(ClassifierError::CorruptArtifact(
                "non-finite initial scores".to_string(),
            ));
        }
        for trees in &self.stages {
            for tree in trees {
                tree.validate(self.n_features)?;
            }
        }
        Ok(())
    }

    pub fn n_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn config(&self) -> BoosterConfig {
        self.config
    }

    /// Raw (pre-softmax) scores per class.
    pub fn decision_function(&self, x: &SparseVector) -> [f64; NUM_CLASSES] {
        let mut raw = self.init;
        for trees in &self.stages {
            for (k, tree) in trees.iter().enumerate() {
                raw[k] += self.config.learning_rate * tree.predict(x);
            }
        }
        raw
    }
}

impl RiskEstimator for GradientBoostedTrees {
    fn predict_class(&self, x: &SparseVector) -> RiskClass {
        ClassProbabilities::from_array(softmax(&self.decision_function(x))).argmax()
    }

    fn predict_proba(&self, x: &SparseVector) -> Option<ClassProbabilities> {
        Some(ClassProbabilities::from_array(softmax(
            &self.decision_function(x),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(entries: &[(usize, f64)]) -> SparseVector {
        SparseVector::from_entries(entries.to_vec())
    }

    fn separable() -> (Vec<SparseVector>, Vec<RiskClass>) {
        let rows = vec![
            row(&[(0, 1.0)]),
            row(&[(0, 0.9)]),
            row(&[(1, 1.0)]),
            row(&[(1, 0.8)]),
            row(&[(2, 1.0)]),
            row(&[(2, 0.7)]),
        ];
        let labels = vec![
            RiskClass::Low,
            RiskClass::Low,
            RiskClass::Medium,
            RiskClass::Medium,
            RiskClass::High,
            RiskClass::High,
        ];
        (rows, labels)
    }

    #[test]
    fn test_fits_separable_data() {
        let (rows, labels) = separable();
        let model = GradientBoostedTrees::fit(&rows, &labels, 3, BoosterConfig::default()).unwrap();
        for (x, y) in rows.iter().zip(&labels) {
            assert_eq!(model.predict_class(x), *y);
        }
        assert_eq!(model.n_stages(), 100);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let (rows, labels) = separable();
        let model = GradientBoostedTrees::fit(&rows, &labels, 3, BoosterConfig::default()).unwrap();
        for x in rows.iter().chain([&row(&[]), &row(&[(0, 0.5), (2, 0.5)])]) {
            let p = model.predict_proba(x).unwrap();
            assert!((p.sum() - 1.0).abs() < 1e-9);
            assert_eq!(model.predict_class(x), p.argmax());
        }
    }

    #[test]
    fn test_single_class_predicts_that_class() {
        let rows = vec![row(&[(0, 1.0)]), row(&[])];
        let labels = vec![RiskClass::High, RiskClass::High];
        let config = BoosterConfig {
            n_estimators: 5,
            ..Default::default()
        };
        let model = GradientBoostedTrees::fit(&rows, &labels, 1, config).unwrap();
        assert_eq!(model.predict_class(&row(&[])), RiskClass::High);
    }

    #[test]
    fn test_zero_features_uses_priors() {
        let rows = vec![row(&[]), row(&[]), row(&[])];
        let labels = vec![RiskClass::Low, RiskClass::Low, RiskClass::High];
        let model = GradientBoostedTrees::fit(&rows, &labels, 0, BoosterConfig::default()).unwrap();
        let p = model.predict_proba(&row(&[])).unwrap();
        assert_eq!(p.argmax(), RiskClass::Low);
        assert!(p.low > p.high && p.high > p.medium);
    }

    #[test]
    fn test_tree_splits_on_zero_boundary() {
        let rows = vec![row(&[(0, 0.5)]), row(&[]), row(&[(0, 0.25)]), row(&[])];
        let columns = Columns::build(&rows, 1);
        let residual = [1.0, -1.0, 1.0, -1.0];
        let hessian = [0.25; 4];
        let config = BoosterConfig::default();
        let tree = TreeBuilder {
            columns: &columns,
            residual: &residual,
            hessian: &hessian,
            config: &config,
        }
        .build(4);
        assert_eq!(tree.n_leaves(), 2);
        assert!(tree.predict(&rows[0]) > 0.0);
        assert!(tree.predict(&rows[1]) < 0.0);
        assert_eq!(tree.predict(&rows[0]), tree.predict(&rows[2]));
    }

    #[test]
    fn test_validate_accepts_fitted_model() {
        let (rows, labels) = separable();
        let model = GradientBoostedTrees::fit(&rows, &labels, 3, BoosterConfig::default()).unwrap();
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_child_index() {
        let split = |left, right| Node::Split {
            feature: 0,
            threshold: 0.5,
            left,
            right,
        };
        let leaf = Node::Leaf { value: 1.0 };

        let out_of_range = RegressionTree {
            nodes: vec![split(1, 5), leaf.clone()],
        };
        assert!(matches!(
            out_of_range.validate(1),
            Err(ClassifierError::CorruptArtifact(_))
        ));

        let cycle = RegressionTree {
            nodes: vec![split(1, 2), split(0, 2), leaf.clone()],
        };
        assert!(matches!(cycle.validate(1), Err(ClassifierError::CorruptArtifact(_))));

        let ok = RegressionTree {
            nodes: vec![split(1, 2), leaf.clone(), leaf],
        };
        assert!(ok.validate(1).is_ok());
        assert!(matches!(ok.validate(0), Err(ClassifierError::CorruptArtifact(_))));
        assert!(matches!(
            RegressionTree { nodes: vec![] }.validate(1),
            Err(ClassifierError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let (rows, _) = separable();
        let err = GradientBoostedTrees::fit(&rows, &[RiskClass::Low], 3, BoosterConfig::default())
            .unwrap_err();
        assert!(matches!(err, ClassifierError::LengthMismatch { rows: 6, labels: 1 }));
    }
}
