//! Learned cost models.
//!
//! A predictor maps an [`InputShape`] to one predicted cost per variant of
//! the owning selection model. The shipped implementation is a random forest
//! of regression trees in flat array form, as exported by common training
//! tools.

use serde::Deserialize;

use crate::error::{TuneError, TuneResult};
use crate::shape::InputShape;

pub trait CostPredictor: Send + Sync {
    /// Predicted cost per variant, in variant order.
    fn predict(&self, shape: &InputShape) -> Vec<f32>;

    /// Number of costs returned by [`CostPredictor::predict`].
    fn num_outputs(&self) -> usize;
}

/// Index of the smallest cost. Ties go to the lowest index and `NaN` never
/// wins; `None` when no cost is a number.
pub fn argmin(costs: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &cost) in costs.iter().enumerate() {
        if cost.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if cost >= current => {}
            _ => best = Some((index, cost)),
        }
    }
    best.map(|(index, _)| index)
}

const LEAF: i64 = -1;

#[derive(Debug, Deserialize)]
struct TreeDescription {
    children_left: Vec<i64>,
    children_right: Vec<i64>,
    threshold: Vec<f64>,
    feature: Vec<i64>,
    value: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct ForestDescription {
    trees: Vec<TreeDescription>,
}

#[derive(Debug, Clone, PartialEq)]
enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        costs: Vec<f32>,
    },
}

/// Regression tree. Children are stored after their parent, so evaluation
/// always terminates.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
    outputs: usize,
}

impl RegressionTree {
    fn from_description(tree: TreeDescription, position: usize) -> TuneResult<Self> {
        let invalid = |message: String| {
            TuneError::invalid_argument(format!("predictor tree {position}: {message}"))
        };
        let count = tree.children_left.len();
        if count == 0 {
            return Err(invalid("tree has no nodes".to_string()));
        }
        let lengths = [
            tree.children_right.len(),
            tree.threshold.len(),
            tree.feature.len(),
            tree.value.len(),
        ];
        if lengths.iter().any(|&len| len != count) {
            return Err(invalid(format!(
                "node arrays disagree on length: {count} vs {lengths:?}"
            )));
        }

        let mut outputs = None;
        let mut nodes = Vec::with_capacity(count);
        for index in 0..count {
            let (left, right) = (tree.children_left[index], tree.children_right[index]);
            if left == LEAF && right == LEAF {
                let costs = tree.value[index].clone();
                match outputs {
                    None if costs.is_empty() => {
                        return Err(invalid(format!("leaf {index} has no costs")))
                    }
                    None => outputs = Some(costs.len()),
                    Some(width) if width != costs.len() => {
                        return Err(invalid(format!(
                            "leaf {index} holds {} costs, expected {width}",
                            costs.len()
                        )))
                    }
                    Some(_) => {}
                }
                nodes.push(TreeNode::Leaf { costs });
                continue;
            }
            let child = |child: i64| -> TuneResult<usize> {
                match usize::try_from(child) {
                    Ok(child) if child > index && child < count => Ok(child),
                    _ => Err(invalid(format!(
                        "node {index} has child {child} outside {}..{count}",
                        index + 1
                    ))),
                }
            };
            let feature = usize::try_from(tree.feature[index])
                .map_err(|_| invalid(format!("node {index} splits on feature {}", tree.feature[index])))?;
            nodes.push(TreeNode::Split {
                feature,
                threshold: tree.threshold[index],
                left: child(left)?,
                right: child(right)?,
            });
        }
        let outputs = outputs.ok_or_else(|| invalid("tree has no leaves".to_string()))?;
        Ok(RegressionTree { nodes, outputs })
    }

    /// Costs of the leaf reached by `shape`. Features past the end of the
    /// shape read as zero.
    pub fn predict(&self, shape: &InputShape) -> &[f32] {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Leaf { costs } => return costs,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if (shape.feature(*feature) as f64) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs
    }
}

/// Mean of several regression trees.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomForest {
    trees: Vec<RegressionTree>,
    outputs: usize,
}

impl RandomForest {
    /// Builds a forest from the `predictor` entry of a model description:
    /// `{"trees": [{"children_left", "children_right", "threshold",
    /// "feature", "value"}, ...]}`.
    pub fn from_description(description: &serde_json::Value) -> TuneResult<Self> {
        let forest: ForestDescription = serde_json::from_value(description.clone()).map_err(|err| {
            TuneError::invalid_argument(format!("malformed predictor description: {err}"))
        })?;
        let trees = forest
            .trees
            .into_iter()
            .enumerate()
            .map(|(position, tree)| RegressionTree::from_description(tree, position))
            .collect::<TuneResult<Vec<_>>>()?;
        Self::new(trees)
    }

    pub fn new(trees: Vec<RegressionTree>) -> TuneResult<Self> {
        let outputs = trees
            .first()
            .map(RegressionTree::num_outputs)
            .ok_or_else(|| TuneError::invalid_argument("predictor forest has no trees"))?;
        if let Some(position) = trees.iter().position(|tree| tree.num_outputs() != outputs) {
            return Err(TuneError::invalid_argument(format!(
                "predictor tree {position} predicts {} costs, tree 0 predicts {outputs}",
                trees[position].num_outputs()
            )));
        }
        Ok(RandomForest { trees, outputs })
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }
}

impl CostPredictor for RandomForest {
    fn predict(&self, shape: &InputShape) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.outputs];
        for tree in &self.trees {
            for (sum, cost) in sums.iter_mut().zip(tree.predict(shape)) {
                *sum += cost;
            }
        }
        let count = self.trees.len() as f32;
        sums.iter_mut().for_each(|sum| *sum /= count);
        sums
    }

    fn num_outputs(&self) -> usize {
        self.outputs
    }
}
