//! Regression tree storage (SoA).

use crate::error::{LearnerError, Result};

/// Node index; `-1` marks an absent child or parent.
pub type NodeId = i32;

pub const NO_NODE: NodeId = -1;

/// A binary regression tree.
///
/// Node 0 is the root. For a leaf, `split_conditions` holds the leaf value (already
/// scaled by the learning rate). A row goes left when its value is below the split
/// condition; missing values follow `default_left`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegTree {
    pub(crate) left_children: Vec<NodeId>,
    pub(crate) right_children: Vec<NodeId>,
    pub(crate) parents: Vec<NodeId>,
    pub(crate) split_indices: Vec<u32>,
    pub(crate) split_conditions: Vec<f32>,
    pub(crate) default_left: Vec<bool>,
    /// Unscaled optimal weight of every node.
    pub(crate) base_weights: Vec<f32>,
    pub(crate) loss_changes: Vec<f32>,
    /// Hessian sum (cover) of every node.
    pub(crate) sum_hessian: Vec<f32>,
}

impl RegTree {
    /// A tree with a single leaf.
    pub fn new_leaf(weight: f32, leaf_value: f32, sum_hess: f32) -> Self {
        Self {
            left_children: vec![NO_NODE],
            right_children: vec![NO_NODE],
            parents: vec![NO_NODE],
            split_indices: vec![0],
            split_conditions: vec![leaf_value],
            default_left: vec![false],
            base_weights: vec![weight],
            loss_changes: vec![0.0],
            sum_hessian: vec![sum_hess],
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.left_children.len()
    }

    #[inline]
    pub fn is_leaf(&self, node: usize) -> bool {
        self.left_children[node] == NO_NODE
    }

    #[inline]
    pub fn left_child(&self, node: usize) -> usize {
        self.left_children[node] as usize
    }

    #[inline]
    pub fn right_child(&self, node: usize) -> usize {
        self.right_children[node] as usize
    }

    #[inline]
    pub fn split_index(&self, node: usize) -> usize {
        self.split_indices[node] as usize
    }

    #[inline]
    pub fn split_condition(&self, node: usize) -> f32 {
        self.split_conditions[node]
    }

    #[inline]
    pub fn default_left(&self, node: usize) -> bool {
        self.default_left[node]
    }

    #[inline]
    pub fn leaf_value(&self, node: usize) -> f32 {
        self.split_conditions[node]
    }

    pub fn loss_change(&self, node: usize) -> f32 {
        self.loss_changes[node]
    }

    pub fn cover(&self, node: usize) -> f32 {
        self.sum_hessian[node]
    }

    pub fn num_leaves(&self) -> usize {
        (0..self.n_nodes()).filter(|&n| self.is_leaf(n)).count()
    }

    /// Child taken by a row with `value` at split node `node`.
    #[inline]
    pub fn next_node(&self, node: usize, value: f32) -> usize {
        if value.is_nan() {
            if self.default_left(node) { self.left_child(node) } else { self.right_child(node) }
        } else if value < self.split_condition(node) {
            self.left_child(node)
        } else {
            self.right_child(node)
        }
    }

    /// Leaf reached by a row whose values are returned by `feature`.
    pub fn leaf_for(&self, feature: impl Fn(usize) -> f32) -> usize {
        let mut node = 0;
        while !self.is_leaf(node) {
            node = self.next_node(node, feature(self.split_index(node)));
        }
        node
    }

    /// Turn leaf `node` into a split with two new leaf children.
    ///
    /// Returns `(left, right)`.
    pub(crate) fn expand(&mut self, node: usize, split: &SplitRecord, eta: f32) -> (usize, usize) {
        let left = self.push_leaf(node, split.left_weight, eta * split.left_weight, split.left_hess);
        let right = self.push_leaf(node, split.right_weight, eta * split.right_weight, split.right_hess);
        self.left_children[node] = left as NodeId;
        self.right_children[node] = right as NodeId;
        self.split_indices[node] = split.feature;
        self.split_conditions[node] = split.threshold;
        self.default_left[node] = split.default_left;
        self.loss_changes[node] = split.loss_change;
        (left, right)
    }

    fn push_leaf(&mut self, parent: usize, weight: f32, value: f32, sum_hess: f32) -> usize {
        let id = self.n_nodes();
        self.left_children.push(NO_NODE);
        self.right_children.push(NO_NODE);
        self.parents.push(parent as NodeId);
        self.split_indices.push(0);
        self.split_conditions.push(value);
        self.default_left.push(false);
        self.base_weights.push(weight);
        self.loss_changes.push(0.0);
        self.sum_hessian.push(sum_hess);
        id
    }

    /// Cover-weighted mean of the leaf values below every node.
    pub fn node_mean_values(&self) -> Vec<f32> {
        let mut means = vec![0.0f32; self.n_nodes()];
        // Children are always created after their parent.
        for node in (0..self.n_nodes()).rev() {
            if self.is_leaf(node) {
                means[node] = self.leaf_value(node);
                continue;
            }
            let (l, r) = (self.left_child(node), self.right_child(node));
            let cover = self.cover(node);
            means[node] = if cover > 0.0 {
                (means[l] * self.cover(l) + means[r] * self.cover(r)) / cover
            } else {
                0.5 * (means[l] + means[r])
            };
        }
        means
    }

    /// Check structural consistency of a tree read from a document.
    pub fn validate(&self, num_feature: usize) -> Result<()> {
        let n = self.n_nodes();
        let lens = [
            self.right_children.len(),
            self.parents.len(),
            self.split_indices.len(),
            self.split_conditions.len(),
            self.default_left.len(),
            self.base_weights.len(),
            self.loss_changes.len(),
            self.sum_hessian.len(),
        ];
        if n == 0 || lens.iter().any(|&l| l != n) {
            return Err(LearnerError::model(format!("tree arrays disagree on the node count ({n})")));
        }
        for node in 0..n {
            let (l, r) = (self.left_children[node], self.right_children[node]);
            if (l == NO_NODE) != (r == NO_NODE) {
                return Err(LearnerError::model(format!("node {node} has exactly one child")));
            }
            if l == NO_NODE {
                continue;
            }
            for child in [l, r] {
                if child <= node as NodeId || child as usize >= n || self.parents[child as usize] != node as NodeId {
                    return Err(LearnerError::model(format!("node {node} has invalid child {child}")));
                }
            }
            if num_feature > 0 && self.split_index(node) >= num_feature {
                return Err(LearnerError::model(format!(
                    "node {node} splits on feature {} of {num_feature}",
                    self.split_index(node)
                )));
            }
        }
        Ok(())
    }
}

/// A chosen split, as produced by the tree builder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRecord {
    pub feature: u32,
    pub threshold: f32,
    pub default_left: bool,
    pub loss_change: f32,
    pub left_weight: f32,
    pub right_weight: f32,
    pub left_hess: f32,
    pub right_hess: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stump() -> RegTree {
        let mut tree = RegTree::new_leaf(0.0, 0.0, 4.0);
        let split = SplitRecord {
            feature: 1,
            threshold: 0.5,
            default_left: true,
            loss_change: 2.0,
            left_weight: -1.0,
            right_weight: 1.0,
            left_hess: 1.0,
            right_hess: 3.0,
        };
        tree.expand(0, &split, 0.5);
        tree
    }

    #[test]
    fn expand_creates_children() {
        let tree = stump();
        assert_eq!(tree.n_nodes(), 3);
        assert!(!tree.is_leaf(0));
        assert_eq!(tree.leaf_value(1), -0.5);
        assert_eq!(tree.leaf_value(2), 0.5);
        assert_eq!(tree.num_leaves(), 2);
        assert!(tree.validate(2).is_ok());
        assert!(tree.validate(1).is_err());
    }

    #[test]
    fn missing_values_follow_default() {
        let tree = stump();
        assert_eq!(tree.leaf_for(|_| f32::NAN), 1);
        assert_eq!(tree.leaf_for(|_| 0.4), 1);
        assert_eq!(tree.leaf_for(|_| 0.5), 2);
    }

    #[test]
    fn node_means_are_cover_weighted() {
        let tree = stump();
        let means = tree.node_mean_values();
        assert!((means[0] - (-0.5 * 1.0 + 0.5 * 3.0) / 4.0).abs() < 1e-6);
    }
}
