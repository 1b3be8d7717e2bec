//! Conversions between runtime types and document types.

use super::schema::{TreeParamSchema, TreeSchema, VersionSchema};
use crate::error::{LearnerError, Result};
use crate::gbm::RegTree;

/// Version of this crate as written into documents.
pub fn current_version() -> VersionSchema {
    let part = |s: &str| s.parse::<u32>().unwrap_or(0);
    [
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        part(env!("CARGO_PKG_VERSION_PATCH")),
    ]
}

// =============================================================================
// Base score
// =============================================================================

/// Format a per-group base score as `[v0,v1,...]`.
pub fn format_base_score(values: &[f32]) -> String {
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(","))
}

/// Parse `[v0,v1,...]` or a bare scalar.
pub fn parse_base_score(s: &str) -> Result<Vec<f32>> {
    let trimmed = s.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<f32>()
                .map_err(|e| LearnerError::validation(format!("invalid base_score `{s}`: {e}")))
        })
        .collect()
}

// =============================================================================
// Trees
// =============================================================================

impl TreeSchema {
    pub fn from_tree(id: usize, tree: &RegTree) -> Self {
        Self {
            id,
            tree_param: TreeParamSchema {
                num_feature: tree
                    .split_indices
                    .iter()
                    .enumerate()
                    .filter(|&(node, _)| !tree.is_leaf(node))
                    .map(|(_, &f)| f as usize + 1)
                    .max()
                    .unwrap_or(0)
                    .to_string(),
                num_nodes: tree.n_nodes().to_string(),
            },
            left_children: tree.left_children.clone(),
            right_children: tree.right_children.clone(),
            parents: tree.parents.clone(),
            split_indices: tree.split_indices.clone(),
            split_conditions: tree.split_conditions.clone(),
            default_left: tree.default_left.iter().map(|&d| u8::from(d)).collect(),
            base_weights: tree.base_weights.clone(),
            loss_changes: tree.loss_changes.clone(),
            sum_hessian: tree.sum_hessian.clone(),
        }
    }

    /// Rebuild and validate a tree for a model with `num_feature` features.
    pub fn into_tree(self, num_feature: usize) -> Result<RegTree> {
        let declared: usize = self
            .tree_param
            .num_nodes
            .parse()
            .map_err(|e| LearnerError::model(format!("tree {}: invalid num_nodes: {e}", self.id)))?;
        if declared != self.left_children.len() {
            return Err(LearnerError::model(format!(
                "tree {} declares {declared} nodes but stores {}",
                self.id,
                self.left_children.len()
            )));
        }
        let tree = RegTree {
            left_children: self.left_children,
            right_children: self.right_children,
            parents: self.parents,
            split_indices: self.split_indices,
            split_conditions: self.split_conditions,
            default_left: self.default_left.into_iter().map(|d| d != 0).collect(),
            base_weights: self.base_weights,
            loss_changes: self.loss_changes,
            sum_hessian: self.sum_hessian,
        };
        tree.validate(num_feature)?;
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gbm::tree::model::SplitRecord;

    #[test]
    fn base_score_strings() {
        assert_eq!(format_base_score(&[0.5]), "[0.5]");
        assert_eq!(format_base_score(&[0.1, 2.0]), "[0.1,2]");
        assert_eq!(parse_base_score("[0.1,2]").unwrap(), vec![0.1, 2.0]);
        assert_eq!(parse_base_score("0.5").unwrap(), vec![0.5]);
        assert!(parse_base_score("[abc]").is_err());
    }

    #[test]
    fn base_score_keeps_bits() {
        let values = [1.0f32 / 3.0, -7.123_456_7e-12];
        assert_eq!(parse_base_score(&format_base_score(&values)).unwrap(), values);
    }

    #[test]
    fn tree_roundtrip() {
        let mut tree = RegTree::new_leaf(0.0, 0.0, 4.0);
        let split = SplitRecord {
            feature: 3,
            threshold: 0.5,
            default_left: true,
            loss_change: 2.0,
            left_weight: -1.0,
            right_weight: 1.0,
            left_hess: 2.0,
            right_hess: 2.0,
        };
        tree.expand(0, &split, 0.3);
        let schema = TreeSchema::from_tree(7, &tree);
        assert_eq!(schema.tree_param.num_feature, "4");
        assert_eq!(schema.default_left, vec![1, 0, 0]);
        assert_eq!(schema.clone().into_tree(4).unwrap(), tree);
        assert!(schema.into_tree(2).is_err());
    }

    #[test]
    fn rejects_inconsistent_node_count() {
        let mut schema = TreeSchema::from_tree(0, &RegTree::new_leaf(0.0, 0.0, 1.0));
        schema.tree_param.num_nodes = "3".into();
        assert!(schema.into_tree(1).is_err());
    }
}
