//! Tree traversal over a [`DMatrix`].
//!
//! For a column-split matrix no worker can walk a tree alone. Each worker records
//! the direction of every split node it owns for every row, the bit sets are
//! all-gathered and merged, and the walk reads directions from the merged set.

use super::model::RegTree;
use crate::collective::Communicator;
use crate::data::DMatrix;
use crate::error::{LearnerError, Result};
use crate::utils::{BitSet, Parallelism};

/// Decides which child a row takes at a split node.
pub(crate) enum Router<'a> {
    Local(&'a DMatrix),
    Gathered { bits: BitSet, offsets: Vec<usize>, n_nodes: Vec<usize> },
}

impl<'a> Router<'a> {
    /// Build a router for `trees`, gathering split decisions across workers when
    /// the matrix is column-split.
    pub fn new(
        trees: &[&RegTree],
        data: &'a DMatrix,
        comm: &dyn Communicator,
        parallelism: Parallelism,
    ) -> Result<Self> {
        if !(data.is_column_split() && comm.is_distributed()) {
            return Ok(Router::Local(data));
        }
        let n_rows = data.num_row();
        let n_nodes: Vec<usize> = trees.iter().map(|t| t.n_nodes()).collect();
        let mut offsets = Vec::with_capacity(trees.len());
        let mut total = 0;
        for &n in &n_nodes {
            offsets.push(total);
            total += n * n_rows;
        }

        let per_tree = parallelism.maybe_par_map(0..trees.len(), |t| {
            let tree = trees[t];
            let mut local = Vec::new();
            for row in 0..n_rows {
                for node in 0..tree.n_nodes() {
                    if tree.is_leaf(node) {
                        continue;
                    }
                    if let Some(value) = data.value(row, tree.split_index(node)) {
                        if tree.next_node(node, value) == tree.left_child(node) {
                            local.push(offsets[t] + row * tree.n_nodes() + node);
                        }
                    }
                }
            }
            local
        });
        let mut bits = BitSet::new(total);
        for idx in per_tree.into_iter().flatten() {
            bits.set(idx);
        }

        let gathered = comm.allgather(&bits.to_bytes())?;
        for bytes in &gathered {
            let other = BitSet::from_bytes(bytes, total)
                .ok_or_else(|| LearnerError::Collective("malformed split decisions".into()))?;
            bits.union_with(&other);
        }
        Ok(Router::Gathered { bits, offsets, n_nodes })
    }

    /// Child of split `node` of tree number `t` (in router order) taken by `row`.
    #[inline]
    pub fn next(&self, t: usize, tree: &RegTree, row: usize, node: usize) -> usize {
        match self {
            Router::Local(data) => {
                let value = data.value(row, tree.split_index(node)).unwrap_or(f32::NAN);
                tree.next_node(node, value)
            }
            Router::Gathered { bits, offsets, n_nodes } => {
                if bits.get(offsets[t] + row * n_nodes[t] + node) {
                    tree.left_child(node)
                } else {
                    tree.right_child(node)
                }
            }
        }
    }

    /// Leaf of tree `t` reached by `row`.
    pub fn leaf(&self, t: usize, tree: &RegTree, row: usize) -> usize {
        let mut node = 0;
        while !tree.is_leaf(node) {
            node = self.next(t, tree, row, node);
        }
        node
    }

    /// Nodes visited by `row` in tree `t`, root first.
    pub fn path(&self, t: usize, tree: &RegTree, row: usize) -> Vec<usize> {
        let mut path = vec![0];
        let mut node = 0;
        while !tree.is_leaf(node) {
            node = self.next(t, tree, row, node);
            path.push(node);
        }
        path
    }
}
