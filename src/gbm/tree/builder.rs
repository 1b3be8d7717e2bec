//! Exact greedy depth-wise tree construction.
//!
//! # Gain
//!
//! ```text
//! weight = -T(G) / (H + λ)
//! gain   = 0.5 * [T(G_L)²/(H_L+λ) + T(G_R)²/(H_R+λ) - T(G)²/(H+λ)]
//! ```
//!
//! where `T` is L1 soft thresholding by `α`. A split is kept when its gain exceeds
//! `γ` and both children hold at least `min_child_weight` hessian.
//!
//! # Column split
//!
//! When the matrix holds a block of columns, every worker searches its own
//! features, the candidates are all-gathered and reduced in rank order, and the
//! owner of the winning feature decides which rows go left. Every worker draws the
//! same random numbers, so all of them grow the same tree as a single process
//! holding every column.
//!
//! # Constraints
//!
//! With monotone constraints active, child weights are clamped to the node's
//! bounds and gains are evaluated at the clamped weights. Interaction constraints
//! filter the sampled features of every node by the features on its path. Both
//! depend only on state every worker shares, so column-split workers agree.

use rand::seq::SliceRandom;

use super::TreeTrainParam;
use super::constraints::{WeightBounds, allowed_features};
use super::model::{RegTree, SplitRecord};
use crate::collective::Communicator;
use crate::context::GlobalRandom;
use crate::data::DMatrix;
use crate::error::{LearnerError, Result};
use crate::utils::{BitSet, Parallelism};

const RT_EPS: f64 = 1e-6;

// =============================================================================
// Gain functions
// =============================================================================

#[inline]
fn soft_threshold(g: f64, alpha: f64) -> f64 {
    if g > alpha {
        g - alpha
    } else if g < -alpha {
        g + alpha
    } else {
        0.0
    }
}

/// Optimal weight of a node with gradient sums `(g, h)`.
pub(crate) fn calc_weight(param: &TreeTrainParam, g: f64, h: f64) -> f64 {
    if h < param.min_child_weight as f64 || h <= 0.0 {
        return 0.0;
    }
    -soft_threshold(g, param.alpha as f64) / (h + param.lambda as f64)
}

/// Structure score of a node with gradient sums `(g, h)`.
pub(crate) fn calc_gain(param: &TreeTrainParam, g: f64, h: f64) -> f64 {
    if h < param.min_child_weight as f64 || h <= 0.0 {
        return 0.0;
    }
    let t = soft_threshold(g, param.alpha as f64);
    t * t / (h + param.lambda as f64)
}

/// Structure score of a node forced to weight `w`.
pub(crate) fn calc_gain_given_weight(param: &TreeTrainParam, g: f64, h: f64, w: f64) -> f64 {
    if h < param.min_child_weight as f64 || h <= 0.0 {
        return 0.0;
    }
    -(2.0 * soft_threshold(g, param.alpha as f64) * w + (h + param.lambda as f64) * w * w)
}

// =============================================================================
// Split candidates
// =============================================================================

/// Best split found for one node.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    feature: u32,
    threshold: f32,
    default_left: bool,
    loss_change: f64,
    left_grad: f64,
    left_hess: f64,
}

impl Candidate {
    const ENCODED_LEN: usize = 1 + 4 + 4 + 1 + 8 * 3;

    /// `true` when `self` beats `other`: larger gain, then lower feature index.
    fn beats(&self, other: &Candidate) -> bool {
        self.loss_change > other.loss_change
            || (self.loss_change == other.loss_change && self.feature < other.feature)
    }

    fn encode(candidate: Option<&Candidate>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        match candidate {
            None => buf.push(0),
            Some(c) => {
                buf.push(1);
                buf.extend(c.feature.to_le_bytes());
                buf.extend(c.threshold.to_le_bytes());
                buf.push(c.default_left as u8);
                buf.extend(c.loss_change.to_le_bytes());
                buf.extend(c.left_grad.to_le_bytes());
                buf.extend(c.left_hess.to_le_bytes());
            }
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Option<Candidate>> {
        match buf.first() {
            Some(0) => return Ok(None),
            Some(1) if buf.len() == Self::ENCODED_LEN => {}
            _ => return Err(LearnerError::Collective("malformed split candidate".into())),
        }
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let f64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            f64::from_le_bytes(b)
        };
        Ok(Some(Candidate {
            feature: u32_at(1),
            threshold: f32::from_bits(u32_at(5)),
            default_left: buf[9] != 0,
            loss_change: f64_at(10),
            left_grad: f64_at(18),
            left_hess: f64_at(26),
        }))
    }
}

fn keep_best(best: &mut Option<Candidate>, candidate: Option<Candidate>) {
    if let Some(c) = candidate {
        if best.as_ref().is_none_or(|b| c.beats(b)) {
            *best = Some(c);
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Everything a tree builder reads besides its parameters.
pub(crate) struct BuildContext<'a> {
    pub data: &'a DMatrix,
    pub comm: &'a dyn Communicator,
    pub rng: &'a GlobalRandom,
    pub parallelism: Parallelism,
    pub num_feature: usize,
}

/// A node waiting to be split.
struct Frontier {
    node: usize,
    rows: Vec<usize>,
    grad: f64,
    hess: f64,
    bounds: WeightBounds,
    /// Split features between the root and this node.
    path: Vec<usize>,
}

/// Grows one tree for one output group.
pub(crate) struct TreeBuilder<'a> {
    param: &'a TreeTrainParam,
    ctx: &'a BuildContext<'a>,
    column_split: bool,
    monotone: bool,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(param: &'a TreeTrainParam, ctx: &'a BuildContext<'a>) -> Self {
        let column_split = ctx.data.is_column_split() && ctx.comm.is_distributed();
        let monotone = param.monotone_constraints.iter().any(|&c| c != 0);
        Self { param, ctx, column_split, monotone }
    }

    #[inline]
    fn constraint(&self, feature: usize) -> i8 {
        self.param.monotone_constraints.get(feature).copied().unwrap_or(0)
    }

    /// Node weight for sums `(g, h)`, clamped to `bounds` under monotone constraints.
    fn bounded_weight(&self, g: f64, h: f64, bounds: &WeightBounds) -> f64 {
        let weight = calc_weight(self.param, g, h);
        if self.monotone { bounds.clamp(weight) } else { weight }
    }

    pub fn build(&self, grads: &[f32], hess: &[f32]) -> Result<RegTree> {
        let rows = self.sample_rows(grads.len());
        let all_features: Vec<usize> = (0..self.ctx.num_feature).collect();
        let tree_features = self.sample_features(&all_features, self.param.colsample_bytree);

        let (g, h) = sum_gradients(&rows, grads, hess);
        let root_weight = calc_weight(self.param, g, h) as f32;
        let mut tree = RegTree::new_leaf(root_weight, self.param.eta * root_weight, h as f32);

        let max_depth = if self.param.max_depth == 0 { usize::MAX } else { self.param.max_depth };
        let mut level = vec![Frontier {
            node: 0,
            rows,
            grad: g,
            hess: h,
            bounds: WeightBounds::default(),
            path: Vec::new(),
        }];
        let mut depth = 0;
        while !level.is_empty() && depth < max_depth {
            let level_features = self.sample_features(&tree_features, self.param.colsample_bylevel);
            let mut next = Vec::new();
            for entry in level {
                let node_features = self.sample_features(&level_features, self.param.colsample_bynode);
                let node_features = allowed_features(&self.param.interaction_constraints, &entry.path, &node_features);
                let Some(best) = self.find_split(&node_features, &entry, grads, hess)? else {
                    continue;
                };
                if best.loss_change <= (self.param.gamma as f64).max(RT_EPS) {
                    continue;
                }
                let (right_grad, right_hess) = (entry.grad - best.left_grad, entry.hess - best.left_hess);
                let left_weight = self.bounded_weight(best.left_grad, best.left_hess, &entry.bounds);
                let right_weight = self.bounded_weight(right_grad, right_hess, &entry.bounds);
                let record = SplitRecord {
                    feature: best.feature,
                    threshold: best.threshold,
                    default_left: best.default_left,
                    loss_change: best.loss_change as f32,
                    left_weight: left_weight as f32,
                    right_weight: right_weight as f32,
                    left_hess: best.left_hess as f32,
                    right_hess: right_hess as f32,
                };
                let (left, right) = tree.expand(entry.node, &record, self.param.eta);
                let (left_rows, right_rows) = self.partition(&entry.rows, &best)?;

                let feature = best.feature as usize;
                let (left_bounds, right_bounds) =
                    entry.bounds.split(self.constraint(feature), left_weight, right_weight);
                let mut path = entry.path;
                if !path.contains(&feature) {
                    path.push(feature);
                }
                next.push(Frontier {
                    node: left,
                    rows: left_rows,
                    grad: best.left_grad,
                    hess: best.left_hess,
                    bounds: left_bounds,
                    path: path.clone(),
                });
                next.push(Frontier {
                    node: right,
                    rows: right_rows,
                    grad: right_grad,
                    hess: right_hess,
                    bounds: right_bounds,
                    path,
                });
            }
            level = next;
            depth += 1;
        }
        Ok(tree)
    }

    // -------------------------------------------------------------------------
    // Sampling
    // -------------------------------------------------------------------------

    fn sample_rows(&self, n_rows: usize) -> Vec<usize> {
        if self.param.subsample >= 1.0 {
            return (0..n_rows).collect();
        }
        let ratio = self.param.subsample;
        self.ctx.rng.with(|rng| {
            use rand::Rng;
            (0..n_rows).filter(|_| rng.r#gen::<f32>() < ratio).collect()
        })
    }

    fn sample_features(&self, features: &[usize], ratio: f32) -> Vec<usize> {
        if ratio >= 1.0 || features.is_empty() {
            return features.to_vec();
        }
        let n = ((ratio * features.len() as f32).round() as usize).max(1);
        let mut shuffled = features.to_vec();
        self.ctx.rng.with(|rng| shuffled.shuffle(rng));
        shuffled.truncate(n);
        shuffled.sort_unstable();
        shuffled
    }

    // -------------------------------------------------------------------------
    // Split search
    // -------------------------------------------------------------------------

    fn find_split(
        &self,
        features: &[usize],
        node: &Frontier,
        grads: &[f32],
        hess: &[f32],
    ) -> Result<Option<Candidate>> {
        let local: Vec<usize> = features.iter().copied().filter(|&f| self.ctx.data.owns_feature(f)).collect();
        let per_feature = self
            .ctx
            .parallelism
            .maybe_par_map(local, |f| self.best_split_for_feature(f, node, grads, hess));

        let mut best = None;
        for candidate in per_feature {
            keep_best(&mut best, candidate);
        }
        if !self.column_split {
            return Ok(best);
        }

        let gathered = self.ctx.comm.allgather(&Candidate::encode(best.as_ref()))?;
        let mut global = None;
        for bytes in &gathered {
            keep_best(&mut global, Candidate::decode(bytes)?);
        }
        Ok(global)
    }

    fn best_split_for_feature(&self, feature: usize, node: &Frontier, grads: &[f32], hess: &[f32]) -> Option<Candidate> {
        let (rows, g, h, bounds) = (node.rows.as_slice(), node.grad, node.hess, &node.bounds);
        let data = self.ctx.data;
        let mut present: Vec<(f32, usize)> = rows
            .iter()
            .filter_map(|&r| data.value(r, feature).filter(|v| !v.is_nan()).map(|v| (v, r)))
            .collect();
        if present.len() < 2 {
            return None;
        }
        present.sort_by(|a, b| a.0.total_cmp(&b.0));

        let (mut present_g, mut present_h) = (0.0f64, 0.0f64);
        for &(_, r) in &present {
            present_g += grads[r] as f64;
            present_h += hess[r] as f64;
        }
        let (missing_g, missing_h) = (g - present_g, h - present_h);
        let has_missing = present.len() < rows.len();
        let constraint = self.constraint(feature);
        let parent_gain = if self.monotone {
            calc_gain_given_weight(self.param, g, h, self.bounded_weight(g, h, bounds))
        } else {
            calc_gain(self.param, g, h)
        };
        let mcw = self.param.min_child_weight as f64;

        let mut best: Option<Candidate> = None;
        let (mut left_g, mut left_h) = (0.0f64, 0.0f64);
        for i in 0..present.len() - 1 {
            let (value, r) = present[i];
            left_g += grads[r] as f64;
            left_h += hess[r] as f64;
            let next_value = present[i + 1].0;
            if next_value <= value {
                continue;
            }
            let threshold = split_threshold(value, next_value);

            let directions: &[bool] = if has_missing { &[false, true] } else { &[false] };
            for &default_left in directions {
                let (lg, lh) = if default_left { (left_g + missing_g, left_h + missing_h) } else { (left_g, left_h) };
                let (rg, rh) = (g - lg, h - lh);
                if lh < mcw || rh < mcw {
                    continue;
                }
                let loss_change = if self.monotone {
                    let (wl, wr) = (self.bounded_weight(lg, lh, bounds), self.bounded_weight(rg, rh, bounds));
                    if !WeightBounds::admits(constraint, wl, wr) {
                        continue;
                    }
                    let children = calc_gain_given_weight(self.param, lg, lh, wl)
                        + calc_gain_given_weight(self.param, rg, rh, wr);
                    0.5 * (children - parent_gain)
                } else {
                    0.5 * (calc_gain(self.param, lg, lh) + calc_gain(self.param, rg, rh) - parent_gain)
                };
                if best.as_ref().is_none_or(|b| loss_change > b.loss_change) {
                    best = Some(Candidate {
                        feature: feature as u32,
                        threshold,
                        default_left,
                        loss_change,
                        left_grad: lg,
                        left_hess: lh,
                    });
                }
            }
        }
        best
    }

    // -------------------------------------------------------------------------
    // Row partition
    // -------------------------------------------------------------------------

    /// Split `rows` by `split`, asking the feature owner when columns are distributed.
    fn partition(&self, rows: &[usize], split: &Candidate) -> Result<(Vec<usize>, Vec<usize>)> {
        let feature = split.feature as usize;
        let data = self.ctx.data;
        let mut goes_left = BitSet::new(rows.len());
        if data.owns_feature(feature) {
            for (i, &r) in rows.iter().enumerate() {
                let value = data.value(r, feature).unwrap_or(f32::NAN);
                let left = if value.is_nan() { split.default_left } else { value < split.threshold };
                if left {
                    goes_left.set(i);
                }
            }
        }
        if self.column_split {
            let gathered = self.ctx.comm.allgather(&goes_left.to_bytes())?;
            for bytes in &gathered {
                let other = BitSet::from_bytes(bytes, rows.len())
                    .ok_or_else(|| LearnerError::Collective("malformed row partition".into()))?;
                goes_left.union_with(&other);
            }
        }
        let mut left = Vec::new();
        let mut right = Vec::new();
        for (i, &r) in rows.iter().enumerate() {
            if goes_left.get(i) { left.push(r) } else { right.push(r) }
        }
        Ok((left, right))
    }
}

fn sum_gradients(rows: &[usize], grads: &[f32], hess: &[f32]) -> (f64, f64) {
    rows.iter().fold((0.0, 0.0), |(g, h), &r| (g + grads[r] as f64, h + hess[r] as f64))
}

/// Threshold separating `lo` from `hi` (`lo < hi`): rows below it go left.
fn split_threshold(lo: f32, hi: f32) -> f32 {
    let mid = lo + (hi - lo) * 0.5;
    if mid > lo && mid <= hi { mid } else { hi }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::collective::NoopCommunicator;

    fn param() -> TreeTrainParam {
        TreeTrainParam { min_child_weight: 0.0, lambda: 0.0, eta: 1.0, ..Default::default() }
    }

    #[test]
    fn weight_and_gain() {
        let p = TreeTrainParam { lambda: 1.0, alpha: 0.5, ..Default::default() };
        assert!((calc_weight(&p, 2.5, 1.0) - (-1.0)).abs() < 1e-12);
        assert!((calc_gain(&p, 2.5, 1.0) - 2.0).abs() < 1e-12);
        assert_eq!(calc_gain(&p, 0.3, 1.0), 0.0);
    }

    #[test]
    fn threshold_separates_neighbours() {
        assert_eq!(split_threshold(1.0, 2.0), 1.5);
        let lo = 1.0f32;
        let hi = f32::from_bits(lo.to_bits() + 1);
        let t = split_threshold(lo, hi);
        assert!(lo < t && t <= hi);
    }

    #[test]
    fn candidate_codec() {
        let c = Candidate {
            feature: 3,
            threshold: 0.25,
            default_left: true,
            loss_change: 1.5,
            left_grad: -2.0,
            left_hess: 4.0,
        };
        assert_eq!(Candidate::decode(&Candidate::encode(Some(&c))).unwrap(), Some(c));
        assert_eq!(Candidate::decode(&Candidate::encode(None)).unwrap(), None);
        assert!(Candidate::decode(&[1, 2]).is_err());
    }

    #[test]
    fn learns_a_step_function() {
        let data = DMatrix::new(array![[0.0, 5.0], [1.0, 5.0], [2.0, 5.0], [3.0, 5.0]]);
        let grads = [1.0f32, 1.0, -1.0, -1.0];
        let hess = [1.0f32; 4];
        let comm = NoopCommunicator;
        let rng = GlobalRandom::new(0);
        let ctx = BuildContext {
            data: &data,
            comm: &comm,
            rng: &rng,
            parallelism: Parallelism::Sequential,
            num_feature: 2,
        };
        let p = param();
        let tree = TreeBuilder::new(&p, &ctx).build(&grads, &hess).unwrap();
        assert_eq!(tree.split_index(0), 0);
        assert_eq!(tree.split_condition(0), 1.5);
        assert_eq!(tree.leaf_value(tree.leaf_for(|f| [0.0, 5.0][f])), -1.0);
        assert_eq!(tree.leaf_value(tree.leaf_for(|f| [3.0, 5.0][f])), 1.0);
    }

    #[test]
    fn missing_values_learn_a_direction() {
        let data = DMatrix::new(array![[0.0], [1.0], [f32::NAN], [f32::NAN]]);
        let grads = [1.0f32, -1.0, -1.0, -1.0];
        let hess = [1.0f32; 4];
        let comm = NoopCommunicator;
        let rng = GlobalRandom::new(0);
        let ctx = BuildContext {
            data: &data,
            comm: &comm,
            rng: &rng,
            parallelism: Parallelism::Sequential,
            num_feature: 1,
        };
        let p = param();
        let tree = TreeBuilder::new(&p, &ctx).build(&grads, &hess).unwrap();
        assert!(!tree.is_leaf(0));
        assert!(!tree.default_left(0));
    }

    #[test]
    fn parallel_search_matches_sequential() {
        let data = DMatrix::new(ndarray::Array2::from_shape_fn((64, 6), |(r, c)| ((r * 7 + c * 13) % 17) as f32));
        let grads: Vec<f32> = (0..64).map(|r| ((r % 5) as f32) - 2.0).collect();
        let hess = vec![1.0f32; 64];
        let comm = NoopCommunicator;
        let p = TreeTrainParam { max_depth: 4, ..Default::default() };
        let build = |parallelism| {
            let rng = GlobalRandom::new(0);
            let ctx = BuildContext { data: &data, comm: &comm, rng: &rng, parallelism, num_feature: 6 };
            TreeBuilder::new(&p, &ctx).build(&grads, &hess).unwrap()
        };
        assert_eq!(build(Parallelism::Sequential), build(Parallelism::Parallel));
    }
    fn build_tree(data: &DMatrix, grads: &[f32], p: &TreeTrainParam) -> RegTree {
        let comm = NoopCommunicator;
        let rng = GlobalRandom::new(0);
        let ctx = BuildContext {
            data,
            comm: &comm,
            rng: &rng,
            parallelism: Parallelism::Sequential,
            num_feature: data.num_col(),
        };
        let hess = vec![1.0f32; grads.len()];
        TreeBuilder::new(p, &ctx).build(grads, &hess).unwrap()
    }

    /// Leaf values along `x = 0, 1, ..`, for a single-feature tree.
    fn leaf_curve(tree: &RegTree, n: usize) -> Vec<f32> {
        (0..n).map(|x| tree.leaf_value(tree.leaf_for(|_| x as f32))).collect()
    }

    #[test]
    fn monotone_constraints_order_the_leaves() {
        let n = 16;
        let data = DMatrix::new(ndarray::Array2::from_shape_fn((n, 1), |(r, _)| r as f32));
        let targets: Vec<f32> = (0..n).map(|i| ((i % 2) * 3 + i / 4) as f32).collect();
        let grads: Vec<f32> = targets.iter().map(|y| -y).collect();
        let p = TreeTrainParam { max_depth: 4, ..param() };

        let free = leaf_curve(&build_tree(&data, &grads, &p), n);
        assert!(free.windows(2).any(|w| w[1] < w[0]), "{free:?}");

        let increasing = TreeTrainParam { monotone_constraints: vec![1], ..p.clone() };
        let curve = leaf_curve(&build_tree(&data, &grads, &increasing), n);
        assert!(curve.windows(2).all(|w| w[0] <= w[1]), "{curve:?}");
        assert!(curve[n - 1] > curve[0]);

        let decreasing = TreeTrainParam { monotone_constraints: vec![-1], ..p };
        let curve = leaf_curve(&build_tree(&data, &targets, &decreasing), n);
        assert!(curve.windows(2).all(|w| w[0] >= w[1]), "{curve:?}");
    }

    fn collect_paths(tree: &RegTree, node: usize, path: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if tree.is_leaf(node) {
            out.push(path.clone());
            return;
        }
        path.push(tree.split_index(node));
        collect_paths(tree, tree.left_child(node), path, out);
        collect_paths(tree, tree.right_child(node), path, out);
        path.pop();
    }

    #[test]
    fn interaction_constraints_separate_groups() {
        let data = DMatrix::new(ndarray::Array2::from_shape_fn((96, 3), |(r, c)| ((r * 7 + c * 13 + r * c) % 11) as f32));
        let grads: Vec<f32> = (0..96)
            .map(|r| {
                let row = data.row(r);
                -(row[0] * row[2] + row[1] - row[2] * row[1] * 0.5)
            })
            .collect();
        let p = TreeTrainParam {
            max_depth: 5,
            interaction_constraints: vec![vec![0, 1], vec![2]],
            ..param()
        };
        let tree = build_tree(&data, &grads, &p);
        let mut paths = Vec::new();
        collect_paths(&tree, 0, &mut Vec::new(), &mut paths);
        assert!(paths.iter().any(|path| path.len() >= 2));
        for path in paths {
            let first_group = path.iter().all(|f| *f < 2);
            let second_group = path.iter().all(|f| *f == 2);
            assert!(first_group || second_group, "path {path:?} mixes groups");
        }
    }
}
