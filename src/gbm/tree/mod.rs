//! Tree booster (`gbtree`).

mod builder;
mod constraints;
pub(crate) mod model;
mod predict;

pub use model::{NO_NODE, NodeId, RegTree, SplitRecord};

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use ndarray::Array2;

use self::builder::{BuildContext, TreeBuilder};
use self::constraints::{format_interactions, format_monotone, parse_interactions, parse_monotone};
use self::predict::Router;
use super::{BoostEnv, GradientBooster, ImportanceType, PredictEnv};
use crate::collective::Communicator;
use crate::context::DeviceOrd;
use crate::data::DMatrix;
use crate::error::{LearnerError, Result};
use crate::gradients::Gradients;
use crate::logger::TrainingLogger;
use crate::params::{ParamSet, parse_in_range, parse_value};
use crate::persist::{GbTreeModelParamSchema, GbTreeModelSchema, GradientBoosterSchema, TreeSchema};

// =============================================================================
// Parameters
// =============================================================================

/// Tree construction algorithm.
///
/// Every method runs the exact greedy search on the host; `approx` and `hist`
/// differ only in the devices they accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeMethod {
    #[default]
    Auto,
    Exact,
    Approx,
    Hist,
}

impl FromStr for TreeMethod {
    type Err = LearnerError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "auto" => Self::Auto,
            "exact" => Self::Exact,
            "approx" => Self::Approx,
            "hist" => Self::Hist,
            other => {
                return Err(LearnerError::validation(format!(
                    "invalid tree_method `{other}`, expected one of auto, exact, approx, hist"
                )));
            }
        })
    }
}

impl fmt::Display for TreeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Exact => "exact",
            Self::Approx => "approx",
            Self::Hist => "hist",
        })
    }
}

/// Hyper-parameters of tree construction.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeTrainParam {
    pub eta: f32,
    pub gamma: f32,
    /// Maximum depth; 0 means unlimited.
    pub max_depth: usize,
    pub min_child_weight: f32,
    pub lambda: f32,
    pub alpha: f32,
    pub subsample: f32,
    pub colsample_bytree: f32,
    pub colsample_bylevel: f32,
    pub colsample_bynode: f32,
    /// Per-feature direction, `1` increasing, `-1` decreasing; missing entries are 0.
    pub monotone_constraints: Vec<i8>,
    /// Feature groups allowed to interact on one path; empty means unrestricted.
    pub interaction_constraints: Vec<Vec<usize>>,
}

impl Default for TreeTrainParam {
    fn default() -> Self {
        Self {
            eta: 0.3,
            gamma: 0.0,
            max_depth: 6,
            min_child_weight: 1.0,
            lambda: 1.0,
            alpha: 0.0,
            subsample: 1.0,
            colsample_bytree: 1.0,
            colsample_bylevel: 1.0,
            colsample_bynode: 1.0,
            monotone_constraints: Vec::new(),
            interaction_constraints: Vec::new(),
        }
    }
}

impl ParamSet for TreeTrainParam {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "eta" => {
                self.eta = parse_value(key, value)?;
                if !(self.eta > 0.0) {
                    return Err(LearnerError::validation(format!("eta must be positive, got {value}")));
                }
            }
            "gamma" => self.gamma = parse_in_range(key, value, 0.0, f32::INFINITY)?,
            "max_depth" => self.max_depth = parse_value(key, value)?,
            "min_child_weight" => self.min_child_weight = parse_in_range(key, value, 0.0, f32::INFINITY)?,
            "lambda" => self.lambda = parse_in_range(key, value, 0.0, f32::INFINITY)?,
            "alpha" => self.alpha = parse_in_range(key, value, 0.0, f32::INFINITY)?,
            "subsample" => self.subsample = unit_ratio(key, value)?,
            "colsample_bytree" => self.colsample_bytree = unit_ratio(key, value)?,
            "colsample_bylevel" => self.colsample_bylevel = unit_ratio(key, value)?,
            "colsample_bynode" => self.colsample_bynode = unit_ratio(key, value)?,
            "monotone_constraints" => self.monotone_constraints = parse_monotone(key, value)?,
            "interaction_constraints" => self.interaction_constraints = parse_interactions(key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("alpha".to_string(), self.alpha.to_string()),
            ("colsample_bylevel".to_string(), self.colsample_bylevel.to_string()),
            ("colsample_bynode".to_string(), self.colsample_bynode.to_string()),
            ("colsample_bytree".to_string(), self.colsample_bytree.to_string()),
            ("eta".to_string(), self.eta.to_string()),
            ("gamma".to_string(), self.gamma.to_string()),
            ("interaction_constraints".to_string(), format_interactions(&self.interaction_constraints)),
            ("lambda".to_string(), self.lambda.to_string()),
            ("max_depth".to_string(), self.max_depth.to_string()),
            ("min_child_weight".to_string(), self.min_child_weight.to_string()),
            ("monotone_constraints".to_string(), format_monotone(&self.monotone_constraints)),
            ("subsample".to_string(), self.subsample.to_string()),
        ])
    }
}

/// A sampling ratio in `(0, 1]`.
fn unit_ratio(key: &str, value: &str) -> Result<f32> {
    let ratio: f32 = parse_value(key, value)?;
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(LearnerError::validation(format!("{key} must be in (0, 1], got {value}")));
    }
    Ok(ratio)
}

// =============================================================================
// GbTree
// =============================================================================

/// Additive tree ensemble.
#[derive(Debug, Clone)]
pub struct GbTree {
    pub param: TreeTrainParam,
    pub tree_method: TreeMethod,
    pub num_parallel_tree: usize,
    trees: Vec<RegTree>,
    /// Output group of every tree.
    tree_info: Vec<u32>,
    /// Tree boundaries of every layer; `iteration_indptr[i]..iteration_indptr[i + 1]`.
    iteration_indptr: Vec<usize>,
}

impl Default for GbTree {
    fn default() -> Self {
        Self {
            param: TreeTrainParam::default(),
            tree_method: TreeMethod::Auto,
            num_parallel_tree: 1,
            trees: Vec::new(),
            tree_info: Vec::new(),
            iteration_indptr: vec![0],
        }
    }
}

impl GbTree {
    pub fn trees(&self) -> &[RegTree] {
        &self.trees
    }

    pub fn tree_info(&self) -> &[u32] {
        &self.tree_info
    }

    fn tree_range(&self, layers: &Range<usize>) -> Range<usize> {
        self.iteration_indptr[layers.start]..self.iteration_indptr[layers.end]
    }

    fn router<'a>(&self, trees: Range<usize>, data: &'a DMatrix, env: &PredictEnv<'_>) -> Result<Router<'a>> {
        let refs: Vec<&RegTree> = self.trees[trees].iter().collect();
        Router::new(&refs, data, env.comm, env.parallelism)
    }
}

impl ParamSet for GbTree {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "tree_method" => self.tree_method = value.parse()?,
            "num_parallel_tree" => {
                self.num_parallel_tree = parse_value(key, value)?;
                if self.num_parallel_tree == 0 {
                    return Err(LearnerError::validation("num_parallel_tree must be at least 1"));
                }
            }
            _ => return self.param.apply(key, value),
        }
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        let mut args = self.param.to_args();
        args.insert("num_parallel_tree".to_string(), self.num_parallel_tree.to_string());
        args.insert("tree_method".to_string(), self.tree_method.to_string());
        args
    }
}

impl GradientBooster for GbTree {
    fn name(&self) -> &'static str {
        "gbtree"
    }

    fn boosted_rounds(&self) -> usize {
        self.iteration_indptr.len() - 1
    }

    fn resolve_device(&self, requested: DeviceOrd, logger: &TrainingLogger) -> DeviceOrd {
        if requested.is_cuda() && self.tree_method == TreeMethod::Exact {
            logger.warn(format!("tree_method `exact` does not support {requested}, falling back to cpu"));
            return DeviceOrd::Cpu;
        }
        requested
    }

    fn check_data_split(&self, data: &DMatrix, comm: &dyn Communicator) -> Result<()> {
        if comm.is_distributed() && !data.is_column_split() {
            return Err(LearnerError::compatibility(
                "gbtree does not support row-split distributed training, slice the matrix by columns",
            ));
        }
        Ok(())
    }

    fn do_boost(&mut self, data: &DMatrix, gradients: &Gradients, env: &BoostEnv<'_>) -> Result<()> {
        self.check_data_split(data, env.comm)?;
        if gradients.n_groups() != env.num_group || gradients.n_rows() != data.num_row() {
            return Err(LearnerError::data(format!(
                "gradients cover {} rows x {} groups, expected {} x {}",
                gradients.n_rows(),
                gradients.n_groups(),
                data.num_row(),
                env.num_group
            )));
        }
        constraints::check_constraints(
            &self.param.monotone_constraints,
            &self.param.interaction_constraints,
            env.num_feature,
        )?;
        let ctx = BuildContext {
            data,
            comm: env.comm,
            rng: env.rng,
            parallelism: env.parallelism,
            num_feature: env.num_feature,
        };
        let builder = TreeBuilder::new(&self.param, &ctx);
        for group in 0..env.num_group {
            let (grads, hess) = gradients.output(group);
            for _ in 0..self.num_parallel_tree {
                let tree = builder.build(grads, hess)?;
                self.trees.push(tree);
                self.tree_info.push(group as u32);
            }
        }
        self.iteration_indptr.push(self.trees.len());
        Ok(())
    }

    fn predict_margin(
        &self,
        data: &DMatrix,
        layers: Range<usize>,
        env: &PredictEnv<'_>,
        out: &mut Array2<f32>,
    ) -> Result<()> {
        let trees = self.tree_range(&layers);
        if trees.is_empty() {
            return Ok(());
        }
        let router = self.router(trees.clone(), data, env)?;
        let n_groups = out.nrows();
        let rows = env.parallelism.maybe_par_map(0..data.num_row(), |row| {
            let mut sums = vec![0.0f32; n_groups];
            for (t, idx) in trees.clone().enumerate() {
                let tree = &self.trees[idx];
                let group = self.tree_info[idx] as usize;
                sums[group] += tree.leaf_value(router.leaf(t, tree, row));
            }
            sums
        });
        for (row, sums) in rows.into_iter().enumerate() {
            for (group, s) in sums.into_iter().enumerate() {
                out[[group, row]] += s;
            }
        }
        Ok(())
    }

    fn predict_leaf(&self, data: &DMatrix, layers: Range<usize>, env: &PredictEnv<'_>) -> Result<Array2<f32>> {
        let trees = self.tree_range(&layers);
        let router = self.router(trees.clone(), data, env)?;
        let rows = env.parallelism.maybe_par_map(0..data.num_row(), |row| {
            trees
                .clone()
                .enumerate()
                .map(|(t, idx)| router.leaf(t, &self.trees[idx], row) as f32)
                .collect::<Vec<f32>>()
        });
        let n_trees = trees.len();
        Array2::from_shape_vec((data.num_row(), n_trees), rows.into_iter().flatten().collect())
            .map_err(|e| LearnerError::model(format!("leaf prediction shape: {e}")))
    }

    fn predict_contribution(
        &self,
        data: &DMatrix,
        layers: Range<usize>,
        env: &PredictEnv<'_>,
    ) -> Result<Array2<f32>> {
        let trees = self.tree_range(&layers);
        let router = self.router(trees.clone(), data, env)?;
        let means: Vec<Vec<f32>> = self.trees[trees.clone()].iter().map(RegTree::node_mean_values).collect();
        let width = env.num_feature + 1;
        let n_cols = env.num_group * width;
        let rows = env.parallelism.maybe_par_map(0..data.num_row(), |row| {
            let mut contribs = vec![0.0f32; n_cols];
            for (t, idx) in trees.clone().enumerate() {
                let tree = &self.trees[idx];
                let offset = self.tree_info[idx] as usize * width;
                let path = router.path(t, tree, row);
                contribs[offset + env.num_feature] += means[t][0];
                for pair in path.windows(2) {
                    let (parent, child) = (pair[0], pair[1]);
                    contribs[offset + tree.split_index(parent)] += means[t][child] - means[t][parent];
                }
            }
            contribs
        });
        Array2::from_shape_vec((data.num_row(), n_cols), rows.into_iter().flatten().collect())
            .map_err(|e| LearnerError::model(format!("contribution shape: {e}")))
    }

    fn feature_score(&self, importance: ImportanceType) -> Result<Vec<(usize, f32)>> {
        let mut stats: BTreeMap<usize, (f64, f64, f64)> = BTreeMap::new();
        for tree in &self.trees {
            for node in (0..tree.n_nodes()).filter(|&n| !tree.is_leaf(n)) {
                let entry = stats.entry(tree.split_index(node)).or_default();
                entry.0 += 1.0;
                entry.1 += tree.loss_change(node) as f64;
                entry.2 += tree.cover(node) as f64;
            }
        }
        Ok(stats
            .into_iter()
            .map(|(feature, (count, gain, cover))| {
                let score = match importance {
                    ImportanceType::Weight => count,
                    ImportanceType::Gain => gain / count,
                    ImportanceType::Cover => cover / count,
                    ImportanceType::TotalGain => gain,
                    ImportanceType::TotalCover => cover,
                };
                (feature, score as f32)
            })
            .collect())
    }

    fn save_model(&self) -> GradientBoosterSchema {
        GradientBoosterSchema::GbTree {
            model: GbTreeModelSchema {
                gbtree_model_param: GbTreeModelParamSchema {
                    num_trees: self.trees.len().to_string(),
                    num_parallel_tree: self.num_parallel_tree.to_string(),
                },
                trees: self.trees.iter().enumerate().map(|(id, t)| TreeSchema::from_tree(id, t)).collect(),
                tree_info: self.tree_info.clone(),
                iteration_indptr: self.iteration_indptr.clone(),
            },
        }
    }

    fn load_model(&mut self, schema: GradientBoosterSchema, num_feature: usize, num_group: usize) -> Result<()> {
        let GradientBoosterSchema::GbTree { model } = schema else {
            return Err(LearnerError::model("expected a gbtree model"));
        };
        let trees = model
            .trees
            .into_iter()
            .map(|t| t.into_tree(num_feature))
            .collect::<Result<Vec<_>>>()?;
        if model.tree_info.len() != trees.len() || model.tree_info.iter().any(|&g| g as usize >= num_group.max(1)) {
            return Err(LearnerError::model("tree_info does not match the trees and output groups"));
        }
        let indptr = model.iteration_indptr;
        if indptr.first() != Some(&0)
            || indptr.last() != Some(&trees.len())
            || indptr.windows(2).any(|w| w[0] > w[1])
        {
            return Err(LearnerError::model("iteration_indptr does not match the trees"));
        }
        self.num_parallel_tree = parse_value("num_parallel_tree", &model.gbtree_model_param.num_parallel_tree)?;
        self.trees = trees;
        self.tree_info = model.tree_info;
        self.iteration_indptr = indptr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::collective::NoopCommunicator;
    use crate::context::GlobalRandom;
    use crate::utils::Parallelism;

    fn boost_once(booster: &mut GbTree, data: &DMatrix, grads: &[f32]) {
        let hess = vec![1.0f32; grads.len()];
        let gradients = Gradients::from_row_major(grads, &hess, grads.len(), 1).unwrap();
        let rng = GlobalRandom::new(0);
        let logger = TrainingLogger::default();
        let env = BoostEnv {
            comm: &NoopCommunicator,
            rng: &rng,
            parallelism: Parallelism::Sequential,
            num_feature: data.num_col(),
            num_group: 1,
            logger: &logger,
        };
        booster.do_boost(data, &gradients, &env).unwrap();
    }

    fn env() -> PredictEnv<'static> {
        PredictEnv { comm: &NoopCommunicator, parallelism: Parallelism::Sequential, num_feature: 2, num_group: 1 }
    }

    fn fitted() -> (GbTree, DMatrix) {
        let data = DMatrix::new(array![[0.0, 1.0], [1.0, 0.0], [2.0, 1.0], [3.0, 0.0]]);
        let mut booster = GbTree::default();
        booster.param = TreeTrainParam { min_child_weight: 0.0, lambda: 0.0, eta: 1.0, ..Default::default() };
        boost_once(&mut booster, &data, &[1.0, 1.0, -1.0, -1.0]);
        boost_once(&mut booster, &data, &[0.5, -0.5, 0.5, -0.5]);
        (booster, data)
    }

    #[test]
    fn layers_accumulate() {
        let (booster, data) = fitted();
        assert_eq!(booster.boosted_rounds(), 2);
        let mut first = Array2::zeros((1, 4));
        booster.predict_margin(&data, 0..1, &env(), &mut first).unwrap();
        assert_eq!(first, array![[-1.0, -1.0, 1.0, 1.0]]);

        let mut both = Array2::zeros((1, 4));
        booster.predict_margin(&data, 0..1, &env(), &mut both).unwrap();
        booster.predict_margin(&data, 1..2, &env(), &mut both).unwrap();
        let mut all = Array2::zeros((1, 4));
        booster.predict_margin(&data, 0..2, &env(), &mut all).unwrap();
        assert_eq!(both, all);
    }

    #[test]
    fn contributions_sum_to_margin() {
        let (booster, data) = fitted();
        let contribs = booster.predict_contribution(&data, 0..2, &env()).unwrap();
        let mut margin = Array2::zeros((1, 4));
        booster.predict_margin(&data, 0..2, &env(), &mut margin).unwrap();
        for row in 0..4 {
            let total: f32 = contribs.row(row).sum();
            assert!((total - margin[[0, row]]).abs() < 1e-5);
        }
    }

    #[test]
    fn leaf_prediction_shape() {
        let (booster, data) = fitted();
        let leaves = booster.predict_leaf(&data, 0..2, &env()).unwrap();
        assert_eq!(leaves.dim(), (4, 2));
        assert!(leaves.iter().all(|&l| l >= 1.0));
    }

    #[test]
    fn importance_counts_splits() {
        let (booster, _) = fitted();
        let weight = booster.feature_score(ImportanceType::Weight).unwrap();
        assert_eq!(weight[0].0, 0);
        let total: f32 = weight.iter().map(|(_, w)| w).sum();
        let splits: usize = booster.trees().iter().map(|t| t.n_nodes() - t.num_leaves()).sum();
        assert_eq!(total as usize, splits);
    }

    #[test]
    fn model_schema_round_trip() {
        let (booster, data) = fitted();
        let mut loaded = GbTree::default();
        loaded.load_model(booster.save_model(), 2, 1).unwrap();
        assert_eq!(loaded.trees(), booster.trees());
        let mut a = Array2::zeros((1, 4));
        let mut b = Array2::zeros((1, 4));
        booster.predict_margin(&data, 0..2, &env(), &mut a).unwrap();
        loaded.predict_margin(&data, 0..2, &env(), &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exact_falls_back_to_cpu() {
        let logger = TrainingLogger::default();
        let mut booster = GbTree::default();
        assert_eq!(booster.resolve_device(DeviceOrd::Cuda(0), &logger), DeviceOrd::Cuda(0));
        booster.apply("tree_method", "exact").unwrap();
        assert_eq!(booster.resolve_device(DeviceOrd::Cuda(0), &logger), DeviceOrd::Cpu);
    }

    #[test]
    fn invalid_params() {
        let mut booster = GbTree::default();
        assert!(booster.apply("eta", "0").is_err());
        assert!(booster.apply("subsample", "1.5").is_err());
        assert!(booster.apply("tree_method", "gpu_exact").is_err());
        assert!(!booster.apply("booster", "gbtree").unwrap());
    }
}
