//! Learner configuration.
//!
//! Everything the learner derives from its parameters lives in [`LearnerState`].
//! [`LearnerState::configure`] resolves it in a fixed order: generic context,
//! learner training parameters, model parameters, feature count, target count,
//! objective, booster, metrics. It then checks that every worker resolved the
//! same configuration and reports keys nobody consumed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::collective::{Communicator, check_consistent, worker_local_threads};
use crate::context::{Context, GlobalRandom};
use crate::data::DMatrix;
use crate::error::{LearnerError, Result};
use crate::gbm::{self, Booster, DEFAULT_BOOSTER, GradientBooster};
use crate::metric::Metric;
use crate::objective::{self, DEFAULT_BASE_SCORE, DEFAULT_OBJECTIVE, Objective, ObjectiveFn};
use crate::params::{Args, ParamSet, ParamStore, bool_str, parse_bool, parse_value};

/// Keys that may differ between workers.
const WORKER_LOCAL_KEYS: [&str; 3] = ["nthread", "n_jobs", "device"];

/// Whether the learner must be configured before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigState {
    Unconfigured,
    Configured,
}

// =============================================================================
// Learner Train Parameters
// =============================================================================

/// Learner-level training parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnerTrainParam {
    pub objective: String,
    pub booster: String,
    pub disable_default_eval_metric: bool,
    pub multi_strategy: String,
}

impl Default for LearnerTrainParam {
    fn default() -> Self {
        Self {
            objective: DEFAULT_OBJECTIVE.to_string(),
            booster: DEFAULT_BOOSTER.to_string(),
            disable_default_eval_metric: false,
            multi_strategy: "one_output_per_tree".to_string(),
        }
    }
}

impl ParamSet for LearnerTrainParam {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "objective" => self.objective = value.to_string(),
            "booster" => self.booster = value.to_string(),
            "disable_default_eval_metric" => self.disable_default_eval_metric = parse_bool(key, value)?,
            "multi_strategy" => {
                if value != "one_output_per_tree" {
                    return Err(LearnerError::validation(format!(
                        "unsupported multi_strategy `{value}`, only `one_output_per_tree` is available"
                    )));
                }
                self.multi_strategy = value.to_string();
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("booster".to_string(), self.booster.clone()),
            ("disable_default_eval_metric".to_string(), bool_str(self.disable_default_eval_metric)),
            ("multi_strategy".to_string(), self.multi_strategy.clone()),
            ("objective".to_string(), self.objective.clone()),
        ])
    }
}

// =============================================================================
// Learner Model Parameters
// =============================================================================

/// Model parameters as given by the user. Unset fields keep the model's values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearnerModelParamArgs {
    pub base_score: Option<f32>,
    pub boost_from_average: Option<bool>,
    pub num_class: Option<usize>,
    pub num_feature: Option<usize>,
}

impl ParamSet for LearnerModelParamArgs {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "base_score" => {
                let v: f32 = parse_value(key, value)?;
                if !v.is_finite() {
                    return Err(LearnerError::validation(format!("base_score must be finite, got {value}")));
                }
                self.base_score = Some(v);
            }
            "boost_from_average" => self.boost_from_average = Some(parse_bool(key, value)?),
            "num_class" => self.num_class = Some(parse_value(key, value)?),
            "num_feature" => self.num_feature = Some(parse_value(key, value)?),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        if let Some(v) = self.base_score {
            args.insert("base_score".to_string(), v.to_string());
        }
        if let Some(v) = self.boost_from_average {
            args.insert("boost_from_average".to_string(), bool_str(v));
        }
        if let Some(v) = self.num_class {
            args.insert("num_class".to_string(), v.to_string());
        }
        if let Some(v) = self.num_feature {
            args.insert("num_feature".to_string(), v.to_string());
        }
        args
    }
}

/// Structural model parameters, persisted with the model.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnerModelParam {
    pub num_feature: usize,
    pub num_class: usize,
    pub num_target: usize,
    /// One value per output group, in output space.
    pub base_score: Vec<f32>,
    pub boost_from_average: bool,
}

impl Default for LearnerModelParam {
    fn default() -> Self {
        Self {
            num_feature: 0,
            num_class: 0,
            num_target: 1,
            base_score: vec![DEFAULT_BASE_SCORE],
            boost_from_average: true,
        }
    }
}

// =============================================================================
// Learner State
// =============================================================================

/// Configured components of a learner.
#[derive(Debug)]
pub(crate) struct LearnerState {
    pub state: ConfigState,
    pub ctx: Context,
    pub rng: GlobalRandom,
    /// Seed last applied to `rng`.
    pub applied_seed: Option<i64>,
    pub train: LearnerTrainParam,
    pub model: LearnerModelParam,
    /// The user supplied `base_score`.
    pub user_base_score: bool,
    pub objective: Objective,
    pub booster: Booster,
    pub metrics: Vec<Metric>,
    pub unused: Vec<String>,
    /// Bumped whenever cached margins become stale.
    pub epoch: u64,
}

impl Default for LearnerState {
    fn default() -> Self {
        Self {
            state: ConfigState::Unconfigured,
            ctx: Context::default(),
            rng: GlobalRandom::default(),
            applied_seed: None,
            train: LearnerTrainParam::default(),
            model: LearnerModelParam::default(),
            user_base_score: false,
            objective: Objective::SquaredError(objective::SquaredError),
            booster: Booster::GbTree(gbm::GbTree::default()),
            metrics: Vec::new(),
            unused: Vec::new(),
            epoch: 0,
        }
    }
}

/// Inputs to configuration that live outside the state.
pub(crate) struct ConfigInputs<'a> {
    pub params: &'a ParamStore,
    pub matrices: &'a [Arc<DMatrix>],
    pub feature_names: &'a [String],
    pub feature_types: &'a [String],
    pub comm: &'a dyn Communicator,
}

impl LearnerState {
    pub fn is_configured(&self) -> bool {
        self.state == ConfigState::Configured
    }

    pub fn invalidate(&mut self) {
        self.state = ConfigState::Unconfigured;
    }

    pub fn num_groups(&self) -> usize {
        self.objective.num_groups(self.model.num_target).max(1)
    }

    /// Threads for one call, shared fairly between co-located workers.
    pub fn threads(&self, comm: &dyn Communicator) -> usize {
        match self.ctx.nthread {
            0 if comm.is_distributed() => worker_local_threads(comm.world_size()),
            n => n,
        }
    }

    /// Resolve every component from the parameters.
    pub fn configure(&mut self, inputs: &ConfigInputs<'_>) -> Result<()> {
        let params = inputs.params;
        params.validate_keys()?;
        let (args, rewrote_gpu_hist) = resolve_legacy_args(params);
        let mut consumed: HashSet<String> = HashSet::new();

        // Generic context.
        self.ctx.update(&args, &mut consumed)?;
        if self.applied_seed != Some(self.ctx.seed) {
            self.rng.seed(self.ctx.seed);
            self.applied_seed = Some(self.ctx.seed);
        }
        let logger = self.ctx.logger();
        if rewrote_gpu_hist {
            logger.warn("tree_method `gpu_hist` is deprecated, use `device=cuda` with `tree_method=hist`");
        }

        // Learner parameters.
        self.train.update(&args, &mut consumed)?;
        let mut model_args = LearnerModelParamArgs::default();
        model_args.update(&args, &mut consumed)?;
        let fitted = self.booster.boosted_rounds() > 0;

        if let Some(num_class) = model_args.num_class {
            if fitted && num_class != self.model.num_class {
                return Err(LearnerError::compatibility(format!(
                    "model was trained with num_class={}, got {num_class}",
                    self.model.num_class
                )));
            }
            self.model.num_class = num_class;
        }
        match (model_args.boost_from_average, model_args.base_score) {
            (Some(explicit), _) => self.model.boost_from_average = explicit,
            (None, Some(_)) => self.model.boost_from_average = false,
            (None, None) => {}
        }

        // Features.
        let data_features = inputs.matrices.iter().map(|m| m.num_col()).max().unwrap_or(0);
        self.model.num_feature = self
            .model
            .num_feature
            .max(model_args.num_feature.unwrap_or(0))
            .max(data_features);
        check_feature_info(inputs.feature_names, inputs.feature_types, self.model.num_feature)?;

        // Targets.
        let num_target = gather_num_target(inputs.matrices, inputs.comm)?;
        if num_target > 0 {
            if fitted && num_target != self.model.num_target {
                return Err(LearnerError::compatibility(format!(
                    "model was trained with {} targets, labels have {num_target}",
                    self.model.num_target
                )));
            }
            self.model.num_target = num_target;
        }

        // Objective.
        if self.objective.name() != self.train.objective {
            let created = objective::create(&self.train.objective)?;
            if fitted && created.name() != self.objective.name() {
                logger.warn(format!(
                    "objective changed from `{}` to `{}` on a fitted model",
                    self.objective.name(),
                    created.name()
                ));
            }
            self.objective = created;
            self.train.objective = self.objective.name().to_string();
            self.epoch += 1;
        }
        self.objective.update(&args, &mut consumed)?;
        self.objective.check_targets(self.model.num_target)?;

        // Base score, one value per output group.
        let n_groups = self.num_groups();
        let previous = self.model.base_score.clone();
        if let Some(value) = model_args.base_score {
            self.objective.check_base_score(value)?;
            self.model.base_score = vec![value; n_groups];
            self.user_base_score = true;
        } else if self.model.base_score.len() != n_groups {
            let fill = match self.model.base_score.as_slice() {
                [single] => *single,
                _ => DEFAULT_BASE_SCORE,
            };
            self.model.base_score = vec![fill; n_groups];
        }
        if self.model.base_score != previous {
            self.epoch += 1;
        }

        // Booster.
        if self.booster.name() != self.train.booster {
            if fitted {
                return Err(LearnerError::compatibility(format!(
                    "cannot switch a fitted `{}` model to booster `{}`",
                    self.booster.name(),
                    self.train.booster
                )));
            }
            self.booster = gbm::create(&self.train.booster)?;
            self.epoch += 1;
        }
        self.booster.update(&args, &mut consumed)?;
        self.ctx.device = self.booster.resolve_device(self.ctx.device, &logger);
        for data in inputs.matrices {
            self.booster.check_data_split(data, inputs.comm)?;
        }

        // Metrics.
        self.metrics = params.metrics().iter().map(|m| Metric::create(m)).collect::<Result<_>>()?;

        // Every worker must agree on everything except worker-local keys.
        let fingerprint: BTreeMap<&str, &str> = args
            .iter()
            .filter(|(k, _)| !WORKER_LOCAL_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let bytes = serde_json::to_vec(&fingerprint)?;
        check_consistent(inputs.comm, "learner configuration", &bytes)?;

        self.unused = unused_keys(&args, &consumed);
        if self.ctx.validate_parameters && !self.unused.is_empty() {
            let listed: Vec<String> = self.unused.iter().map(|k| format!("\"{k}\"")).collect();
            logger.warn(format!("Parameters: {{ {} }} are not used.", listed.join(", ")));
        }

        self.state = ConfigState::Configured;
        Ok(())
    }
}

/// Rewrite deprecated spellings before the typed groups see them. The flag tells
/// whether `gpu_hist` was rewritten.
fn resolve_legacy_args(params: &ParamStore) -> (Args, bool) {
    let mut args: Args = params.args().to_vec();
    let gpu_hist = args.iter().any(|(k, v)| k == "tree_method" && v == "gpu_hist");
    if gpu_hist {
        for (k, v) in args.iter_mut() {
            if k == "tree_method" {
                *v = "hist".to_string();
            }
        }
        if !params.contains("device") {
            args.push(("device".to_string(), "cuda".to_string()));
        }
    }
    (args, gpu_hist)
}

fn unused_keys(args: &Args, consumed: &HashSet<String>) -> Vec<String> {
    let mut unused: Vec<String> = Vec::new();
    for (key, _) in args {
        if !consumed.contains(key) && !unused.contains(key) {
            unused.push(key.clone());
        }
    }
    unused
}

/// Largest label column count over live matrices and workers; 0 when no labels.
fn gather_num_target(matrices: &[Arc<DMatrix>], comm: &dyn Communicator) -> Result<usize> {
    let local = matrices.iter().map(|m| m.info().num_target()).max().unwrap_or(0);
    if !comm.is_distributed() {
        return Ok(local);
    }
    let gathered = comm.allgather(&(local as u64).to_le_bytes())?;
    let mut num_target = 0;
    for bytes in &gathered {
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| LearnerError::Collective("malformed target count".into()))?;
        num_target = num_target.max(u64::from_le_bytes(arr) as usize);
    }
    Ok(num_target)
}

pub(crate) fn check_feature_info(names: &[String], types: &[String], num_feature: usize) -> Result<()> {
    if !names.is_empty() && num_feature > 0 && names.len() != num_feature {
        return Err(LearnerError::validation(format!(
            "{} feature names given for a model with {num_feature} features",
            names.len()
        )));
    }
    if !types.is_empty() && num_feature > 0 && types.len() != num_feature {
        return Err(LearnerError::validation(format!(
            "{} feature types given for a model with {num_feature} features",
            types.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, array};

    use super::*;
    use crate::collective::NoopCommunicator;

    fn configure(state: &mut LearnerState, params: &ParamStore, matrices: &[Arc<DMatrix>]) -> Result<()> {
        state.configure(&ConfigInputs {
            params,
            matrices,
            feature_names: &[],
            feature_types: &[],
            comm: &NoopCommunicator,
        })
    }

    #[test]
    fn defaults() {
        let mut state = LearnerState::default();
        configure(&mut state, &ParamStore::new(), &[]).unwrap();
        assert!(state.is_configured());
        assert_eq!(state.objective.name(), "reg:squarederror");
        assert_eq!(state.booster.name(), "gbtree");
        assert_eq!(state.model.base_score, vec![0.5]);
        assert!(state.unused.is_empty());
    }

    #[test]
    fn unused_keys_in_insertion_order() {
        let mut params = ParamStore::new();
        params.set("foo", "1");
        params.set("eta", "0.1");
        params.set("bar", "2");
        params.set("foo", "3");
        let mut state = LearnerState::default();
        configure(&mut state, &params, &[]).unwrap();
        assert_eq!(state.unused, vec!["foo", "bar"]);
    }

    #[test]
    fn user_base_score_disables_boost_from_average() {
        let mut params = ParamStore::new();
        params.set("base_score", "1.5");
        let mut state = LearnerState::default();
        configure(&mut state, &params, &[]).unwrap();
        assert!(!state.model.boost_from_average);
        assert!(state.user_base_score);

        params.set("boost_from_average", "1");
        configure(&mut state, &params, &[]).unwrap();
        assert!(state.model.boost_from_average);
    }

    #[test]
    fn logistic_base_score_must_be_a_probability() {
        let mut params = ParamStore::new();
        params.set("objective", "binary:logistic");
        params.set("base_score", "2");
        let err = configure(&mut LearnerState::default(), &params, &[]).unwrap_err();
        assert!(matches!(err, LearnerError::Validation(_)));
    }

    #[test]
    fn gpu_hist_means_cuda_hist() {
        let mut params = ParamStore::new();
        params.set("tree_method", "gpu_hist");
        let mut state = LearnerState::default();
        configure(&mut state, &params, &[]).unwrap();
        assert!(state.ctx.device.is_cuda());
        assert_eq!(state.booster.to_args()["tree_method"], "hist");
    }

    #[test]
    fn num_feature_and_target_come_from_data() {
        let data = DMatrix::new(Array2::zeros((4, 3)));
        data.set_labels(Array2::zeros((4, 2))).unwrap();
        let matrices = vec![Arc::new(data)];
        let mut state = LearnerState::default();
        configure(&mut state, &ParamStore::new(), &matrices).unwrap();
        assert_eq!(state.model.num_feature, 3);
        assert_eq!(state.model.num_target, 2);
        assert_eq!(state.num_groups(), 2);
        assert_eq!(state.model.base_score.len(), 2);
    }

    #[test]
    fn single_target_objective_rejects_label_matrix() {
        let data = DMatrix::new(array![[0.0], [1.0]]);
        data.set_labels(array![[0.0, 1.0], [1.0, 0.0]]).unwrap();
        let mut params = ParamStore::new();
        params.set("objective", "binary:logistic");
        let err = configure(&mut LearnerState::default(), &params, &[Arc::new(data)]).unwrap_err();
        assert!(matches!(err, LearnerError::Compatibility(_)));
    }

    #[test]
    fn reconfigure_keeps_the_generator() {
        let mut params = ParamStore::new();
        params.set("seed", "7");
        let mut state = LearnerState::default();
        configure(&mut state, &params, &[]).unwrap();
        let first = state.rng.uniform_f32();
        state.invalidate();
        configure(&mut state, &params, &[]).unwrap();
        let second = state.rng.uniform_f32();

        let reference = GlobalRandom::new(7);
        reference.uniform_f32();
        assert_eq!(second, reference.uniform_f32());
        assert_ne!(first, second);
    }

    #[test]
    fn whitespace_in_keys_fails_at_configure() {
        let mut params = ParamStore::new();
        params.set("tree method", "exact");
        assert!(matches!(
            configure(&mut LearnerState::default(), &params, &[]),
            Err(LearnerError::Validation(_))
        ));
    }
}
