//! The learner: lifecycle orchestration of a gradient-boosted model.
//!
//! A [`Learner`] owns a parameter store, the configured objective and booster,
//! the base score, and a prediction cache for its training matrices. The usual
//! flow is:
//!
//! ```text
//! Learner::create(&[train])  ->  set_param(..)  ->  update_one_iter(i, &train) ...
//!                                                   predict(..) from any thread
//!                                                   save_model() / save(..)
//! ```
//!
//! Configuration is lazy: any reader that needs a configured learner configures
//! it on first use. Setting a parameter or loading a model marks the learner as
//! unconfigured again.
//!
//! # Distributed training
//!
//! Every worker creates its own learner with a [`Communicator`] and calls the
//! same operations in the same order. Column-split tree building, base score
//! estimation, metric reduction and configuration checks go through the
//! communicator, so every worker ends with a bit-identical model.

mod base_score;
mod config;
mod io;

pub use config::{ConfigState, LearnerModelParam, LearnerModelParamArgs, LearnerTrainParam};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use ndarray::{Array2, ArrayView2};

use self::config::{ConfigInputs, LearnerState, check_feature_info};
use crate::collective::{self, Communicator, SharedCommunicator, apply_with_labels};
use crate::data::{DMatrix, validate_feature_types};
use crate::error::{LearnerError, Result};
use crate::gbm::{self, BoostEnv, GradientBooster, ImportanceType, PredictEnv};
use crate::gradients::Gradients;
use crate::metric::{Metric, MetricFn, MetricPartial, MetricValue};
use crate::objective::ObjectiveFn;
use crate::params::ParamStore;
use crate::predictor::{self, PredictionCache, PredictionCacheEntry, PredictionType, ThreadLocalEntry};
use crate::utils::{Parallelism, run_with_threads};

static NEXT_LEARNER_ID: AtomicU64 = AtomicU64::new(1);

/// A gradient-boosting learner.
#[derive(Debug)]
pub struct Learner {
    id: u64,
    /// Liveness token for this learner's thread-local entries.
    alive: Arc<()>,
    params: ParamStore,
    cache: PredictionCache,
    /// State epoch the cache was filled under.
    cache_epoch: u64,
    attributes: BTreeMap<String, String>,
    feature_names: Vec<String>,
    feature_types: Vec<String>,
    comm: SharedCommunicator,
    state: RwLock<LearnerState>,
}

impl Learner {
    /// Create a single-process learner caching predictions for `matrices`.
    pub fn create(matrices: &[Arc<DMatrix>]) -> Self {
        Self::with_communicator(matrices, collective::local())
    }

    /// Create a learner for one worker of a distributed group.
    pub fn with_communicator(matrices: &[Arc<DMatrix>], comm: SharedCommunicator) -> Self {
        let mut cache = PredictionCache::default();
        for m in matrices {
            cache.cache(m);
        }
        Self {
            id: NEXT_LEARNER_ID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            params: ParamStore::new(),
            cache,
            cache_epoch: 0,
            attributes: BTreeMap::new(),
            feature_names: Vec::new(),
            feature_types: Vec::new(),
            comm,
            state: RwLock::new(LearnerState::default()),
        }
    }

    pub fn communicator(&self) -> &SharedCommunicator {
        &self.comm
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Record a parameter. Never fails; problems surface at configuration.
    pub fn set_param(&mut self, key: &str, value: &str) {
        self.params.set(key, value);
        self.state_mut().invalidate();
    }

    pub fn set_params<K, V>(&mut self, params: impl IntoIterator<Item = (K, V)>)
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in params {
            self.set_param(key.as_ref(), value.as_ref());
        }
    }

    /// Parameters set so far, excluding `eval_metric`.
    pub fn get_configuration_arguments(&self) -> BTreeMap<String, String> {
        self.params.configuration_arguments()
    }

    /// Keys no component consumed at the last configuration.
    pub fn unused_parameters(&self) -> Result<Vec<String>> {
        Ok(self.configured()?.unused.clone())
    }

    pub fn config_state(&self) -> ConfigState {
        self.read_state().state
    }

    /// Resolve parameters into components. Does nothing when already configured.
    pub fn configure(&mut self) -> Result<()> {
        let matrices = self.cache.matrices();
        let inputs = ConfigInputs {
            params: &self.params,
            matrices: &matrices,
            feature_names: &self.feature_names,
            feature_types: &self.feature_types,
            comm: self.comm.as_ref(),
        };
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.is_configured() {
            return Ok(());
        }
        state.configure(&inputs)
    }

    /// Read access to a configured state, configuring on first use.
    fn configured(&self) -> Result<RwLockReadGuard<'_, LearnerState>> {
        {
            let state = self.read_state();
            if state.is_configured() {
                return Ok(state);
            }
        }
        {
            let mut state = self.write_state();
            if !state.is_configured() {
                let matrices = self.cache.matrices();
                state.configure(&ConfigInputs {
                    params: &self.params,
                    matrices: &matrices,
                    feature_names: &self.feature_names,
                    feature_types: &self.feature_types,
                    comm: self.comm.as_ref(),
                })?;
            }
        }
        Ok(self.read_state())
    }

    fn read_state(&self) -> RwLockReadGuard<'_, LearnerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, LearnerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&mut self) -> &mut LearnerState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Training
    // =========================================================================

    /// Boost one layer on `train` using the objective's gradients.
    pub fn update_one_iter(&mut self, iter: usize, train: &Arc<DMatrix>) -> Result<()> {
        self.train_step(iter, train, None)
    }

    /// Boost one layer from caller-supplied gradients, row-major `(rows, groups)`.
    pub fn boost_one_iter(&mut self, iter: usize, train: &Arc<DMatrix>, grad: &[f32], hess: &[f32]) -> Result<()> {
        let rows = train.num_row();
        if grad.len() != hess.len() || rows == 0 || grad.len() % rows != 0 {
            return Err(LearnerError::data(format!(
                "{} gradients and {} hessians for {rows} rows",
                grad.len(),
                hess.len()
            )));
        }
        let gradients = Gradients::from_row_major(grad, hess, rows, grad.len() / rows)?;
        self.train_step(iter, train, Some(gradients))
    }

    fn train_step(&mut self, iter: usize, train: &Arc<DMatrix>, custom: Option<Gradients>) -> Result<()> {
        let start = Instant::now();
        if !self.cache.contains(train.id()) {
            self.cache.cache(train);
            self.state_mut().invalidate();
        }
        self.configure()?;

        let comm = Arc::clone(&self.comm);
        let comm = comm.as_ref();
        let source = self.cache.matrices().into_iter().next().unwrap_or_else(|| Arc::clone(train));
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let logger = state.ctx.logger();

        validate_training_data(state, train, comm, custom.is_none())?;
        if state.ctx.seed_per_iteration {
            state.rng.seed(state.ctx.seed.wrapping_add(iter as i64));
        }

        if custom.is_none()
            && !state.user_base_score
            && state.model.boost_from_average
            && state.booster.boosted_rounds() == 0
        {
            let n_groups = state.num_groups();
            let estimated = base_score::estimate(&state.objective, &source, n_groups, comm)?;
            logger.debug(format!("estimated base score {estimated:?}"));
            if estimated != state.model.base_score {
                state.model.base_score = estimated;
                state.epoch += 1;
            }
        }
        if self.cache_epoch != state.epoch {
            self.cache.invalidate();
            self.cache_epoch = state.epoch;
        }

        let n_groups = state.num_groups();
        let entry = self
            .cache
            .entry_mut(train.id())
            .ok_or_else(|| LearnerError::data("training matrix is not cached"))?;
        let threads = state.threads(comm);
        run_with_threads(threads, |parallelism| -> Result<()> {
            refresh_margins(state, train, entry, comm, parallelism)?;
            let gradients = match custom {
                Some(g) => g,
                None => objective_gradients(state, train, entry.predictions.view(), comm)?,
            };
            if gradients.n_groups() != n_groups || gradients.n_rows() != train.num_row() {
                return Err(LearnerError::data(format!(
                    "gradients have shape ({}, {}), expected ({}, {n_groups})",
                    gradients.n_rows(),
                    gradients.n_groups(),
                    train.num_row()
                )));
            }
            let env = BoostEnv {
                comm,
                rng: &state.rng,
                parallelism,
                num_feature: state.model.num_feature,
                num_group: n_groups,
                logger: &logger,
            };
            state.booster.do_boost(train, &gradients, &env)?;
            refresh_margins(state, train, entry, comm, parallelism)
        })?;

        logger.log_iteration(iter, start.elapsed());
        Ok(())
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluate every configured metric on every dataset.
    ///
    /// Returns `"[iter]\tname-metric:value..."`.
    pub fn eval_one_iter(&self, iter: usize, data_sets: &[(&DMatrix, &str)]) -> Result<String> {
        let state = self.configured()?;
        let state: &LearnerState = &state;
        let metrics: Vec<Metric> = if !state.metrics.is_empty() {
            state.metrics.clone()
        } else if state.train.disable_default_eval_metric {
            Vec::new()
        } else {
            vec![Metric::create(state.objective.default_metric())?]
        };
        let comm = self.comm.as_ref();
        let rounds = state.booster.boosted_rounds();

        let mut line = format!("[{iter}]");
        for (data, name) in data_sets {
            let margins = run_with_threads(state.threads(comm), |parallelism| -> Result<Array2<f32>> {
                let mut margins = base_margin(state, data)?;
                state.booster.predict_margin(data, 0..rounds, &predict_env(state, comm, parallelism), &mut margins)?;
                Ok(margins)
            })?;
            let predictions = state.objective.eval_transform(margins);
            for metric in &metrics {
                let value = evaluate(metric, predictions.view(), data, comm)?;
                line.push_str(&format!("\t{name}-{}", MetricValue { name: metric.name(), value }));
            }
        }
        state.ctx.logger().log_evaluation(&line);
        Ok(line)
    }

    // =========================================================================
    // Prediction
    // =========================================================================

    /// Predict `data` into `out`.
    ///
    /// `iteration_end == 0` means all layers. Output layouts are row-major:
    /// value and margin `(rows, groups)`, leaf `(rows, trees)`, contribution
    /// `(rows, groups * (features + 1))` with the bias last in every group.
    /// `out.version` is set to the number of layers used.
    pub fn predict(
        &self,
        data: &DMatrix,
        training: bool,
        out: &mut PredictionCacheEntry,
        iteration_begin: usize,
        iteration_end: usize,
        kind: PredictionType,
    ) -> Result<()> {
        // Neither booster changes its output at training time.
        let _ = training;
        let state = self.configured()?;
        let state: &LearnerState = &state;
        self.check_prediction_data(state, data)?;

        let layers = gbm::layer_range(iteration_begin, iteration_end, state.booster.boosted_rounds())?;
        let comm = self.comm.as_ref();
        let predictions = run_with_threads(state.threads(comm), |parallelism| -> Result<Array2<f32>> {
            let env = predict_env(state, comm, parallelism);
            match kind {
                PredictionType::Value | PredictionType::Margin => {
                    let mut margins = base_margin(state, data)?;
                    state.booster.predict_margin(data, layers.clone(), &env, &mut margins)?;
                    if kind == PredictionType::Value {
                        margins = state.objective.pred_transform(margins);
                    }
                    Ok(margins.t().as_standard_layout().into_owned())
                }
                PredictionType::Leaf => state.booster.predict_leaf(data, layers.clone(), &env),
                PredictionType::Contribution => {
                    let mut contributions = state.booster.predict_contribution(data, layers.clone(), &env)?;
                    let base = base_margin(state, data)?;
                    let width = env.num_feature + 1;
                    for ((group, row), &margin) in base.indexed_iter() {
                        contributions[[row, group * width + env.num_feature]] += margin;
                    }
                    Ok(contributions)
                }
            }
        })?;
        out.predictions = predictions;
        out.version = layers.end;
        Ok(())
    }

    /// Run `f` with this thread's private scratch entry for this learner.
    ///
    /// Entries on other threads outlive the learner until those threads touch a
    /// thread-local entry again or exit.
    pub fn with_thread_local<R>(&self, f: impl FnOnce(&mut ThreadLocalEntry) -> R) -> R {
        predictor::with_thread_local(self.id, &self.alive, f)
    }

    fn check_prediction_data(&self, state: &LearnerState, data: &DMatrix) -> Result<()> {
        let num_feature = state.model.num_feature;
        if state.booster.boosted_rounds() > 0 && data.num_col() > num_feature {
            return Err(LearnerError::data(format!(
                "data has {} columns, the model was trained with {num_feature} features",
                data.num_col()
            )));
        }
        let info = data.info();
        if !self.feature_names.is_empty() && !info.feature_names.is_empty() && info.feature_names != self.feature_names
        {
            return Err(LearnerError::validation("feature names of the data do not match the model"));
        }
        Ok(())
    }

    // =========================================================================
    // Model information
    // =========================================================================

    pub fn num_features(&self) -> Result<usize> {
        Ok(self.configured()?.model.num_feature)
    }

    pub fn num_output_groups(&self) -> Result<usize> {
        Ok(self.configured()?.num_groups())
    }

    pub fn boosted_rounds(&self) -> usize {
        self.read_state().booster.boosted_rounds()
    }

    /// Base score per output group, in output space.
    pub fn base_score(&self) -> Result<Vec<f32>> {
        Ok(self.configured()?.model.base_score.clone())
    }

    /// Feature importance keyed by feature name (`f{index}` when unnamed).
    pub fn feature_score(&self, importance_type: &str) -> Result<Vec<(String, f32)>> {
        let importance: ImportanceType = importance_type.parse()?;
        let state = self.configured()?;
        let scores = state.booster.feature_score(importance)?;
        Ok(scores
            .into_iter()
            .map(|(feature, score)| {
                let name = self.feature_names.get(feature).cloned().unwrap_or_else(|| format!("f{feature}"));
                (name, score)
            })
            .collect())
    }

    // =========================================================================
    // Attributes and feature info
    // =========================================================================

    pub fn set_attr(&mut self, key: &str, value: &str) {
        self.attributes.insert(key.to_string(), value.to_string());
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Remove an attribute; returns whether it existed.
    pub fn del_attr(&mut self, key: &str) -> bool {
        self.attributes.remove(key).is_some()
    }

    pub fn attr_names(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }

    /// Set feature names; an empty list clears them.
    pub fn set_feature_names(&mut self, names: Vec<String>) -> Result<()> {
        check_feature_info(&names, &[], self.read_state().model.num_feature)?;
        self.feature_names = names;
        Ok(())
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Set feature type tags (`q`, `int`, `i`, `float`, `f`, `c`).
    pub fn set_feature_types(&mut self, types: Vec<String>) -> Result<()> {
        validate_feature_types(&types)?;
        check_feature_info(&[], &types, self.read_state().model.num_feature)?;
        self.feature_types = types;
        Ok(())
    }

    pub fn feature_types(&self) -> &[String] {
        &self.feature_types
    }
}

impl Drop for Learner {
    fn drop(&mut self) {
        predictor::release_thread_local(self.id);
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn predict_env<'a>(state: &LearnerState, comm: &'a dyn Communicator, parallelism: Parallelism) -> PredictEnv<'a> {
    PredictEnv { comm, parallelism, num_feature: state.model.num_feature, num_group: state.num_groups() }
}

/// Initial margins `[n_groups, n_rows]`: the matrix's base margin, or the base score.
fn base_margin(state: &LearnerState, data: &DMatrix) -> Result<Array2<f32>> {
    let n_groups = state.num_groups();
    let info = data.info();
    if let Some(margin) = &info.base_margin {
        if margin.ncols() != n_groups {
            return Err(LearnerError::data(format!(
                "base margin has {} columns, the model has {n_groups} output groups",
                margin.ncols()
            )));
        }
        return Ok(margin.t().as_standard_layout().into_owned());
    }
    let mut margins = Array2::zeros((n_groups, data.num_row()));
    for (group, mut row) in margins.rows_mut().into_iter().enumerate() {
        let score = state.model.base_score.get(group).or(state.model.base_score.first()).copied().unwrap_or(0.5);
        row.fill(state.objective.prob_to_margin(score));
    }
    Ok(margins)
}

/// Bring a cached margin entry up to the booster's current layer count.
fn refresh_margins(
    state: &LearnerState,
    data: &DMatrix,
    entry: &mut PredictionCacheEntry,
    comm: &dyn Communicator,
    parallelism: Parallelism,
) -> Result<()> {
    let rounds = state.booster.boosted_rounds();
    let shape = (state.num_groups(), data.num_row());
    if entry.version > rounds || !state.booster.layer_additive() || entry.predictions.dim() != shape {
        entry.predictions = base_margin(state, data)?;
        entry.version = 0;
    }
    if entry.version < rounds {
        let env = predict_env(state, comm, parallelism);
        state.booster.predict_margin(data, entry.version..rounds, &env, &mut entry.predictions)?;
        entry.version = rounds;
    }
    Ok(())
}

fn validate_training_data(
    state: &LearnerState,
    train: &DMatrix,
    comm: &dyn Communicator,
    needs_labels: bool,
) -> Result<()> {
    let mut infinite = [train.num_infinite() as f64];
    comm.allreduce_sum(&mut infinite)?;
    if infinite[0] > 0.0 {
        return Err(LearnerError::data(format!(
            "training data holds {} infinite feature values; use NaN for missing values",
            infinite[0]
        )));
    }
    let info = train.info();
    info.validate()?;
    let labels_elsewhere = info.federated && comm.is_distributed() && comm.rank() != 0;
    if needs_labels && !labels_elsewhere {
        if !info.has_labels() {
            return Err(LearnerError::data("labels are required for training"));
        }
        state.objective.validate_labels(&info)?;
    }
    state.booster.check_data_split(train, comm)
}

/// Objective gradients; for vertical federated data rank 0 computes and broadcasts.
fn objective_gradients(
    state: &LearnerState,
    train: &DMatrix,
    margins: ArrayView2<'_, f32>,
    comm: &dyn Communicator,
) -> Result<Gradients> {
    let rows = train.num_row();
    let n_groups = state.num_groups();
    let compute = || -> Result<Gradients> {
        let mut gradients = Gradients::new(rows, n_groups);
        state.objective.gradients(margins, &train.info(), &mut gradients)?;
        Ok(gradients)
    };
    if train.info().is_vertical_federated() && comm.is_distributed() {
        let values = apply_with_labels(comm, || compute().map(|g| g.to_f32_vec()))?;
        return Gradients::from_f32_vec(values, rows, n_groups);
    }
    compute()
}

/// Evaluate one metric, reducing across workers as the data split requires.
///
/// Vertical federated labels exist on rank 0 only. Column-split workers share
/// every row and label, so each evaluates locally. Row-split partials are summed.
fn evaluate(metric: &Metric, predictions: ArrayView2<'_, f32>, data: &DMatrix, comm: &dyn Communicator) -> Result<f64> {
    let (federated, column_split) = {
        let info = data.info();
        (info.federated, info.is_column_split())
    };
    if federated && comm.is_distributed() {
        let value = apply_with_labels(comm, || {
            let partial = metric.partial(predictions, &data.info())?;
            Ok(vec![metric.finalize(partial) as f32])
        })?;
        return Ok(value.first().copied().map(f64::from).unwrap_or(f64::NAN));
    }
    let partial = metric.partial(predictions, &data.info())?;
    if column_split {
        return Ok(metric.finalize(partial));
    }
    let mut sums = [partial.sum, partial.weight];
    comm.allreduce_sum(&mut sums)?;
    Ok(metric.finalize(MetricPartial::new(sums[0], sums[1])))
}
