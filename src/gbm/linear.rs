//! Linear booster (`gblinear`) trained by coordinate descent.
//!
//! Weights are stored feature-major, `weights[feature * num_group + group]`, with the
//! bias of every group after the last feature. Missing values contribute nothing.
//!
//! # Updates
//!
//! ```text
//! grad_l2 = Σ(g × x) + λ × w
//! hess_l2 = Σ(h × x²) + λ
//! delta   = soft_threshold(-grad_l2 / hess_l2, α / hess_l2) × eta
//! ```
//!
//! `shotgun` computes every feature's delta from the same gradients and applies
//! them together; `coord_descent` updates one feature at a time, refreshing the
//! gradients in between. Gradient sums are all-reduced across row-split workers.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use ndarray::Array2;
use rand::Rng;
use rand::seq::SliceRandom;

use super::{BoostEnv, GradientBooster, ImportanceType, PredictEnv};
use crate::collective::Communicator;
use crate::context::{DeviceOrd, GlobalRandom};
use crate::data::DMatrix;
use crate::error::{LearnerError, Result};
use crate::gradients::Gradients;
use crate::logger::TrainingLogger;
use crate::params::{ParamSet, parse_in_range, parse_positive, parse_value};
use crate::persist::{GbLinearModelSchema, GradientBoosterSchema};
use crate::utils::Parallelism;

// =============================================================================
// Parameters
// =============================================================================

/// Coordinate descent variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinearUpdaterKind {
    /// Parallel updates from shared gradients.
    #[default]
    Shotgun,
    /// Sequential updates with exact gradients.
    CoordDescent,
}

/// Order in which features are visited in one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeatureSelectorKind {
    #[default]
    Cyclic,
    /// Random permutation every round.
    Shuffle,
    /// Random features with replacement.
    Random,
}

macro_rules! string_enum {
    ($ty:ident, $key:literal, { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = LearnerError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(LearnerError::validation(format!(
                        concat!("invalid ", $key, " `{}`"),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self {
                    $(Self::$variant => $name,)+
                })
            }
        }
    };
}

string_enum!(LinearUpdaterKind, "updater", { "shotgun" => Shotgun, "coord_descent" => CoordDescent });
string_enum!(FeatureSelectorKind, "feature_selector", {
    "cyclic" => Cyclic,
    "shuffle" => Shuffle,
    "random" => Random,
});

/// Hyper-parameters of the linear updater.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearTrainParam {
    pub eta: f32,
    pub lambda: f32,
    pub alpha: f32,
    pub updater: LinearUpdaterKind,
    pub feature_selector: FeatureSelectorKind,
}

impl Default for LinearTrainParam {
    fn default() -> Self {
        Self {
            eta: 0.5,
            lambda: 0.0,
            alpha: 0.0,
            updater: LinearUpdaterKind::Shotgun,
            feature_selector: FeatureSelectorKind::Cyclic,
        }
    }
}

impl ParamSet for LinearTrainParam {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "eta" => self.eta = parse_positive(key, value)?,
            "lambda" => self.lambda = parse_in_range(key, value, 0.0, f32::INFINITY)?,
            "alpha" => self.alpha = parse_in_range(key, value, 0.0, f32::INFINITY)?,
            "updater" => self.updater = value.parse()?,
            "feature_selector" => self.feature_selector = value.parse()?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("alpha".to_string(), self.alpha.to_string()),
            ("eta".to_string(), self.eta.to_string()),
            ("feature_selector".to_string(), self.feature_selector.to_string()),
            ("lambda".to_string(), self.lambda.to_string()),
            ("updater".to_string(), self.updater.to_string()),
        ])
    }
}

// =============================================================================
// GbLinear
// =============================================================================

/// Generalised linear model boosted by coordinate descent.
#[derive(Debug, Clone, Default)]
pub struct GbLinear {
    pub param: LinearTrainParam,
    weights: Vec<f32>,
    num_feature: usize,
    num_group: usize,
    rounds: usize,
}

impl GbLinear {
    /// Weight of `feature` for `group`; `feature == num_feature` is the bias.
    pub fn weight(&self, feature: usize, group: usize) -> f32 {
        self.weights.get(feature * self.num_group + group).copied().unwrap_or(0.0)
    }

    pub fn bias(&self, group: usize) -> f32 {
        self.weight(self.num_feature, group)
    }

    fn ensure_shape(&mut self, num_feature: usize, num_group: usize) -> Result<()> {
        if self.weights.is_empty() {
            self.num_feature = num_feature;
            self.num_group = num_group;
            self.weights = vec![0.0; (num_feature + 1) * num_group];
            return Ok(());
        }
        if num_feature != self.num_feature || num_group != self.num_group {
            return Err(LearnerError::compatibility(format!(
                "gblinear model has {} features x {} groups, data needs {num_feature} x {num_group}",
                self.num_feature, self.num_group
            )));
        }
        Ok(())
    }

    fn feature_order(&self, rng: &GlobalRandom) -> Vec<usize> {
        let n = self.num_feature;
        match self.param.feature_selector {
            FeatureSelectorKind::Cyclic => (0..n).collect(),
            FeatureSelectorKind::Shuffle => {
                let mut order: Vec<usize> = (0..n).collect();
                rng.with(|r| order.shuffle(r));
                order
            }
            FeatureSelectorKind::Random if n == 0 => Vec::new(),
            FeatureSelectorKind::Random => rng.with(|r| (0..n).map(|_| r.gen_range(0..n)).collect()),
        }
    }

    /// Weight delta for `feature` given reduced sums `(Σgx, Σhx²)`.
    fn coordinate_delta(&self, current: f32, sum_grad: f64, sum_hess: f64) -> f32 {
        let lambda = self.param.lambda as f64;
        let grad_l2 = sum_grad + lambda * current as f64;
        let hess_l2 = sum_hess + lambda;
        if hess_l2.abs() < 1e-10 {
            return 0.0;
        }
        let raw = -grad_l2 / hess_l2;
        let threshold = self.param.alpha as f64 / hess_l2;
        (soft_threshold(raw, threshold) * self.param.eta as f64) as f32
    }

    fn update_bias(&mut self, group: usize, grads: &mut [f32], hess: &[f32], comm: &dyn Communicator) -> Result<()> {
        let mut sums = [0.0f64; 2];
        for (g, h) in grads.iter().zip(hess) {
            sums[0] += *g as f64;
            sums[1] += *h as f64;
        }
        comm.allreduce_sum(&mut sums)?;
        if sums[1].abs() <= 1e-10 {
            return Ok(());
        }
        let delta = (-sums[0] / sums[1]) as f32 * self.param.eta;
        self.weights[self.num_feature * self.num_group + group] += delta;
        for (g, h) in grads.iter_mut().zip(hess) {
            *g += h * delta;
        }
        Ok(())
    }

    fn feature_sums(data: &DMatrix, feature: usize, grads: &[f32], hess: &[f32]) -> (f64, f64) {
        let features = data.features();
        let column = features.column(feature);
        let mut sum_grad = 0.0f64;
        let mut sum_hess = 0.0f64;
        for (row, &x) in column.iter().enumerate() {
            if x.is_nan() {
                continue;
            }
            sum_grad += (grads[row] * x) as f64;
            sum_hess += (hess[row] * x * x) as f64;
        }
        (sum_grad, sum_hess)
    }

    fn apply_delta(data: &DMatrix, feature: usize, delta: f32, grads: &mut [f32], hess: &[f32]) {
        for (row, &x) in data.features().column(feature).iter().enumerate() {
            if !x.is_nan() {
                grads[row] += hess[row] * x * delta;
            }
        }
    }

    fn shotgun_round(
        &mut self,
        data: &DMatrix,
        group: usize,
        order: &[usize],
        grads: &mut [f32],
        hess: &[f32],
        env: &BoostEnv<'_>,
    ) -> Result<()> {
        let grads_ref: &[f32] = grads;
        let sums = env
            .parallelism
            .maybe_par_map(order.to_vec(), |f| Self::feature_sums(data, f, grads_ref, hess));
        let mut flat: Vec<f64> = sums.iter().flat_map(|&(g, h)| [g, h]).collect();
        env.comm.allreduce_sum(&mut flat)?;

        let ng = self.num_group;
        let deltas: Vec<(usize, f32)> = order
            .iter()
            .enumerate()
            .map(|(i, &f)| (f, self.coordinate_delta(self.weights[f * ng + group], flat[2 * i], flat[2 * i + 1])))
            .collect();
        for (feature, delta) in deltas {
            if delta.abs() > 1e-10 {
                self.weights[feature * ng + group] += delta;
                Self::apply_delta(data, feature, delta, grads, hess);
            }
        }
        Ok(())
    }

    fn coord_descent_round(
        &mut self,
        data: &DMatrix,
        group: usize,
        order: &[usize],
        grads: &mut [f32],
        hess: &[f32],
        comm: &dyn Communicator,
    ) -> Result<()> {
        let ng = self.num_group;
        for &feature in order {
            let (g, h) = Self::feature_sums(data, feature, grads, hess);
            let mut sums = [g, h];
            comm.allreduce_sum(&mut sums)?;
            let delta = self.coordinate_delta(self.weights[feature * ng + group], sums[0], sums[1]);
            if delta.abs() > 1e-10 {
                self.weights[feature * ng + group] += delta;
                Self::apply_delta(data, feature, delta, grads, hess);
            }
        }
        Ok(())
    }

    fn check_full_range(&self, layers: &Range<usize>) -> Result<()> {
        if !layers.is_empty() && *layers != (0..self.rounds) {
            return Err(LearnerError::validation("gblinear does not support slicing by iteration range"));
        }
        Ok(())
    }
}

#[inline]
fn soft_threshold(x: f64, threshold: f64) -> f64 {
    if x > threshold {
        x - threshold
    } else if x < -threshold {
        x + threshold
    } else {
        0.0
    }
}

impl ParamSet for GbLinear {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        self.param.apply(key, value)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        self.param.to_args()
    }
}

impl GradientBooster for GbLinear {
    fn name(&self) -> &'static str {
        "gblinear"
    }

    fn boosted_rounds(&self) -> usize {
        self.rounds
    }

    fn layer_additive(&self) -> bool {
        false
    }

    fn resolve_device(&self, requested: DeviceOrd, logger: &TrainingLogger) -> DeviceOrd {
        if requested.is_cuda() && self.param.updater != LinearUpdaterKind::CoordDescent {
            logger.warn(format!(
                "updater `{}` does not support {requested}, falling back to cpu",
                self.param.updater
            ));
            return DeviceOrd::Cpu;
        }
        requested
    }

    fn check_data_split(&self, data: &DMatrix, comm: &dyn Communicator) -> Result<()> {
        if comm.is_distributed() && data.is_column_split() {
            return Err(LearnerError::compatibility("gblinear does not support column-split data"));
        }
        Ok(())
    }

    fn do_boost(&mut self, data: &DMatrix, gradients: &Gradients, env: &BoostEnv<'_>) -> Result<()> {
        self.check_data_split(data, env.comm)?;
        self.ensure_shape(env.num_feature, env.num_group)?;
        if data.local_cols().end > self.num_feature || gradients.n_rows() != data.num_row() {
            return Err(LearnerError::data("gradients or features do not match the linear model"));
        }
        let n_local = data.features().ncols();
        for group in 0..self.num_group {
            let (g, h) = gradients.output(group);
            let mut grads = g.to_vec();
            let hess = h.to_vec();
            self.update_bias(group, &mut grads, &hess, env.comm)?;
            let order: Vec<usize> = self.feature_order(env.rng).into_iter().filter(|&f| f < n_local).collect();
            match self.param.updater {
                LinearUpdaterKind::Shotgun => self.shotgun_round(data, group, &order, &mut grads, &hess, env)?,
                LinearUpdaterKind::CoordDescent => {
                    self.coord_descent_round(data, group, &order, &mut grads, &hess, env.comm)?
                }
            }
        }
        self.rounds += 1;
        Ok(())
    }

    fn predict_margin(
        &self,
        data: &DMatrix,
        layers: Range<usize>,
        env: &PredictEnv<'_>,
        out: &mut Array2<f32>,
    ) -> Result<()> {
        self.check_full_range(&layers)?;
        self.check_data_split(data, env.comm)?;
        if layers.is_empty() || self.weights.is_empty() {
            return Ok(());
        }
        let features = data.features();
        let ng = self.num_group;
        let rows = env.parallelism.maybe_par_map(0..data.num_row(), |row| {
            let mut sums: Vec<f32> = (0..ng).map(|g| self.bias(g)).collect();
            for (f, &x) in features.row(row).iter().enumerate() {
                if x.is_nan() || f >= self.num_feature {
                    continue;
                }
                for (g, s) in sums.iter_mut().enumerate() {
                    *s += x * self.weights[f * ng + g];
                }
            }
            sums
        });
        for (row, sums) in rows.into_iter().enumerate() {
            for (group, s) in sums.into_iter().enumerate().take(out.nrows()) {
                out[[group, row]] += s;
            }
        }
        Ok(())
    }

    fn predict_leaf(&self, _data: &DMatrix, _layers: Range<usize>, _env: &PredictEnv<'_>) -> Result<Array2<f32>> {
        Err(LearnerError::validation("leaf prediction is not supported by gblinear"))
    }

    fn predict_contribution(
        &self,
        data: &DMatrix,
        layers: Range<usize>,
        env: &PredictEnv<'_>,
    ) -> Result<Array2<f32>> {
        self.check_full_range(&layers)?;
        self.check_data_split(data, env.comm)?;
        let width = env.num_feature + 1;
        let mut out = Array2::zeros((data.num_row(), env.num_group * width));
        if layers.is_empty() || self.weights.is_empty() {
            return Ok(out);
        }
        for (row, values) in data.features().rows().into_iter().enumerate() {
            for group in 0..self.num_group {
                for (f, &x) in values.iter().enumerate().take(self.num_feature) {
                    if !x.is_nan() {
                        out[[row, group * width + f]] = x * self.weight(f, group);
                    }
                }
                out[[row, group * width + env.num_feature]] = self.bias(group);
            }
        }
        Ok(out)
    }

    fn feature_score(&self, importance: ImportanceType) -> Result<Vec<(usize, f32)>> {
        if importance != ImportanceType::Weight {
            return Err(LearnerError::validation(format!(
                "gblinear only supports the `weight` importance type, got `{importance}`"
            )));
        }
        let mut scores = Vec::with_capacity(self.num_feature * self.num_group);
        for group in 0..self.num_group {
            for feature in 0..self.num_feature {
                scores.push((feature, self.weight(feature, group)));
            }
        }
        Ok(scores)
    }

    fn save_model(&self) -> GradientBoosterSchema {
        GradientBoosterSchema::GbLinear {
            model: GbLinearModelSchema { weights: self.weights.clone(), boosted_rounds: self.rounds.to_string() },
        }
    }

    fn load_model(&mut self, schema: GradientBoosterSchema, num_feature: usize, num_group: usize) -> Result<()> {
        let GradientBoosterSchema::GbLinear { model } = schema else {
            return Err(LearnerError::model("expected a gblinear model"));
        };
        let rounds: usize = parse_value("boosted_rounds", &model.boosted_rounds)?;
        let num_group = num_group.max(1);
        if !model.weights.is_empty() && model.weights.len() != (num_feature + 1) * num_group {
            return Err(LearnerError::model(format!(
                "gblinear model has {} weights, expected {}",
                model.weights.len(),
                (num_feature + 1) * num_group
            )));
        }
        self.num_feature = num_feature;
        self.num_group = num_group;
        self.weights = model.weights;
        self.rounds = rounds;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::collective::NoopCommunicator;

    fn boost(booster: &mut GbLinear, data: &DMatrix, labels: &[f32], rounds: usize) {
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
        for _ in 0..rounds {
            let mut margin = Array2::zeros((1, data.num_row()));
            booster.predict_margin(data, 0..booster.boosted_rounds(), &predict_env(), &mut margin).unwrap();
            let grads: Vec<f32> = margin.iter().zip(labels).map(|(p, y)| p - y).collect();
            let hess = vec![1.0; labels.len()];
            let gradients = Gradients::from_row_major(&grads, &hess, labels.len(), 1).unwrap();
            booster.do_boost(data, &gradients, &env).unwrap();
        }
    }

    fn predict_env() -> PredictEnv<'static> {
        PredictEnv { comm: &NoopCommunicator, parallelism: Parallelism::Sequential, num_feature: 1, num_group: 1 }
    }

    #[test]
    fn fits_a_line() {
        let data = DMatrix::new(array![[0.0], [1.0], [2.0], [3.0]]);
        let labels = [1.0, 3.0, 5.0, 7.0];
        for updater in ["shotgun", "coord_descent"] {
            let mut booster = GbLinear::default();
            booster.apply("updater", updater).unwrap();
            booster.apply("eta", "1.0").unwrap();
            boost(&mut booster, &data, &labels, 60);
            assert!((booster.weight(0, 0) - 2.0).abs() < 1e-2, "{updater}: {}", booster.weight(0, 0));
            assert!((booster.bias(0) - 1.0).abs() < 1e-2);
        }
    }

    #[test]
    fn l1_keeps_weights_at_zero() {
        let data = DMatrix::new(array![[0.0], [1.0], [0.0], [1.0]]);
        let mut booster = GbLinear::default();
        booster.apply("alpha", "100").unwrap();
        boost(&mut booster, &data, &[0.0, 0.1, 0.0, 0.1], 3);
        assert_eq!(booster.weight(0, 0), 0.0);
    }

    #[test]
    fn slicing_is_rejected() {
        let data = DMatrix::new(array![[0.0], [1.0]]);
        let mut booster = GbLinear::default();
        boost(&mut booster, &data, &[0.0, 1.0], 2);
        let mut out = Array2::zeros((1, 2));
        assert!(booster.predict_margin(&data, 0..1, &predict_env(), &mut out).is_err());
        assert!(booster.predict_leaf(&data, 0..2, &predict_env()).is_err());
    }

    #[test]
    fn device_support() {
        let logger = TrainingLogger::default();
        let mut booster = GbLinear::default();
        assert_eq!(booster.resolve_device(DeviceOrd::Cuda(0), &logger), DeviceOrd::Cpu);
        booster.apply("updater", "coord_descent").unwrap();
        assert_eq!(booster.resolve_device(DeviceOrd::Cuda(0), &logger), DeviceOrd::Cuda(0));
    }

    #[test]
    fn schema_round_trip() {
        let data = DMatrix::new(array![[0.0], [1.0]]);
        let mut booster = GbLinear::default();
        boost(&mut booster, &data, &[0.0, 1.0], 2);
        let mut loaded = GbLinear::default();
        loaded.load_model(booster.save_model(), 1, 1).unwrap();
        assert_eq!(loaded.boosted_rounds(), 2);
        assert_eq!(loaded.weight(0, 0), booster.weight(0, 0));
        assert!(loaded.load_model(booster.save_model(), 3, 1).is_err());
    }
}
