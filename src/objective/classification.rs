//! Binary and multiclass classification objectives.

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView2};

use super::{DEFAULT_BASE_SCORE, ObjectiveFn, check_shapes, finish_weighted_means, sigmoid};
use crate::data::MetaInfo;
use crate::error::{LearnerError, Result};
use crate::gradients::Gradients;
use crate::params::{ParamSet, parse_positive, parse_value};

const PROB_EPS: f32 = 1e-6;
const MIN_HESS: f32 = 1e-16;

// =============================================================================
// Logistic
// =============================================================================

/// Flavour of logistic objective; they share gradients and differ in output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogisticKind {
    /// `reg:logistic`: probabilities, evaluated with rmse.
    Regression,
    /// `binary:logistic`: probabilities, evaluated with logloss.
    Binary,
    /// `binary:logitraw`: raw margins, evaluated with auc.
    Raw,
}

/// Logistic loss on labels in `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct Logistic {
    pub kind: LogisticKind,
    /// Weight multiplier for positive labels.
    pub scale_pos_weight: f32,
}

impl Logistic {
    pub fn new(kind: LogisticKind) -> Self {
        Self { kind, scale_pos_weight: 1.0 }
    }
}

impl ParamSet for Logistic {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        if key != "scale_pos_weight" {
            return Ok(false);
        }
        self.scale_pos_weight = parse_positive(key, value)?;
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("scale_pos_weight".to_string(), self.scale_pos_weight.to_string())])
    }
}

impl ObjectiveFn for Logistic {
    fn name(&self) -> &'static str {
        match self.kind {
            LogisticKind::Regression => "reg:logistic",
            LogisticKind::Binary => "binary:logistic",
            LogisticKind::Raw => "binary:logitraw",
        }
    }

    fn validate_labels(&self, info: &MetaInfo) -> Result<()> {
        if info.labels.iter().any(|&y| !(0.0..=1.0).contains(&y)) {
            return Err(LearnerError::data("label must be in [0, 1] for logistic regression"));
        }
        Ok(())
    }

    fn gradients(&self, margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &mut Gradients) -> Result<()> {
        check_shapes(margins, info, out)?;
        let weights = info.row_weights();
        let preds = margins.row(0);
        let (grads, hess) = out.output_mut(0);
        for row in 0..info.num_row {
            let y = info.labels[[row, 0]];
            let mut w = if weights.is_empty() { 1.0 } else { weights[row] };
            if y == 1.0 {
                w *= self.scale_pos_weight;
            }
            let p = sigmoid(preds[row]);
            grads[row] = (p - y) * w;
            hess[row] = (p * (1.0 - p)).max(MIN_HESS) * w;
        }
        Ok(())
    }

    fn estimation_stats(&self, info: &MetaInfo, _n_groups: usize) -> Option<Vec<f64>> {
        let weights = info.row_weights();
        let mut stats = vec![0.0f64; 2];
        for row in 0..info.num_row {
            let w = if weights.is_empty() { 1.0 } else { weights[row] as f64 };
            stats[0] += w * info.labels[[row, 0]] as f64;
            stats[1] += w;
        }
        Some(stats)
    }

    fn finish_estimation(&self, stats: &[f64], _n_groups: usize) -> Vec<f32> {
        finish_weighted_means(stats, 1)
            .into_iter()
            .map(|p| p.clamp(PROB_EPS, 1.0 - PROB_EPS))
            .collect()
    }

    fn check_base_score(&self, base_score: f32) -> Result<()> {
        if self.kind != LogisticKind::Raw && !(base_score > 0.0 && base_score < 1.0) {
            return Err(LearnerError::validation(format!(
                "base_score must be in (0, 1) for `{}`, got {base_score}",
                self.name()
            )));
        }
        Ok(())
    }

    fn prob_to_margin(&self, base_score: f32) -> f32 {
        let p = base_score.clamp(PROB_EPS, 1.0 - PROB_EPS);
        (p / (1.0 - p)).ln()
    }

    fn pred_transform(&self, mut margins: Array2<f32>) -> Array2<f32> {
        if self.kind != LogisticKind::Raw {
            margins.mapv_inplace(sigmoid);
        }
        margins
    }

    fn default_metric(&self) -> &'static str {
        match self.kind {
            LogisticKind::Regression => "rmse",
            LogisticKind::Binary => "logloss",
            LogisticKind::Raw => "auc",
        }
    }
}

// =============================================================================
// Softmax
// =============================================================================

/// Multiclass softmax over `num_class` output groups.
///
/// Labels are class indices in a single column.
#[derive(Debug, Clone, Copy)]
pub struct Softmax {
    pub num_class: usize,
    /// `multi:softprob` outputs probabilities, `multi:softmax` the class index.
    pub output_prob: bool,
}

impl Softmax {
    pub fn new(output_prob: bool) -> Self {
        Self { num_class: 0, output_prob }
    }

    fn softmax_columns(margins: &mut Array2<f32>) {
        for mut column in margins.columns_mut() {
            let max = column.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            column.mapv_inplace(|m| (m - max).exp());
            let sum: f32 = column.sum();
            column.mapv_inplace(|e| e / sum);
        }
    }
}

impl ParamSet for Softmax {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        if key != "num_class" {
            return Ok(false);
        }
        self.num_class = parse_value(key, value)?;
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("num_class".to_string(), self.num_class.to_string())])
    }
}

impl ObjectiveFn for Softmax {
    fn name(&self) -> &'static str {
        if self.output_prob { "multi:softprob" } else { "multi:softmax" }
    }

    fn num_groups(&self, _num_target: usize) -> usize {
        self.num_class.max(1)
    }

    fn check_targets(&self, num_target: usize) -> Result<()> {
        if self.num_class < 1 {
            return Err(LearnerError::validation(format!("`num_class` must be set for `{}`", self.name())));
        }
        if num_target > 1 {
            return Err(LearnerError::compatibility(format!(
                "objective `{}` does not support multiple targets, labels have {num_target} columns",
                self.name()
            )));
        }
        Ok(())
    }

    fn validate_labels(&self, info: &MetaInfo) -> Result<()> {
        let k = self.num_class as f32;
        if info.labels.iter().any(|&y| !(y >= 0.0 && y < k && y.fract() == 0.0)) {
            return Err(LearnerError::data(format!(
                "labels must be class indices in [0, {})",
                self.num_class
            )));
        }
        Ok(())
    }

    fn gradients(&self, margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &mut Gradients) -> Result<()> {
        check_shapes(margins, info, out)?;
        let mut probs = margins.to_owned();
        Self::softmax_columns(&mut probs);
        let weights = info.row_weights();
        for row in 0..info.num_row {
            let label = info.labels[[row, 0]] as usize;
            let w = if weights.is_empty() { 1.0 } else { weights[row] };
            for class in 0..probs.nrows() {
                let p = probs[[class, row]];
                let target = if class == label { 1.0 } else { 0.0 };
                out.set(row, class, (p - target) * w, (2.0 * p * (1.0 - p)).max(MIN_HESS) * w);
            }
        }
        Ok(())
    }

    /// Weighted class counts followed by the total weight.
    fn estimation_stats(&self, info: &MetaInfo, n_groups: usize) -> Option<Vec<f64>> {
        let weights = info.row_weights();
        let mut stats = vec![0.0f64; n_groups + 1];
        for row in 0..info.num_row {
            let w = if weights.is_empty() { 1.0 } else { weights[row] as f64 };
            let label = info.labels[[row, 0]] as usize;
            if label < n_groups {
                stats[label] += w;
            }
            stats[n_groups] += w;
        }
        Some(stats)
    }

    fn finish_estimation(&self, stats: &[f64], n_groups: usize) -> Vec<f32> {
        if stats.get(n_groups).copied().unwrap_or(0.0) <= 0.0 {
            return vec![DEFAULT_BASE_SCORE; n_groups];
        }
        finish_weighted_means(stats, n_groups)
            .into_iter()
            .map(|p| p.clamp(PROB_EPS, 1.0 - PROB_EPS))
            .collect()
    }

    fn prob_to_margin(&self, base_score: f32) -> f32 {
        base_score.clamp(PROB_EPS, 1.0).ln()
    }

    fn pred_transform(&self, mut margins: Array2<f32>) -> Array2<f32> {
        if self.output_prob {
            Self::softmax_columns(&mut margins);
            return margins;
        }
        let n_rows = margins.ncols();
        let mut classes = Array2::zeros((1, n_rows));
        for (row, column) in margins.columns().into_iter().enumerate() {
            let mut best = 0;
            for (class, &m) in column.iter().enumerate() {
                if m > column[best] {
                    best = class;
                }
            }
            classes[[0, row]] = best as f32;
        }
        classes
    }

    fn eval_transform(&self, mut margins: Array2<f32>) -> Array2<f32> {
        Self::softmax_columns(&mut margins);
        margins
    }

    fn default_metric(&self) -> &'static str {
        "mlogloss"
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    fn info(labels: Array2<f32>) -> MetaInfo {
        let mut info = MetaInfo::new(labels.nrows(), 1);
        info.labels = labels;
        info
    }

    #[test]
    fn logistic_base_score_round_trips_through_margin() {
        let obj = Logistic::new(LogisticKind::Binary);
        let info = info(array![[1.0], [0.0], [1.0], [1.0]]);
        let stats = obj.estimation_stats(&info, 1).unwrap();
        let base = obj.finish_estimation(&stats, 1);
        assert_abs_diff_eq!(base[0], 0.75);
        assert_abs_diff_eq!(sigmoid(obj.prob_to_margin(base[0])), 0.75, epsilon = 1e-6);
    }

    #[test]
    fn logistic_rejects_labels_outside_unit_interval() {
        let obj = Logistic::new(LogisticKind::Regression);
        assert!(obj.validate_labels(&info(array![[2.0]])).is_err());
    }

    #[test]
    fn logitraw_keeps_margins() {
        let obj = Logistic::new(LogisticKind::Raw);
        let out = obj.pred_transform(array![[2.0, -1.0]]);
        assert_eq!(out, array![[2.0, -1.0]]);
    }

    #[test]
    fn softmax_outputs_class_index() {
        let obj = Softmax { num_class: 3, output_prob: false };
        let margins = array![[0.0, 5.0], [1.0, 0.0], [0.5, 0.0]];
        assert_eq!(obj.pred_transform(margins.clone()), array![[1.0, 0.0]]);

        let probs = Softmax { num_class: 3, output_prob: true }.pred_transform(margins);
        for column in probs.columns() {
            assert_abs_diff_eq!(column.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn softmax_priors_map_back_to_probabilities() {
        let obj = Softmax { num_class: 3, output_prob: true };
        let info = info(array![[0.0], [1.0], [1.0], [2.0]]);
        let base = obj.finish_estimation(&obj.estimation_stats(&info, 3).unwrap(), 3);
        assert_abs_diff_eq!(base[1], 0.5);

        let margins = Array2::from_shape_fn((3, 1), |(g, _)| obj.prob_to_margin(base[g]));
        let probs = obj.pred_transform(margins);
        assert_abs_diff_eq!(probs[[0, 0]], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(probs[[1, 0]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn softmax_requires_num_class() {
        let obj = Softmax::new(true);
        assert!(matches!(obj.check_targets(1), Err(LearnerError::Validation(_))));
    }
}
