//! Regression objectives.
//!
//! All of them except Poisson support multiple targets, training one output group
//! per label column.

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView2};

use super::{DEFAULT_BASE_SCORE, ObjectiveFn, check_shapes, finish_weighted_means};
use crate::data::MetaInfo;
use crate::error::{LearnerError, Result};
use crate::gradients::Gradients;
use crate::params::{ParamSet, parse_in_range, parse_positive, parse_value};
use crate::utils::weighted_quantile;

const EPS: f32 = 1e-6;

/// Fill `out` with `f(margin, label, weight) -> (grad, hess)` for each group.
fn elementwise_gradients(
    margins: ArrayView2<'_, f32>,
    info: &MetaInfo,
    out: &mut Gradients,
    f: impl Fn(f32, f32, f32) -> (f32, f32),
) -> Result<()> {
    check_shapes(margins, info, out)?;
    let weights = info.row_weights();
    let n_targets = info.num_target();
    for group in 0..margins.nrows() {
        let target = group.min(n_targets - 1);
        let preds = margins.row(group);
        let (grads, hess) = out.output_mut(group);
        for row in 0..info.num_row {
            let w = if weights.is_empty() { 1.0 } else { weights[row] };
            let (g, h) = f(preds[row], info.labels[[row, target]], w);
            grads[row] = g;
            hess[row] = h;
        }
    }
    Ok(())
}

/// Weighted sums per label column followed by the total weight.
fn weighted_label_sums(info: &MetaInfo, n_groups: usize) -> Vec<f64> {
    let weights = info.row_weights();
    let mut stats = vec![0.0f64; n_groups + 1];
    for row in 0..info.num_row {
        let w = if weights.is_empty() { 1.0 } else { weights[row] as f64 };
        for (g, stat) in stats.iter_mut().take(n_groups).enumerate() {
            *stat += w * info.labels[[row, g.min(info.num_target() - 1)]] as f64;
        }
        stats[n_groups] += w;
    }
    stats
}

/// Weighted `alpha`-quantile of every label column, scaled by the local weight so
/// that row-split workers can average them.
fn weighted_label_quantiles(info: &MetaInfo, n_groups: usize, alpha: f32) -> Vec<f64> {
    let weights = info.row_weights();
    let wsum: f64 = if weights.is_empty() {
        info.num_row as f64
    } else {
        weights.iter().map(|&w| w as f64).sum()
    };
    let mut scratch = Vec::new();
    let mut stats: Vec<f64> = (0..n_groups)
        .map(|g| {
            let column: Vec<f32> = info.labels.column(g.min(info.num_target() - 1)).to_vec();
            let q = weighted_quantile(&column, &weights, alpha, &mut scratch);
            if q.is_nan() { 0.0 } else { q as f64 * wsum }
        })
        .collect();
    stats.push(wsum);
    stats
}

// =============================================================================
// Squared Error
// =============================================================================

/// Squared error: gradient `w * (pred - y)`, hessian `w`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredError;

impl ParamSet for SquaredError {
    fn apply(&mut self, _key: &str, _value: &str) -> Result<bool> {
        Ok(false)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

impl ObjectiveFn for SquaredError {
    fn name(&self) -> &'static str {
        "reg:squarederror"
    }

    fn check_targets(&self, _num_target: usize) -> Result<()> {
        Ok(())
    }

    fn gradients(&self, margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &mut Gradients) -> Result<()> {
        elementwise_gradients(margins, info, out, |p, y, w| (w * (p - y), w))
    }

    fn estimation_stats(&self, info: &MetaInfo, n_groups: usize) -> Option<Vec<f64>> {
        Some(weighted_label_sums(info, n_groups))
    }

    fn finish_estimation(&self, stats: &[f64], n_groups: usize) -> Vec<f32> {
        finish_weighted_means(stats, n_groups)
    }

    fn default_metric(&self) -> &'static str {
        "rmse"
    }
}

// =============================================================================
// Absolute Error
// =============================================================================

/// Absolute error; the base score is the weighted median.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsoluteError;

impl ParamSet for AbsoluteError {
    fn apply(&mut self, _key: &str, _value: &str) -> Result<bool> {
        Ok(false)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

impl ObjectiveFn for AbsoluteError {
    fn name(&self) -> &'static str {
        "reg:absoluteerror"
    }

    fn check_targets(&self, _num_target: usize) -> Result<()> {
        Ok(())
    }

    fn gradients(&self, margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &mut Gradients) -> Result<()> {
        elementwise_gradients(margins, info, out, |p, y, w| {
            let diff = p - y;
            let sign = if diff > 0.0 { 1.0 } else if diff < 0.0 { -1.0 } else { 0.0 };
            (w * sign, w)
        })
    }

    fn estimation_stats(&self, info: &MetaInfo, n_groups: usize) -> Option<Vec<f64>> {
        Some(weighted_label_quantiles(info, n_groups, 0.5))
    }

    fn finish_estimation(&self, stats: &[f64], n_groups: usize) -> Vec<f32> {
        finish_weighted_means(stats, n_groups)
    }

    fn default_metric(&self) -> &'static str {
        "mae"
    }
}

// =============================================================================
// Quantile Error
// =============================================================================

/// Pinball loss for the `quantile_alpha` quantile.
#[derive(Debug, Clone, Copy)]
pub struct QuantileError {
    pub alpha: f32,
}

impl Default for QuantileError {
    fn default() -> Self {
        Self { alpha: 0.5 }
    }
}

impl ParamSet for QuantileError {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        if key != "quantile_alpha" {
            return Ok(false);
        }
        let alpha = parse_in_range(key, value, 0.0, 1.0)?;
        if alpha == 0.0 || alpha == 1.0 {
            return Err(LearnerError::validation("quantile_alpha must be strictly between 0 and 1"));
        }
        self.alpha = alpha;
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("quantile_alpha".to_string(), self.alpha.to_string())])
    }
}

impl ObjectiveFn for QuantileError {
    fn name(&self) -> &'static str {
        "reg:quantileerror"
    }

    fn check_targets(&self, _num_target: usize) -> Result<()> {
        Ok(())
    }

    fn gradients(&self, margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &mut Gradients) -> Result<()> {
        let alpha = self.alpha;
        elementwise_gradients(margins, info, out, |p, y, w| {
            let g = if p >= y { 1.0 - alpha } else { -alpha };
            (w * g, w)
        })
    }

    fn estimation_stats(&self, info: &MetaInfo, n_groups: usize) -> Option<Vec<f64>> {
        Some(weighted_label_quantiles(info, n_groups, self.alpha))
    }

    fn finish_estimation(&self, stats: &[f64], n_groups: usize) -> Vec<f32> {
        finish_weighted_means(stats, n_groups)
    }

    fn default_metric(&self) -> &'static str {
        "mae"
    }
}

// =============================================================================
// Pseudo-Huber Error
// =============================================================================

/// Pseudo-Huber loss with slope `huber_slope`.
#[derive(Debug, Clone, Copy)]
pub struct PseudoHuberError {
    pub slope: f32,
}

impl Default for PseudoHuberError {
    fn default() -> Self {
        Self { slope: 1.0 }
    }
}

impl PseudoHuberError {
    #[inline]
    fn grad_hess(&self, p: f32, y: f32, w: f32) -> (f32, f32) {
        let z = p - y;
        let scale = 1.0 + (z / self.slope).powi(2);
        let scale_sqrt = scale.sqrt();
        (w * z / scale_sqrt, w / (scale * scale_sqrt))
    }
}

impl ParamSet for PseudoHuberError {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        if key != "huber_slope" {
            return Ok(false);
        }
        self.slope = parse_positive(key, value)?;
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("huber_slope".to_string(), self.slope.to_string())])
    }
}

impl ObjectiveFn for PseudoHuberError {
    fn name(&self) -> &'static str {
        "reg:pseudohubererror"
    }

    fn check_targets(&self, _num_target: usize) -> Result<()> {
        Ok(())
    }

    fn gradients(&self, margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &mut Gradients) -> Result<()> {
        elementwise_gradients(margins, info, out, |p, y, w| self.grad_hess(p, y, w))
    }

    /// One Newton step from a zero margin: `[sum_grad..., sum_hess...]`.
    fn estimation_stats(&self, info: &MetaInfo, n_groups: usize) -> Option<Vec<f64>> {
        let weights = info.row_weights();
        let mut stats = vec![0.0f64; 2 * n_groups];
        for row in 0..info.num_row {
            let w = if weights.is_empty() { 1.0 } else { weights[row] };
            for g in 0..n_groups {
                let y = info.labels[[row, g.min(info.num_target() - 1)]];
                let (grad, hess) = self.grad_hess(0.0, y, w);
                stats[g] += grad as f64;
                stats[n_groups + g] += hess as f64;
            }
        }
        Some(stats)
    }

    fn finish_estimation(&self, stats: &[f64], n_groups: usize) -> Vec<f32> {
        (0..n_groups)
            .map(|g| {
                let hess = stats[n_groups + g];
                if hess > 0.0 { (-stats[g] / hess) as f32 } else { DEFAULT_BASE_SCORE }
            })
            .collect()
    }

    fn default_metric(&self) -> &'static str {
        "mphe"
    }
}

// =============================================================================
// Poisson Regression
// =============================================================================

/// Poisson regression on a log link.
#[derive(Debug, Clone, Copy)]
pub struct PoissonRegression {
    pub max_delta_step: f32,
}

impl Default for PoissonRegression {
    fn default() -> Self {
        Self { max_delta_step: 0.7 }
    }
}

impl ParamSet for PoissonRegression {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        if key != "max_delta_step" {
            return Ok(false);
        }
        let v: f32 = parse_value(key, value)?;
        if v < 0.0 {
            return Err(LearnerError::validation("max_delta_step must be non-negative"));
        }
        self.max_delta_step = v;
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("max_delta_step".to_string(), self.max_delta_step.to_string())])
    }
}

impl ObjectiveFn for PoissonRegression {
    fn name(&self) -> &'static str {
        "count:poisson"
    }

    fn validate_labels(&self, info: &MetaInfo) -> Result<()> {
        if info.labels.iter().any(|&y| !(y >= 0.0)) {
            return Err(LearnerError::data("poisson regression requires non-negative labels"));
        }
        Ok(())
    }

    fn gradients(&self, margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &mut Gradients) -> Result<()> {
        let step = self.max_delta_step;
        elementwise_gradients(margins, info, out, |p, y, w| {
            ((p.exp() - y) * w, (p + step).exp() * w)
        })
    }

    fn estimation_stats(&self, info: &MetaInfo, n_groups: usize) -> Option<Vec<f64>> {
        Some(weighted_label_sums(info, n_groups))
    }

    fn finish_estimation(&self, stats: &[f64], n_groups: usize) -> Vec<f32> {
        finish_weighted_means(stats, n_groups).into_iter().map(|v| v.max(EPS)).collect()
    }

    fn check_base_score(&self, base_score: f32) -> Result<()> {
        if !(base_score > 0.0) {
            return Err(LearnerError::validation(format!(
                "base_score must be positive for `count:poisson`, got {base_score}"
            )));
        }
        Ok(())
    }

    fn prob_to_margin(&self, base_score: f32) -> f32 {
        base_score.ln()
    }

    fn pred_transform(&self, mut margins: Array2<f32>) -> Array2<f32> {
        margins.mapv_inplace(f32::exp);
        margins
    }

    fn default_metric(&self) -> &'static str {
        "poisson-nloglik"
    }
}
