//! Classification metrics.
//!
//! Binary metrics read probabilities from the first output group. Multiclass
//! metrics read one probability per class and integer class labels.

use ndarray::ArrayView2;

use super::{MetricFn, MetricPartial, check_inputs};
use crate::data::MetaInfo;
use crate::error::Result;

const EPS: f64 = 1e-16;

// =============================================================================
// LogLoss
// =============================================================================

/// Binary cross-entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLoss;

impl MetricFn for LogLoss {
    fn name(&self) -> String {
        "logloss".into()
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        check_inputs(predictions, info)?;
        let mut partial = MetricPartial::default();
        for (row, &p) in predictions.row(0).iter().enumerate() {
            let w = info.row_weight(row) as f64;
            let y = info.labels[[row, 0]] as f64;
            let p = (p as f64).clamp(EPS, 1.0 - EPS);
            partial.sum -= w * (y * p.ln() + (1.0 - y) * (1.0 - p).ln());
            partial.weight += w;
        }
        Ok(partial)
    }
}

// =============================================================================
// Error
// =============================================================================

/// Binary error rate: a prediction above `threshold` counts as positive.
#[derive(Debug, Clone, Copy)]
pub struct BinaryError {
    pub threshold: f32,
}

impl Default for BinaryError {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl MetricFn for BinaryError {
    fn name(&self) -> String {
        if self.threshold == 0.5 { "error".into() } else { format!("error@{}", self.threshold) }
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        check_inputs(predictions, info)?;
        let mut partial = MetricPartial::default();
        for (row, &p) in predictions.row(0).iter().enumerate() {
            let w = info.row_weight(row) as f64;
            let positive = info.labels[[row, 0]] > 0.5;
            if (p > self.threshold) != positive {
                partial.sum += w;
            }
            partial.weight += w;
        }
        Ok(partial)
    }
}

// =============================================================================
// AUC
// =============================================================================

/// Area under the ROC curve.
///
/// Multiclass predictions are scored one-vs-rest and averaged by class weight.
/// The partial carries `auc * weight`, so row-split workers combine as a
/// weighted average of their local AUCs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Auc;

impl MetricFn for Auc {
    fn name(&self) -> String {
        "auc".into()
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        check_inputs(predictions, info)?;
        let weights: Vec<f32> = (0..info.num_row).map(|r| info.row_weight(r)).collect();
        let total: f64 = weights.iter().map(|&w| w as f64).sum();

        let auc = if predictions.nrows() == 1 {
            let preds = predictions.row(0).to_vec();
            let labels: Vec<f32> = info.labels.column(0).to_vec();
            compute_auc_weighted(&preds, &labels, &weights)
        } else {
            let mut acc = 0.0;
            let mut class_total = 0.0;
            for (class, preds) in predictions.rows().into_iter().enumerate() {
                let labels: Vec<f32> = info
                    .labels
                    .column(0)
                    .iter()
                    .map(|&y| if y as usize == class { 1.0 } else { 0.0 })
                    .collect();
                let class_weight: f64 = labels
                    .iter()
                    .zip(&weights)
                    .filter(|(y, _)| **y > 0.5)
                    .map(|(_, &w)| w as f64)
                    .sum();
                acc += class_weight * compute_auc_weighted(&preds.to_vec(), &labels, &weights);
                class_total += class_weight;
            }
            if class_total > 0.0 { acc / class_total } else { 0.5 }
        };
        Ok(MetricPartial::new(auc * total, total))
    }

    fn higher_is_better(&self) -> bool {
        true
    }
}

/// Weighted AUC: weighted concordant pairs over `sum_pos * sum_neg`, ties count half.
fn compute_auc_weighted(predictions: &[f32], labels: &[f32], weights: &[f32]) -> f64 {
    let n = predictions.len();
    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| predictions[a].total_cmp(&predictions[b]));

    let (sum_pos, sum_neg) = labels
        .iter()
        .zip(weights.iter())
        .fold((0.0f64, 0.0f64), |(sp, sn), (&l, &w)| {
            if l > 0.5 { (sp + w as f64, sn) } else { (sp, sn + w as f64) }
        });
    if sum_pos == 0.0 || sum_neg == 0.0 {
        return 0.5;
    }

    let mut weighted_concordant = 0.0f64;
    let mut cumulative_neg_weight = 0.0f64;
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && (predictions[indices[i]] - predictions[indices[j]]).abs() < 1e-10 {
            j += 1;
        }
        let mut group_pos_weight = 0.0f64;
        let mut group_neg_weight = 0.0f64;
        for &idx in &indices[i..j] {
            if labels[idx] > 0.5 {
                group_pos_weight += weights[idx] as f64;
            } else {
                group_neg_weight += weights[idx] as f64;
            }
        }
        weighted_concordant += group_pos_weight * (cumulative_neg_weight + 0.5 * group_neg_weight);
        cumulative_neg_weight += group_neg_weight;
        i = j;
    }

    weighted_concordant / (sum_pos * sum_neg)
}

// =============================================================================
// Multiclass
// =============================================================================

/// Multiclass cross-entropy over class probabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiLogLoss;

impl MetricFn for MultiLogLoss {
    fn name(&self) -> String {
        "mlogloss".into()
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        check_inputs(predictions, info)?;
        let mut partial = MetricPartial::default();
        for (row, column) in predictions.columns().into_iter().enumerate() {
            let w = info.row_weight(row) as f64;
            let label = info.labels[[row, 0]] as usize;
            let p = column.get(label).copied().unwrap_or(0.0) as f64;
            partial.sum -= w * p.max(EPS).ln();
            partial.weight += w;
        }
        Ok(partial)
    }
}

/// Multiclass error rate of the arg-max class.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiError;

impl MetricFn for MultiError {
    fn name(&self) -> String {
        "merror".into()
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        check_inputs(predictions, info)?;
        let mut partial = MetricPartial::default();
        for (row, column) in predictions.columns().into_iter().enumerate() {
            let w = info.row_weight(row) as f64;
            let mut best = 0;
            for (class, &p) in column.iter().enumerate() {
                if p > column[best] {
                    best = class;
                }
            }
            if best != info.labels[[row, 0]] as usize {
                partial.sum += w;
            }
            partial.weight += w;
        }
        Ok(partial)
    }
}
