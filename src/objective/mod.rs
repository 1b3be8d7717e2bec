//! Objective (loss) functions.
//!
//! Objectives compute gradients and hessians for the booster, estimate the initial
//! base score from label statistics, and map between output space and margin space.
//!
//! # Layout
//!
//! Margins and transformed predictions are `[n_groups, n_rows]` arrays: each output
//! group is a contiguous row. Labels come from [`MetaInfo`] as `(n_rows, n_targets)`.
//!
//! # Registry
//!
//! [`create`] maps an objective name such as `binary:logistic` to an [`Objective`],
//! a tagged enum that implements [`ObjectiveFn`] by delegating to the concrete loss.

mod classification;
mod ranking;
mod regression;

pub use classification::{Logistic, LogisticKind, Softmax};
pub use ranking::PairwiseRank;
pub use regression::{AbsoluteError, PoissonRegression, PseudoHuberError, QuantileError, SquaredError};

use std::collections::BTreeMap;
use std::fmt::Debug;

use ndarray::{Array2, ArrayView2};

use crate::data::MetaInfo;
use crate::error::{LearnerError, Result};
use crate::gradients::Gradients;
use crate::params::ParamSet;

/// Base score used before any estimation, in output space.
pub const DEFAULT_BASE_SCORE: f32 = 0.5;

/// Objective used when none is configured.
pub const DEFAULT_OBJECTIVE: &str = "reg:squarederror";

// =============================================================================
// Objective Trait
// =============================================================================

/// A training objective.
///
/// Parameters are applied through the [`ParamSet`] supertrait and persisted with
/// the model.
pub trait ObjectiveFn: ParamSet + Send + Sync + Debug {
    /// Registry name, e.g. `reg:squarederror`.
    fn name(&self) -> &'static str;

    /// Number of output groups for labels with `num_target` columns.
    fn num_groups(&self, num_target: usize) -> usize {
        num_target.max(1)
    }

    /// Reject label shapes the objective cannot train on.
    fn check_targets(&self, num_target: usize) -> Result<()> {
        if num_target > 1 {
            return Err(LearnerError::compatibility(format!(
                "objective `{}` does not support multiple targets, labels have {num_target} columns",
                self.name()
            )));
        }
        Ok(())
    }

    /// Reject label values outside the objective's domain.
    fn validate_labels(&self, _info: &MetaInfo) -> Result<()> {
        Ok(())
    }

    /// Compute gradients of `margins` (`[n_groups, n_rows]`) into `out`.
    fn gradients(&self, margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &mut Gradients) -> Result<()>;

    /// Local sufficient statistics for the base score.
    ///
    /// Statistics are additive across row-split workers. `None` means the
    /// objective keeps the default base score.
    fn estimation_stats(&self, info: &MetaInfo, n_groups: usize) -> Option<Vec<f64>>;

    /// Base score in output space from (possibly reduced) statistics.
    fn finish_estimation(&self, stats: &[f64], n_groups: usize) -> Vec<f32>;

    /// Reject a user-supplied base score outside the output domain.
    fn check_base_score(&self, _base_score: f32) -> Result<()> {
        Ok(())
    }

    /// Map a base score from output space to margin space.
    fn prob_to_margin(&self, base_score: f32) -> f32 {
        base_score
    }

    /// Transform margins to predictions. May change the number of rows of the
    /// output (e.g. class indices).
    fn pred_transform(&self, margins: Array2<f32>) -> Array2<f32> {
        margins
    }

    /// Transform margins for metric evaluation.
    fn eval_transform(&self, margins: Array2<f32>) -> Array2<f32> {
        self.pred_transform(margins)
    }

    /// Metric used when no `eval_metric` is configured.
    fn default_metric(&self) -> &'static str;
}

// =============================================================================
// Objective Enum
// =============================================================================

/// Objective selected by name.
#[derive(Debug, Clone)]
pub enum Objective {
    SquaredError(SquaredError),
    AbsoluteError(AbsoluteError),
    PseudoHuberError(PseudoHuberError),
    QuantileError(QuantileError),
    Poisson(PoissonRegression),
    Logistic(Logistic),
    Softmax(Softmax),
    PairwiseRank(PairwiseRank),
}

/// Names accepted by [`create`].
pub const OBJECTIVE_NAMES: [&str; 11] = [
    "reg:squarederror",
    "reg:absoluteerror",
    "reg:pseudohubererror",
    "reg:quantileerror",
    "reg:logistic",
    "binary:logistic",
    "binary:logitraw",
    "count:poisson",
    "multi:softmax",
    "multi:softprob",
    "rank:pairwise",
];

/// Create an objective with default parameters from its registry name.
pub fn create(name: &str) -> Result<Objective> {
    let objective = match name {
        "reg:squarederror" => Objective::SquaredError(SquaredError),
        "reg:linear" => {
            tracing::warn!("reg:linear is deprecated, use reg:squarederror instead");
            Objective::SquaredError(SquaredError)
        }
        "reg:absoluteerror" => Objective::AbsoluteError(AbsoluteError),
        "reg:pseudohubererror" => Objective::PseudoHuberError(PseudoHuberError::default()),
        "reg:quantileerror" => Objective::QuantileError(QuantileError::default()),
        "count:poisson" => Objective::Poisson(PoissonRegression::default()),
        "reg:logistic" => Objective::Logistic(Logistic::new(LogisticKind::Regression)),
        "binary:logistic" => Objective::Logistic(Logistic::new(LogisticKind::Binary)),
        "binary:logitraw" => Objective::Logistic(Logistic::new(LogisticKind::Raw)),
        "multi:softmax" => Objective::Softmax(Softmax::new(false)),
        "multi:softprob" => Objective::Softmax(Softmax::new(true)),
        "rank:pairwise" => Objective::PairwiseRank(PairwiseRank),
        other => {
            return Err(LearnerError::validation(format!(
                "unknown objective function: `{other}`, expected one of {OBJECTIVE_NAMES:?}"
            )));
        }
    };
    Ok(objective)
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Objective::SquaredError($inner) => $body,
            Objective::AbsoluteError($inner) => $body,
            Objective::PseudoHuberError($inner) => $body,
            Objective::QuantileError($inner) => $body,
            Objective::Poisson($inner) => $body,
            Objective::Logistic($inner) => $body,
            Objective::Softmax($inner) => $body,
            Objective::PairwiseRank($inner) => $body,
        }
    };
}

impl ParamSet for Objective {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        delegate!(self, inner => inner.apply(key, value))
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        delegate!(self, inner => inner.to_args())
    }
}

impl ObjectiveFn for Objective {
    fn name(&self) -> &'static str {
        delegate!(self, inner => inner.name())
    }

    fn num_groups(&self, num_target: usize) -> usize {
        delegate!(self, inner => inner.num_groups(num_target))
    }

    fn check_targets(&self, num_target: usize) -> Result<()> {
        delegate!(self, inner => inner.check_targets(num_target))
    }

    fn validate_labels(&self, info: &MetaInfo) -> Result<()> {
        delegate!(self, inner => inner.validate_labels(info))
    }

    fn gradients(&self, margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &mut Gradients) -> Result<()> {
        delegate!(self, inner => inner.gradients(margins, info, out))
    }

    fn estimation_stats(&self, info: &MetaInfo, n_groups: usize) -> Option<Vec<f64>> {
        delegate!(self, inner => inner.estimation_stats(info, n_groups))
    }

    fn check_base_score(&self, base_score: f32) -> Result<()> {
        delegate!(self, inner => inner.check_base_score(base_score))
    }

    fn finish_estimation(&self, stats: &[f64], n_groups: usize) -> Vec<f32> {
        delegate!(self, inner => inner.finish_estimation(stats, n_groups))
    }

    fn prob_to_margin(&self, base_score: f32) -> f32 {
        delegate!(self, inner => inner.prob_to_margin(base_score))
    }

    fn pred_transform(&self, margins: Array2<f32>) -> Array2<f32> {
        delegate!(self, inner => inner.pred_transform(margins))
    }

    fn eval_transform(&self, margins: Array2<f32>) -> Array2<f32> {
        delegate!(self, inner => inner.eval_transform(margins))
    }

    fn default_metric(&self) -> &'static str {
        delegate!(self, inner => inner.default_metric())
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Check that margins and gradients agree with the label matrix.
pub(crate) fn check_shapes(margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &Gradients) -> Result<()> {
    if !info.has_labels() {
        return Err(LearnerError::data("labels are required for training"));
    }
    let (groups, rows) = margins.dim();
    if rows != info.num_row || out.n_rows() != rows || out.n_groups() != groups {
        return Err(LearnerError::data(format!(
            "prediction shape {groups}x{rows} does not match {} rows with {} gradient groups",
            info.num_row,
            out.n_groups()
        )));
    }
    Ok(())
}

/// Divide `n_groups` weighted sums by the total weight stored last.
pub(crate) fn finish_weighted_means(stats: &[f64], n_groups: usize) -> Vec<f32> {
    let wsum = stats.get(n_groups).copied().unwrap_or(0.0);
    (0..n_groups)
        .map(|g| if wsum > 0.0 { (stats[g] / wsum) as f32 } else { DEFAULT_BASE_SCORE })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_every_name() {
        for name in OBJECTIVE_NAMES {
            assert_eq!(create(name).unwrap().name(), name);
        }
        assert_eq!(create("reg:linear").unwrap().name(), "reg:squarederror");
    }

    #[test]
    fn unknown_objective_is_a_validation_error() {
        let err = create("reg:nonsense").unwrap_err();
        assert!(matches!(err, LearnerError::Validation(_)));
    }

    #[test]
    fn multi_target_support() {
        assert!(create("reg:squarederror").unwrap().check_targets(3).is_ok());
        let err = create("multi:softprob").unwrap().check_targets(3).unwrap_err();
        assert!(matches!(err, LearnerError::Compatibility(_)));
        assert!(create("binary:logistic").unwrap().check_targets(2).is_err());
    }

    #[test]
    fn enum_delegates_params() {
        let mut obj = create("reg:quantileerror").unwrap();
        assert!(obj.apply("quantile_alpha", "0.9").unwrap());
        assert_eq!(obj.to_args()["quantile_alpha"], "0.9");
        assert!(!obj.apply("max_depth", "3").unwrap());
    }
}
