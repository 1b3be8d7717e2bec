//! Evaluation metrics.
//!
//! Metrics are separate from objectives: a model may be trained with one loss and
//! evaluated with several metrics. Predictions passed to a metric are already
//! transformed by the objective's evaluation transform and laid out
//! `[n_groups, n_rows]`.
//!
//! Every metric reports a [`MetricPartial`] (weighted sum and total weight) so
//! that row-split workers can reduce partial results before finalizing.

mod classification;
mod ranking;
mod regression;

pub use classification::{Auc, BinaryError, LogLoss, MultiError, MultiLogLoss};
pub use ranking::{MeanAveragePrecision, Ndcg};
pub use regression::{Mae, Mape, Mphe, PoissonNegLogLik, Rmse, Rmsle};

use std::fmt;

use ndarray::ArrayView2;

use crate::data::MetaInfo;
use crate::error::{LearnerError, Result};

/// Weighted partial result of a metric over local rows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricPartial {
    pub sum: f64,
    pub weight: f64,
}

impl MetricPartial {
    pub fn new(sum: f64, weight: f64) -> Self {
        Self { sum, weight }
    }
}

/// An evaluation metric.
pub trait MetricFn: Send + Sync + fmt::Debug {
    /// Display name including parameters, e.g. `ndcg@3`.
    fn name(&self) -> String;

    /// Partial result over the rows of `info`.
    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial>;

    /// Final value from a (possibly reduced) partial.
    fn finalize(&self, partial: MetricPartial) -> f64 {
        if partial.weight > 0.0 { partial.sum / partial.weight } else { f64::NAN }
    }

    fn higher_is_better(&self) -> bool {
        false
    }
}

// =============================================================================
// Metric Enum
// =============================================================================

/// Metric selected by name.
#[derive(Debug, Clone)]
pub enum Metric {
    Rmse(Rmse),
    Rmsle(Rmsle),
    Mae(Mae),
    Mape(Mape),
    Mphe(Mphe),
    PoissonNegLogLik(PoissonNegLogLik),
    LogLoss(LogLoss),
    Error(BinaryError),
    Auc(Auc),
    MultiLogLoss(MultiLogLoss),
    MultiError(MultiError),
    Ndcg(Ndcg),
    Map(MeanAveragePrecision),
}

impl Metric {
    /// Parse a metric name such as `rmse`, `error@0.7` or `ndcg@5`.
    pub fn create(name: &str) -> Result<Metric> {
        let (base, param) = match name.split_once('@') {
            Some((base, param)) => (base, Some(param)),
            None => (name, None),
        };
        let top_k = |param: Option<&str>| -> Result<Option<usize>> {
            param
                .map(|p| {
                    p.trim_end_matches('-').parse::<usize>().map_err(|_| {
                        LearnerError::validation(format!("invalid cut-off in metric `{name}`"))
                    })
                })
                .transpose()
        };
        let metric = match (base, param) {
            ("rmse", None) => Metric::Rmse(Rmse),
            ("rmsle", None) => Metric::Rmsle(Rmsle),
            ("mae", None) => Metric::Mae(Mae),
            ("mape", None) => Metric::Mape(Mape),
            ("mphe", None) => Metric::Mphe(Mphe::default()),
            ("poisson-nloglik", None) => Metric::PoissonNegLogLik(PoissonNegLogLik),
            ("logloss", None) => Metric::LogLoss(LogLoss),
            ("error", None) => Metric::Error(BinaryError::default()),
            ("error", Some(t)) => {
                let threshold = t.parse::<f32>().map_err(|_| {
                    LearnerError::validation(format!("invalid threshold in metric `{name}`"))
                })?;
                Metric::Error(BinaryError { threshold })
            }
            ("auc", None) => Metric::Auc(Auc),
            ("mlogloss", None) => Metric::MultiLogLoss(MultiLogLoss),
            ("merror", None) => Metric::MultiError(MultiError),
            ("ndcg", p) => Metric::Ndcg(Ndcg { top_k: top_k(p)? }),
            ("map", p) => Metric::Map(MeanAveragePrecision { top_k: top_k(p)? }),
            _ => return Err(LearnerError::validation(format!("unknown evaluation metric: `{name}`"))),
        };
        Ok(metric)
    }
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Metric::Rmse($inner) => $body,
            Metric::Rmsle($inner) => $body,
            Metric::Mae($inner) => $body,
            Metric::Mape($inner) => $body,
            Metric::Mphe($inner) => $body,
            Metric::PoissonNegLogLik($inner) => $body,
            Metric::LogLoss($inner) => $body,
            Metric::Error($inner) => $body,
            Metric::Auc($inner) => $body,
            Metric::MultiLogLoss($inner) => $body,
            Metric::MultiError($inner) => $body,
            Metric::Ndcg($inner) => $body,
            Metric::Map($inner) => $body,
        }
    };
}

impl MetricFn for Metric {
    fn name(&self) -> String {
        delegate!(self, inner => inner.name())
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        delegate!(self, inner => inner.partial(predictions, info))
    }

    fn finalize(&self, partial: MetricPartial) -> f64 {
        delegate!(self, inner => inner.finalize(partial))
    }

    fn higher_is_better(&self) -> bool {
        delegate!(self, inner => inner.higher_is_better())
    }
}

/// Evaluated metric value.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:.6}", self.name, self.value)
    }
}

/// Fail unless predictions and labels cover the same rows.
pub(crate) fn check_inputs(predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<()> {
    if !info.has_labels() {
        return Err(LearnerError::data("labels are required for evaluation"));
    }
    if predictions.ncols() != info.num_row {
        return Err(LearnerError::data(format!(
            "{} predictions for {} labelled rows",
            predictions.ncols(),
            info.num_row
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_metric_names() {
        assert_eq!(Metric::create("rmse").unwrap().name(), "rmse");
        assert_eq!(Metric::create("error@0.7").unwrap().name(), "error@0.7");
        assert_eq!(Metric::create("ndcg@3").unwrap().name(), "ndcg@3");
        assert_eq!(Metric::create("map").unwrap().name(), "map");
        assert!(Metric::create("KL").is_err());
        assert!(Metric::create("ndcg@x").is_err());
    }

    #[test]
    fn metric_value_display() {
        let v = MetricValue { name: "rmse".into(), value: 0.5 };
        assert_eq!(v.to_string(), "rmse:0.500000");
    }

    #[test]
    fn empty_partial_is_nan() {
        assert!(Rmse.finalize(MetricPartial::default()).is_nan());
    }
}
