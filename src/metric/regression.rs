//! Regression metrics.

use ndarray::ArrayView2;

use super::{MetricFn, MetricPartial, check_inputs};
use crate::data::MetaInfo;
use crate::error::Result;

/// Weighted sum of `loss(pred, label)` over every output group.
///
/// Output group `g` is scored against label column `g` (or the last column when
/// there are fewer label columns than groups).
fn elementwise(
    predictions: ArrayView2<'_, f32>,
    info: &MetaInfo,
    loss: impl Fn(f64, f64) -> f64,
) -> Result<MetricPartial> {
    check_inputs(predictions, info)?;
    let n_targets = info.num_target();
    let mut partial = MetricPartial::default();
    for (group, preds) in predictions.rows().into_iter().enumerate() {
        let target = group.min(n_targets - 1);
        for (row, &p) in preds.iter().enumerate() {
            let w = info.row_weight(row) as f64;
            partial.sum += w * loss(p as f64, info.labels[[row, target]] as f64);
            partial.weight += w;
        }
    }
    Ok(partial)
}

/// Root mean squared error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rmse;

impl MetricFn for Rmse {
    fn name(&self) -> String {
        "rmse".into()
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        elementwise(predictions, info, |p, y| (p - y) * (p - y))
    }

    fn finalize(&self, partial: MetricPartial) -> f64 {
        if partial.weight > 0.0 { (partial.sum / partial.weight).sqrt() } else { f64::NAN }
    }
}

/// Root mean squared log error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rmsle;

impl MetricFn for Rmsle {
    fn name(&self) -> String {
        "rmsle".into()
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        elementwise(predictions, info, |p, y| {
            let d = (p + 1.0).ln() - (y + 1.0).ln();
            d * d
        })
    }

    fn finalize(&self, partial: MetricPartial) -> f64 {
        if partial.weight > 0.0 { (partial.sum / partial.weight).sqrt() } else { f64::NAN }
    }
}

/// Mean absolute error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mae;

impl MetricFn for Mae {
    fn name(&self) -> String {
        "mae".into()
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        elementwise(predictions, info, |p, y| (p - y).abs())
    }
}

/// Mean absolute percentage error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mape;

impl MetricFn for Mape {
    fn name(&self) -> String {
        "mape".into()
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        elementwise(predictions, info, |p, y| ((y - p) / y).abs())
    }
}

/// Mean pseudo-Huber error.
#[derive(Debug, Clone, Copy)]
pub struct Mphe {
    pub slope: f64,
}

impl Default for Mphe {
    fn default() -> Self {
        Self { slope: 1.0 }
    }
}

impl MetricFn for Mphe {
    fn name(&self) -> String {
        "mphe".into()
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        let slope2 = self.slope * self.slope;
        elementwise(predictions, info, |p, y| {
            let z = (p - y) / self.slope;
            slope2 * ((1.0 + z * z).sqrt() - 1.0)
        })
    }
}

/// Negative Poisson log-likelihood.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoissonNegLogLik;

impl MetricFn for PoissonNegLogLik {
    fn name(&self) -> String {
        "poisson-nloglik".into()
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        elementwise(predictions, info, |p, y| {
            let p = p.max(1e-16);
            ln_gamma(y + 1.0) + p - y * p.ln()
        })
    }
}

/// Lanczos approximation of `ln Γ(x)` for `x > 0`.
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    let tmp = x + 5.5 - (x + 0.5) * (x + 5.5).ln();
    let mut series = 1.000_000_000_190_015;
    for (i, c) in COEFFS.iter().enumerate() {
        series += c / (x + 1.0 + i as f64);
    }
    -tmp + (2.506_628_274_631_000_5 * series / x).ln()
}
