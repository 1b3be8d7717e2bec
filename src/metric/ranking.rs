//! Ranking metrics computed per query group and averaged by group weight.

use ndarray::ArrayView2;

use super::{MetricFn, MetricPartial, check_inputs};
use crate::data::MetaInfo;
use crate::error::Result;

/// Row indices of `rows` sorted by descending prediction. Ties keep row order.
fn ranked(preds: &[f32], rows: std::ops::Range<usize>) -> Vec<usize> {
    let mut order: Vec<usize> = rows.collect();
    order.sort_by(|&a, &b| preds[b].total_cmp(&preds[a]));
    order
}

/// Sum `score(group rows)` weighted by each group's weight.
fn per_group(
    predictions: ArrayView2<'_, f32>,
    info: &MetaInfo,
    score: impl Fn(&[usize], &MetaInfo) -> f64,
) -> Result<MetricPartial> {
    check_inputs(predictions, info)?;
    let preds = predictions.row(0).to_vec();
    let mut partial = MetricPartial::default();
    for rows in info.groups() {
        if rows.is_empty() {
            continue;
        }
        let w = info.row_weight(rows.start) as f64;
        let order = ranked(&preds, rows);
        partial.sum += w * score(&order, info);
        partial.weight += w;
    }
    Ok(partial)
}

fn cut_off_name(base: &str, top_k: Option<usize>) -> String {
    match top_k {
        Some(k) => format!("{base}@{k}"),
        None => base.to_string(),
    }
}

// =============================================================================
// NDCG
// =============================================================================

/// Normalized discounted cumulative gain with exponential gain `2^rel - 1`.
///
/// A group without relevant documents scores 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ndcg {
    pub top_k: Option<usize>,
}

impl Ndcg {
    fn dcg(labels: impl Iterator<Item = f32>, k: usize) -> f64 {
        labels
            .take(k)
            .enumerate()
            .map(|(i, rel)| (2f64.powf(rel as f64) - 1.0) / ((i + 2) as f64).log2())
            .sum()
    }
}

impl MetricFn for Ndcg {
    fn name(&self) -> String {
        cut_off_name("ndcg", self.top_k)
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        per_group(predictions, info, |order, info| {
            let k = self.top_k.unwrap_or(order.len());
            let dcg = Self::dcg(order.iter().map(|&r| info.labels[[r, 0]]), k);
            let mut ideal: Vec<f32> = order.iter().map(|&r| info.labels[[r, 0]]).collect();
            ideal.sort_by(|a, b| b.total_cmp(a));
            let idcg = Self::dcg(ideal.into_iter(), k);
            if idcg > 0.0 { dcg / idcg } else { 1.0 }
        })
    }

    fn higher_is_better(&self) -> bool {
        true
    }
}

// =============================================================================
// MAP
// =============================================================================

/// Mean average precision; labels above zero are relevant.
///
/// A group without relevant documents scores 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAveragePrecision {
    pub top_k: Option<usize>,
}

impl MetricFn for MeanAveragePrecision {
    fn name(&self) -> String {
        cut_off_name("map", self.top_k)
    }

    fn partial(&self, predictions: ArrayView2<'_, f32>, info: &MetaInfo) -> Result<MetricPartial> {
        per_group(predictions, info, |order, info| {
            let k = self.top_k.unwrap_or(order.len());
            let mut hits = 0usize;
            let mut precision_sum = 0.0;
            for (i, &row) in order.iter().take(k).enumerate() {
                if info.labels[[row, 0]] > 0.0 {
                    hits += 1;
                    precision_sum += hits as f64 / (i + 1) as f64;
                }
            }
            if hits > 0 { precision_sum / hits as f64 } else { 1.0 }
        })
    }

    fn higher_is_better(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    fn grouped() -> MetaInfo {
        let mut info = MetaInfo::new(5, 1);
        info.labels = array![[2.0], [0.0], [1.0], [0.0], [1.0]];
        info.group_ptr = vec![0, 3, 5];
        info
    }

    #[test]
    fn perfect_ranking_scores_one() {
        let info = grouped();
        let preds = array![[3.0, 1.0, 2.0, 0.0, 1.0]];
        let ndcg = Ndcg::default();
        assert_abs_diff_eq!(ndcg.finalize(ndcg.partial(preds.view(), &info).unwrap()), 1.0);
        let map = MeanAveragePrecision::default();
        assert_abs_diff_eq!(map.finalize(map.partial(preds.view(), &info).unwrap()), 1.0);
    }

    #[test]
    fn map_of_misranked_group() {
        let mut info = MetaInfo::new(3, 1);
        info.labels = array![[0.0], [1.0], [1.0]];
        let map = MeanAveragePrecision::default();
        // Ranked 0, 1, 2: hits at positions 2 and 3.
        let partial = map.partial(array![[3.0, 2.0, 1.0]].view(), &info).unwrap();
        assert_abs_diff_eq!(map.finalize(partial), (0.5 + 2.0 / 3.0) / 2.0);
    }

    #[test]
    fn ndcg_cut_off() {
        let mut info = MetaInfo::new(2, 1);
        info.labels = array![[0.0], [1.0]];
        let ndcg = Ndcg { top_k: Some(1) };
        assert_eq!(ndcg.name(), "ndcg@1");
        let partial = ndcg.partial(array![[1.0, 0.0]].view(), &info).unwrap();
        assert_abs_diff_eq!(ndcg.finalize(partial), 0.0);
    }

    #[test]
    fn groups_without_relevance_score_one() {
        let mut info = MetaInfo::new(2, 1);
        info.labels = array![[0.0], [0.0]];
        let ndcg = Ndcg::default();
        assert_abs_diff_eq!(ndcg.finalize(ndcg.partial(array![[0.0, 1.0]].view(), &info).unwrap()), 1.0);
    }
}
