//! Pairwise learning to rank.

use std::collections::BTreeMap;

use ndarray::ArrayView2;

use super::{DEFAULT_BASE_SCORE, ObjectiveFn, check_shapes, sigmoid};
use crate::data::MetaInfo;
use crate::error::Result;
use crate::gradients::Gradients;
use crate::params::ParamSet;

/// RankNet loss over every pair of rows with different labels inside a query group.
///
/// Without query groups the whole matrix is one group. Weights are per group.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairwiseRank;

impl ParamSet for PairwiseRank {
    fn apply(&mut self, _key: &str, _value: &str) -> Result<bool> {
        Ok(false)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

impl ObjectiveFn for PairwiseRank {
    fn name(&self) -> &'static str {
        "rank:pairwise"
    }

    fn gradients(&self, margins: ArrayView2<'_, f32>, info: &MetaInfo, out: &mut Gradients) -> Result<()> {
        check_shapes(margins, info, out)?;
        let preds = margins.row(0);
        let (grads, hess) = out.output_mut(0);
        grads.fill(0.0);
        hess.fill(0.0);

        for rows in info.groups() {
            for i in rows.clone() {
                let w = info.row_weight(i);
                for j in rows.clone() {
                    if info.labels[[i, 0]] <= info.labels[[j, 0]] {
                        continue;
                    }
                    // Row i should rank above row j.
                    let p = sigmoid(preds[j] - preds[i]);
                    let h = (p * (1.0 - p)).max(1e-16) * w;
                    grads[i] -= p * w;
                    grads[j] += p * w;
                    hess[i] += h;
                    hess[j] += h;
                }
            }
        }
        Ok(())
    }

    fn estimation_stats(&self, _info: &MetaInfo, _n_groups: usize) -> Option<Vec<f64>> {
        None
    }

    fn finish_estimation(&self, _stats: &[f64], n_groups: usize) -> Vec<f32> {
        vec![DEFAULT_BASE_SCORE; n_groups]
    }

    fn default_metric(&self) -> &'static str {
        "ndcg"
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn more_relevant_row_is_pushed_up() {
        let mut info = MetaInfo::new(3, 1);
        info.labels = array![[2.0], [0.0], [1.0]];
        info.group_ptr = vec![0, 3];
        let mut out = Gradients::new(3, 1);
        PairwiseRank.gradients(array![[0.0, 0.0, 0.0]].view(), &info, &mut out).unwrap();
        let (g, h) = out.output(0);
        assert!(g[0] < 0.0);
        assert!(g[1] > 0.0);
        assert!(h.iter().all(|&v| v > 0.0));
        let total: f32 = g.iter().sum();
        assert!(total.abs() < 1e-6);
    }

    #[test]
    fn pairs_never_cross_groups() {
        let mut info = MetaInfo::new(2, 1);
        info.labels = array![[1.0], [0.0]];
        info.group_ptr = vec![0, 1, 2];
        let mut out = Gradients::new(2, 1);
        PairwiseRank.gradients(array![[0.0, 0.0]].view(), &info, &mut out).unwrap();
        assert_eq!(out.output(0).0, &[0.0, 0.0]);
    }
}
