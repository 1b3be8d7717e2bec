//! Initial base score estimation from label statistics.
//!
//! Row-split workers reduce additive statistics so every worker finishes with the
//! same sums. For column-split and vertical federated data the labels are
//! authoritative on rank 0 only; rank 0 estimates and broadcasts the result.

use crate::collective::{Communicator, apply_with_labels};
use crate::data::DMatrix;
use crate::error::{LearnerError, Result};
use crate::objective::{DEFAULT_BASE_SCORE, Objective, ObjectiveFn};

/// Estimate one base score per output group, in output space.
pub(crate) fn estimate(
    objective: &Objective,
    data: &DMatrix,
    n_groups: usize,
    comm: &dyn Communicator,
) -> Result<Vec<f32>> {
    let (labels_on_root, has_labels) = {
        let info = data.info();
        (info.is_column_split() || info.federated, info.has_labels())
    };

    let estimated = if labels_on_root && comm.is_distributed() {
        apply_with_labels(comm, || local_estimate(objective, data, n_groups))?
    } else {
        if !has_labels {
            return Err(LearnerError::data("labels are required to estimate the base score"));
        }
        let stats = objective.estimation_stats(&data.info(), n_groups);
        match stats {
            Some(mut stats) => {
                comm.allreduce_sum(&mut stats)?;
                objective.finish_estimation(&stats, n_groups)
            }
            None => vec![DEFAULT_BASE_SCORE; n_groups],
        }
    };

    if estimated.len() != n_groups || estimated.iter().any(|v| !v.is_finite()) {
        return Err(LearnerError::data(format!(
            "base score estimation produced {estimated:?} for {n_groups} output groups"
        )));
    }
    Ok(estimated)
}

fn local_estimate(objective: &Objective, data: &DMatrix, n_groups: usize) -> Result<Vec<f32>> {
    let info = data.info();
    if !info.has_labels() {
        return Err(LearnerError::data("labels are required to estimate the base score"));
    }
    Ok(match objective.estimation_stats(&info, n_groups) {
        Some(stats) => objective.finish_estimation(&stats, n_groups),
        None => vec![DEFAULT_BASE_SCORE; n_groups],
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;
    use crate::collective::{NoopCommunicator, SharedCommunicator, run_distributed};
    use crate::objective;

    #[test]
    fn squared_error_uses_the_weighted_mean() {
        let data = DMatrix::new(array![[0.0], [0.0], [0.0]]);
        data.set_label_vec(vec![1.0, 2.0, 6.0]).unwrap();
        data.set_weights(vec![1.0, 1.0, 2.0]);
        let obj = objective::create("reg:squarederror").unwrap();
        let score = estimate(&obj, &data, 1, &NoopCommunicator).unwrap();
        assert_abs_diff_eq!(score[0], 3.75, epsilon = 1e-6);
    }

    #[test]
    fn ranking_keeps_the_default() {
        let data = DMatrix::new(array![[0.0], [0.0]]);
        data.set_label_vec(vec![1.0, 0.0]).unwrap();
        let obj = objective::create("rank:pairwise").unwrap();
        assert_eq!(estimate(&obj, &data, 1, &NoopCommunicator).unwrap(), vec![DEFAULT_BASE_SCORE]);
    }

    #[test]
    fn row_split_matches_single_process() {
        let full = DMatrix::new(array![[0.0], [0.0], [0.0], [0.0]]);
        full.set_label_vec(vec![0.0, 1.0, 1.0, 1.0]).unwrap();
        let obj = objective::create("binary:logistic").unwrap();
        let expected = estimate(&obj, &full, 1, &NoopCommunicator).unwrap();

        let results = run_distributed(2, |comm: SharedCommunicator| {
            let rows = comm.rank() * 2..comm.rank() * 2 + 2;
            let part = full.slice_rows(rows).unwrap();
            estimate(&obj, &part, 1, comm.as_ref()).unwrap()
        });
        for score in results {
            assert_eq!(score, expected);
        }
    }

    #[test]
    fn federated_labels_come_from_rank_zero() {
        let results = run_distributed(3, |comm: SharedCommunicator| {
            let full = DMatrix::new(array![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]]);
            if comm.rank() == 0 {
                full.set_label_vec(vec![2.0, 4.0]).unwrap();
            }
            full.set_federated(true);
            let part = full.slice_cols(comm.world_size(), comm.rank()).unwrap();
            let obj = objective::create("reg:squarederror").unwrap();
            estimate(&obj, &part, 1, comm.as_ref()).unwrap()
        });
        for score in results {
            assert_eq!(score, vec![3.0]);
        }
    }
}
