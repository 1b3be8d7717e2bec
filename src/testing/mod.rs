//! Synthetic data for tests and benchmarks.
//!
//! Everything here is deterministic in its `seed`.
//!
//! ```
//! use boosters_learner::testing::make_dmatrix_for_objective;
//!
//! let data = make_dmatrix_for_objective("binary:logistic", 32, 4, 0);
//! assert_eq!(data.num_row(), 32);
//! ```

use std::sync::Arc;

use ndarray::Array2;
use rand::prelude::*;

use crate::data::DMatrix;

/// Number of classes used for `multi:*` objectives.
pub const TEST_NUM_CLASS: usize = 3;

/// Rows per query group for `rank:*` objectives.
pub const TEST_GROUP_SIZE: usize = 8;

/// Random dense features `(rows, cols)`, uniform in `[min, max)`.
pub fn random_features(rows: usize, cols: usize, seed: u64, min: f32, max: f32) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let width = max - min;
    Array2::from_shape_fn((rows, cols), |_| min + rng.r#gen::<f32>() * width)
}

/// Targets of a random linear model plus uniform noise.
///
/// Returns `(targets, weights, bias)`.
pub fn regression_targets_linear(features: &Array2<f32>, seed: u64, noise: f32) -> (Vec<f32>, Vec<f32>, f32) {
    let mut rng = StdRng::seed_from_u64(seed);
    let weights: Vec<f32> = (0..features.ncols()).map(|_| rng.r#gen::<f32>() * 2.0 - 1.0).collect();
    let bias = rng.r#gen::<f32>() * 0.5 - 0.25;
    let targets = features
        .rows()
        .into_iter()
        .map(|row| {
            let y = bias + row.iter().zip(&weights).map(|(x, w)| x * w).sum::<f32>();
            if noise > 0.0 { y + (rng.r#gen::<f32>() * 2.0 - 1.0) * noise } else { y }
        })
        .collect();
    (targets, weights, bias)
}

/// Seeded generator of training matrices.
///
/// ```
/// use boosters_learner::testing::RandomDataGenerator;
///
/// let data = RandomDataGenerator::new(64, 5).seed(3).missing(0.1).generate("reg:squarederror");
/// assert_eq!(data.num_col(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct RandomDataGenerator {
    rows: usize,
    cols: usize,
    seed: u64,
    missing: f32,
}

impl RandomDataGenerator {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols, seed: 0, missing: 0.0 }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Fraction of feature values replaced by NaN. Labels are drawn before masking.
    pub fn missing(mut self, ratio: f32) -> Self {
        self.missing = ratio;
        self
    }

    /// Features with labels suited to `objective`.
    ///
    /// `multi:*` objectives get [`TEST_NUM_CLASS`] classes; `rank:*` objectives get
    /// query groups of [`TEST_GROUP_SIZE`] rows.
    pub fn generate(&self, objective: &str) -> Arc<DMatrix> {
        let mut features = random_features(self.rows, self.cols, self.seed, 0.0, 1.0);
        let labels = labels_for(objective, &features, self.seed.wrapping_add(1));
        if self.missing > 0.0 {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(2));
            features.mapv_inplace(|x| if rng.r#gen::<f32>() < self.missing { f32::NAN } else { x });
        }

        let data = DMatrix::new(features);
        if let Err(err) = data.set_label_vec(labels) {
            panic!("generated labels do not fit the features: {err}");
        }
        if objective.starts_with("rank:") {
            let mut sizes = vec![TEST_GROUP_SIZE; self.rows / TEST_GROUP_SIZE];
            if self.rows % TEST_GROUP_SIZE != 0 {
                sizes.push(self.rows % TEST_GROUP_SIZE);
            }
            data.set_groups(&sizes);
        }
        Arc::new(data)
    }
}

fn labels_for(objective: &str, features: &Array2<f32>, seed: u64) -> Vec<f32> {
    let (targets, _, _) = regression_targets_linear(features, seed, 0.1);
    match objective.split(':').next() {
        Some("binary") | Some("rank") => {
            let mut sorted = targets.clone();
            sorted.sort_by(f32::total_cmp);
            let median = sorted.get(sorted.len() / 2).copied().unwrap_or(0.0);
            targets.iter().map(|&y| if y >= median { 1.0 } else { 0.0 }).collect()
        }
        Some("multi") => features
            .rows()
            .into_iter()
            .map(|row| ((row[0] * TEST_NUM_CLASS as f32) as usize).min(TEST_NUM_CLASS - 1) as f32)
            .collect(),
        Some("count") => targets.iter().map(|y| (y.abs() * 4.0).round()).collect(),
        _ if objective == "reg:logistic" => features.column(0).to_vec(),
        _ => targets,
    }
}

/// Shorthand for `RandomDataGenerator::new(rows, cols).seed(seed).generate(objective)`.
pub fn make_dmatrix_for_objective(objective: &str, rows: usize, cols: usize, seed: u64) -> Arc<DMatrix> {
    RandomDataGenerator::new(rows, cols).seed(seed).generate(objective)
}

/// Assert element-wise closeness with a readable diff on failure.
pub fn assert_slice_approx_eq(actual: &[f32], expected: &[f32], tolerance: f32, context: &str) {
    assert_eq!(actual.len(), expected.len(), "{context}: length mismatch");
    let mismatches: Vec<String> = actual
        .iter()
        .zip(expected)
        .enumerate()
        .filter(|(_, (a, e))| (*a - *e).abs() > tolerance || a.is_nan() != e.is_nan())
        .take(8)
        .map(|(i, (a, e))| format!("  [{i}] {a} vs {e}"))
        .collect();
    assert!(mismatches.is_empty(), "{context}: values differ by more than {tolerance}\n{}", mismatches.join("\n"));
}
