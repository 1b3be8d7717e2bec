//! Per-matrix metadata: labels, weights, query groups, base margins, feature info.

use std::ops::Range;

use ndarray::Array2;

use crate::error::{LearnerError, Result};

/// How rows or columns of a matrix are distributed across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSplitMode {
    /// Every worker holds a subset of rows with all columns.
    #[default]
    Row,
    /// Every worker holds all rows and a contiguous block of columns.
    Col,
}

/// Feature type tags accepted by the learner.
pub const FEATURE_TYPES: [&str; 6] = ["q", "int", "i", "float", "f", "c"];

/// Metadata attached to a [`DMatrix`](super::DMatrix).
#[derive(Debug, Clone, Default)]
pub struct MetaInfo {
    pub num_row: usize,
    /// Global number of columns, including columns held by other workers.
    pub num_col: usize,
    /// Labels of shape `(num_row, num_target)`, empty when unset.
    pub labels: Array2<f32>,
    /// Row weights, or one weight per query group for ranking data.
    pub weights: Vec<f32>,
    /// Query group boundaries; `group_ptr[i]..group_ptr[i + 1]` is group `i`.
    pub group_ptr: Vec<usize>,
    /// Initial margins of shape `(num_row, num_group)`.
    pub base_margin: Option<Array2<f32>>,
    pub feature_names: Vec<String>,
    pub feature_types: Vec<String>,
    pub data_split_mode: DataSplitMode,
    /// Labels are only meaningful on rank 0 (vertical federated learning).
    pub federated: bool,
}

impl MetaInfo {
    pub fn new(num_row: usize, num_col: usize) -> Self {
        Self { num_row, num_col, labels: Array2::zeros((0, 0)), ..Default::default() }
    }

    pub fn has_labels(&self) -> bool {
        self.labels.nrows() > 0 && self.labels.ncols() > 0
    }

    /// Number of label columns, 0 when no labels are set.
    pub fn num_target(&self) -> usize {
        if self.has_labels() { self.labels.ncols() } else { 0 }
    }

    pub fn is_column_split(&self) -> bool {
        self.data_split_mode == DataSplitMode::Col
    }

    pub fn is_vertical_federated(&self) -> bool {
        self.federated && self.is_column_split()
    }

    pub fn num_groups(&self) -> usize {
        self.group_ptr.len().saturating_sub(1)
    }

    /// Query group row ranges; the whole matrix is one group when none are set.
    pub fn groups(&self) -> Vec<Range<usize>> {
        if self.group_ptr.len() < 2 {
            return vec![0..self.num_row];
        }
        self.group_ptr.windows(2).map(|w| w[0]..w[1]).collect()
    }

    /// Weight of `row`. Group weights are expanded to their rows.
    pub fn row_weight(&self, row: usize) -> f32 {
        if self.weights.is_empty() {
            return 1.0;
        }
        if self.weights.len() == self.num_row {
            return self.weights[row];
        }
        let group = self.group_ptr.partition_point(|&p| p <= row).saturating_sub(1);
        self.weights.get(group).copied().unwrap_or(1.0)
    }

    /// Row weights with group weights expanded; empty when unweighted.
    pub fn row_weights(&self) -> Vec<f32> {
        if self.weights.is_empty() || self.weights.len() == self.num_row {
            return self.weights.clone();
        }
        (0..self.num_row).map(|r| self.row_weight(r)).collect()
    }

    /// Check structural consistency of labels, weights, groups and margins.
    pub fn validate(&self) -> Result<()> {
        if self.has_labels() && self.labels.nrows() != self.num_row {
            return Err(LearnerError::data(format!(
                "size of labels ({}) must equal the number of rows ({})",
                self.labels.nrows(),
                self.num_row
            )));
        }
        if !self.group_ptr.is_empty() {
            if self.group_ptr[0] != 0 || self.group_ptr.windows(2).any(|w| w[0] > w[1]) {
                return Err(LearnerError::data("invalid group structure: boundaries must start at 0 and be non-decreasing"));
            }
            let last = self.group_ptr[self.group_ptr.len() - 1];
            if last != self.num_row {
                return Err(LearnerError::data(format!(
                    "invalid group structure: groups cover {last} rows, matrix has {}",
                    self.num_row
                )));
            }
        }
        if !self.weights.is_empty() {
            let per_group = !self.group_ptr.is_empty();
            if per_group && self.weights.len() != self.num_groups() {
                return Err(LearnerError::data(format!(
                    "size of weights ({}) must equal the number of query groups ({})",
                    self.weights.len(),
                    self.num_groups()
                )));
            }
            if !per_group && self.weights.len() != self.num_row {
                return Err(LearnerError::data(format!(
                    "size of weights ({}) must equal the number of rows ({})",
                    self.weights.len(),
                    self.num_row
                )));
            }
            if self.weights.iter().any(|w| !(*w >= 0.0)) {
                return Err(LearnerError::data("weights must be non-negative"));
            }
        }
        if let Some(margin) = &self.base_margin {
            if margin.nrows() != self.num_row {
                return Err(LearnerError::data(format!(
                    "size of base margin ({}) must equal the number of rows ({})",
                    margin.nrows(),
                    self.num_row
                )));
            }
        }
        Ok(())
    }
}

/// Check feature type tags against [`FEATURE_TYPES`].
pub fn validate_feature_types(types: &[String]) -> Result<()> {
    match types.iter().find(|t| !FEATURE_TYPES.contains(&t.as_str())) {
        Some(bad) => Err(LearnerError::validation(format!(
            "unknown feature type `{bad}`, expected one of {FEATURE_TYPES:?}"
        ))),
        None => Ok(()),
    }
}
