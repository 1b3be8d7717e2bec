//! In-memory data matrix consumed by the learner.
//!
//! Features are stored sample-major `[n_rows, n_local_cols]`; missing values are
//! `f32::NAN`. A column-split matrix holds a contiguous block of the global columns
//! and addresses features by their global index.

mod meta;

pub use meta::{DataSplitMode, FEATURE_TYPES, MetaInfo, validate_feature_types};

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{Array2, ArrayView1, ArrayView2, s};

use crate::error::{LearnerError, Result};

static NEXT_MATRIX_ID: AtomicU64 = AtomicU64::new(1);

/// Dense feature matrix with training metadata.
#[derive(Debug)]
pub struct DMatrix {
    id: u64,
    features: Array2<f32>,
    col_offset: usize,
    info: RwLock<MetaInfo>,
}

impl DMatrix {
    /// Wrap a sample-major feature array.
    pub fn new(features: Array2<f32>) -> Self {
        let (rows, cols) = features.dim();
        Self::with_parts(features, 0, MetaInfo::new(rows, cols))
    }

    /// Build from a row-major buffer.
    pub fn from_vec(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        let features = Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| LearnerError::data(format!("feature buffer does not match {rows}x{cols}: {e}")))?;
        Ok(Self::new(features))
    }

    fn with_parts(features: Array2<f32>, col_offset: usize, info: MetaInfo) -> Self {
        Self {
            id: NEXT_MATRIX_ID.fetch_add(1, Ordering::Relaxed),
            features,
            col_offset,
            info: RwLock::new(info),
        }
    }

    /// Process-unique identity, used to key prediction caches.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn num_row(&self) -> usize {
        self.features.nrows()
    }

    /// Global number of columns.
    pub fn num_col(&self) -> usize {
        self.info().num_col
    }

    /// Columns physically held by this matrix.
    pub fn local_cols(&self) -> Range<usize> {
        self.col_offset..self.col_offset + self.features.ncols()
    }

    pub fn features(&self) -> ArrayView2<'_, f32> {
        self.features.view()
    }

    pub fn row(&self, row: usize) -> ArrayView1<'_, f32> {
        self.features.row(row)
    }

    /// Number of `+inf` and `-inf` entries held locally.
    pub fn num_infinite(&self) -> usize {
        self.features.iter().filter(|v| v.is_infinite()).count()
    }

    /// Whether this matrix holds global column `feature`.
    #[inline]
    pub fn owns_feature(&self, feature: usize) -> bool {
        feature >= self.col_offset && feature < self.col_offset + self.features.ncols()
    }

    /// Value of global column `feature`; `None` when the column lives elsewhere.
    #[inline]
    pub fn value(&self, row: usize, feature: usize) -> Option<f32> {
        self.owns_feature(feature).then(|| self.features[[row, feature - self.col_offset]])
    }

    pub fn info(&self) -> RwLockReadGuard<'_, MetaInfo> {
        self.info.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn info_mut(&self) -> RwLockWriteGuard<'_, MetaInfo> {
        self.info.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_column_split(&self) -> bool {
        self.info().is_column_split()
    }

    // =========================================================================
    // Metadata setters
    // =========================================================================

    /// Set labels of shape `(num_row, num_target)`.
    pub fn set_labels(&self, labels: Array2<f32>) -> Result<()> {
        if labels.nrows() != self.num_row() {
            return Err(LearnerError::data(format!(
                "labels have {} rows, matrix has {}",
                labels.nrows(),
                self.num_row()
            )));
        }
        self.info_mut().labels = labels;
        Ok(())
    }

    /// Set a single label column.
    pub fn set_label_vec(&self, labels: Vec<f32>) -> Result<()> {
        let n = labels.len();
        let labels = Array2::from_shape_vec((n, 1), labels)
            .map_err(|e| LearnerError::data(format!("invalid label buffer: {e}")))?;
        self.set_labels(labels)
    }

    /// Set row weights, or one weight per query group. Checked at training time.
    pub fn set_weights(&self, weights: Vec<f32>) {
        self.info_mut().weights = weights;
    }

    /// Set query groups from their sizes. Checked at training time.
    pub fn set_groups(&self, sizes: &[usize]) {
        let mut ptr = Vec::with_capacity(sizes.len() + 1);
        ptr.push(0);
        for &size in sizes {
            ptr.push(ptr[ptr.len() - 1] + size);
        }
        self.info_mut().group_ptr = ptr;
    }

    /// Set initial margins of shape `(num_row, num_group)`.
    pub fn set_base_margin(&self, margin: Array2<f32>) -> Result<()> {
        if margin.nrows() != self.num_row() {
            return Err(LearnerError::data(format!(
                "base margin has {} rows, matrix has {}",
                margin.nrows(),
                self.num_row()
            )));
        }
        self.info_mut().base_margin = Some(margin);
        Ok(())
    }

    pub fn set_feature_names(&self, names: Vec<String>) -> Result<()> {
        if !names.is_empty() && names.len() != self.num_col() {
            return Err(LearnerError::validation(format!(
                "{} feature names given for {} columns",
                names.len(),
                self.num_col()
            )));
        }
        self.info_mut().feature_names = names;
        Ok(())
    }

    pub fn set_feature_types(&self, types: Vec<String>) -> Result<()> {
        if !types.is_empty() && types.len() != self.num_col() {
            return Err(LearnerError::validation(format!(
                "{} feature types given for {} columns",
                types.len(),
                self.num_col()
            )));
        }
        validate_feature_types(&types)?;
        self.info_mut().feature_types = types;
        Ok(())
    }

    /// Mark labels as held by rank 0 only (vertical federated learning).
    pub fn set_federated(&self, federated: bool) {
        self.info_mut().federated = federated;
    }

    // =========================================================================
    // Slicing
    // =========================================================================

    /// Columns held by `rank` when `num_col` columns are split across `world_size`.
    pub fn col_partition(num_col: usize, world_size: usize, rank: usize) -> Range<usize> {
        let base = num_col / world_size;
        let rem = num_col % world_size;
        let begin = rank * base + rank.min(rem);
        let len = base + usize::from(rank < rem);
        begin..begin + len
    }

    /// Block of columns owned by `rank`, keeping global feature indices and all
    /// row metadata.
    pub fn slice_cols(&self, world_size: usize, rank: usize) -> Result<DMatrix> {
        if world_size == 0 || rank >= world_size {
            return Err(LearnerError::data(format!("invalid rank {rank} for world size {world_size}")));
        }
        if self.col_offset != 0 || self.is_column_split() {
            return Err(LearnerError::data("matrix is already column split"));
        }
        let cols = Self::col_partition(self.features.ncols(), world_size, rank);
        let features = self.features.slice(s![.., cols.clone()]).to_owned();
        let mut info = self.info().clone();
        info.data_split_mode = DataSplitMode::Col;
        Ok(Self::with_parts(features, cols.start, info))
    }

    /// Contiguous rows, for row-split workers. Query groups are not supported.
    pub fn slice_rows(&self, rows: Range<usize>) -> Result<DMatrix> {
        if rows.end > self.num_row() || rows.start > rows.end {
            return Err(LearnerError::data(format!("row range {rows:?} out of bounds")));
        }
        let src = self.info();
        if !src.group_ptr.is_empty() {
            return Err(LearnerError::data("cannot slice rows of a matrix with query groups"));
        }
        let features = self.features.slice(s![rows.clone(), ..]).to_owned();
        let mut info = MetaInfo::new(rows.len(), src.num_col);
        if src.has_labels() {
            info.labels = src.labels.slice(s![rows.clone(), ..]).to_owned();
        }
        if !src.weights.is_empty() {
            info.weights = src.weights[rows.clone()].to_vec();
        }
        info.base_margin = src.base_margin.as_ref().map(|m| m.slice(s![rows.clone(), ..]).to_owned());
        info.feature_names = src.feature_names.clone();
        info.feature_types = src.feature_types.clone();
        Ok(Self::with_parts(features, self.col_offset, info))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn matrix() -> DMatrix {
        DMatrix::new(array![[0.0, 1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0, 9.0]])
    }

    #[test]
    fn from_vec_checks_the_shape() {
        let m = DMatrix::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        assert_eq!(m.num_row(), 2);
        assert_eq!(m.num_col(), 3);
        assert_eq!(m.value(1, 0), Some(4.0));
        assert!(matches!(DMatrix::from_vec(vec![1.0; 5], 2, 3), Err(LearnerError::Data(_))));
    }

    #[test]
    fn infinities_are_counted_but_missing_values_are_not() {
        let m = DMatrix::new(array![[0.0, f32::INFINITY], [f32::NAN, f32::NEG_INFINITY], [f32::MAX, 1.0]]);
        assert_eq!(m.num_infinite(), 2);
        assert_eq!(matrix().num_infinite(), 0);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(matrix().id(), matrix().id());
    }

    #[test]
    fn col_partition_covers_all_columns() {
        let parts: Vec<_> = (0..3).map(|r| DMatrix::col_partition(10, 3, r)).collect();
        assert_eq!(parts, vec![0..4, 4..7, 7..10]);
    }

    #[test]
    fn slice_cols_keeps_global_indices() {
        let m = matrix();
        m.set_label_vec(vec![1.0, 0.0]).unwrap();
        let sliced = m.slice_cols(2, 1).unwrap();
        assert_eq!(sliced.num_col(), 5);
        assert_eq!(sliced.local_cols(), 3..5);
        assert_eq!(sliced.value(1, 4), Some(9.0));
        assert_eq!(sliced.value(1, 0), None);
        assert!(sliced.is_column_split());
        assert_eq!(sliced.info().num_target(), 1);
    }

    #[test]
    fn slice_rows_copies_metadata() {
        let m = matrix();
        m.set_label_vec(vec![1.0, 0.0]).unwrap();
        m.set_weights(vec![0.5, 2.0]);
        let sliced = m.slice_rows(1..2).unwrap();
        assert_eq!(sliced.num_row(), 1);
        assert_eq!(sliced.info().labels[[0, 0]], 0.0);
        assert_eq!(sliced.info().weights, vec![2.0]);
    }

    #[test]
    fn labels_must_match_rows() {
        assert!(matrix().set_label_vec(vec![1.0]).is_err());
    }

    #[test]
    fn set_groups_builds_pointer() {
        let m = DMatrix::new(Array2::zeros((5, 1)));
        m.set_groups(&[2, 3]);
        assert_eq!(m.info().group_ptr, vec![0, 2, 5]);
    }
}
