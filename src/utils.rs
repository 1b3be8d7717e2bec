//! Common utilities used across the crate.
//!
//! Weighted statistics used by base score estimation, the parallelism switch passed
//! through boosters, and a small packed bit set used by column-split prediction.

use rayon::prelude::*;

// =============================================================================
// Statistical Utilities
// =============================================================================

/// Compute the weighted quantile of a slice using a step function.
///
/// No interpolation: returns the value at the point where the cumulative weight
/// first reaches `alpha * total_weight`. Returns `f32::NAN` for empty input.
///
/// `weights` may be empty, meaning unit weights. `scratch` holds the sort order
/// and is resized as needed.
pub fn weighted_quantile(values: &[f32], weights: &[f32], alpha: f32, scratch: &mut Vec<usize>) -> f32 {
    let n = values.len();
    if n == 0 {
        return f32::NAN;
    }
    if n == 1 {
        return values[0];
    }

    scratch.clear();
    scratch.extend(0..n);
    scratch.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let weight_of = |idx: usize| if weights.is_empty() { 1.0 } else { weights[idx] as f64 };
    let total: f64 = if weights.is_empty() {
        n as f64
    } else {
        weights.iter().map(|&w| w as f64).sum()
    };
    let threshold = total * alpha as f64;

    let mut cumulative = 0.0f64;
    for &idx in scratch.iter() {
        cumulative += weight_of(idx);
        if cumulative >= threshold {
            return values[idx];
        }
    }

    values[scratch[n - 1]]
}

/// Weighted mean of `values`, `None` when the total weight is zero.
pub fn weighted_mean(values: impl Iterator<Item = f32>, weights: &[f32]) -> Option<f64> {
    let (mut sum, mut wsum) = (0.0f64, 0.0f64);
    for (i, v) in values.enumerate() {
        let w = if weights.is_empty() { 1.0 } else { weights[i] as f64 };
        sum += w * v as f64;
        wsum += w;
    }
    (wsum > 0.0).then(|| sum / wsum)
}

// =============================================================================
// Parallelism Configuration
// =============================================================================

/// Whether parallel execution is allowed.
///
/// Components do not manage thread pools; the pool is installed by
/// [`run_with_threads`] and components only respect this flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    Sequential,
    Parallel,
}

impl Parallelism {
    /// Create from thread count semantics.
    ///
    /// - 0 = auto (parallel if the rayon pool has multiple threads)
    /// - 1 = sequential
    /// - >1 = parallel
    #[inline]
    pub fn from_threads(n_threads: usize) -> Self {
        if n_threads == 1 || (n_threads == 0 && rayon::current_num_threads() == 1) {
            Parallelism::Sequential
        } else {
            Parallelism::Parallel
        }
    }

    #[inline]
    pub fn is_parallel(self) -> bool {
        matches!(self, Parallelism::Parallel)
    }

    /// Map over `iter`, preserving order in both modes.
    #[inline]
    pub fn maybe_par_map<T, B, I, F>(self, iter: I, f: F) -> Vec<B>
    where
        T: Send,
        B: Send,
        I: IntoIterator<Item = T> + IntoParallelIterator<Item = T>,
        F: Fn(T) -> B + Sync + Send,
    {
        if self.is_parallel() {
            iter.into_par_iter().map(f).collect()
        } else {
            iter.into_iter().map(f).collect()
        }
    }
}

// =============================================================================
// Thread Pool Setup
// =============================================================================

/// Run a closure with the appropriate thread pool.
///
/// Thread count semantics:
/// - `0` = auto (use the global pool)
/// - `1` = sequential (no thread pool)
/// - `n > 1` = use exactly `n` threads
///
/// When a dedicated pool cannot be built the closure runs on the current pool.
pub fn run_with_threads<T: Send>(n_threads: usize, f: impl FnOnce(Parallelism) -> T + Send) -> T {
    match Parallelism::from_threads(n_threads) {
        Parallelism::Sequential => f(Parallelism::Sequential),
        Parallelism::Parallel if n_threads == 0 => f(Parallelism::Parallel),
        Parallelism::Parallel => match rayon::ThreadPoolBuilder::new().num_threads(n_threads).build() {
            Ok(pool) => pool.install(|| f(Parallelism::Parallel)),
            Err(err) => {
                tracing::warn!("failed to build a {n_threads}-thread pool, using the global pool: {err}");
                f(Parallelism::Parallel)
            }
        },
    }
}

// =============================================================================
// Bit Set
// =============================================================================

/// Fixed-size packed bit set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    pub fn new(len: usize) -> Self {
        Self { words: vec![0; len.div_ceil(64)], len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, idx: usize) {
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    /// Bitwise OR with another set of the same length.
    pub fn union_with(&mut self, other: &BitSet) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= *b;
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Rebuild a set of `len` bits; `None` when `bytes` has the wrong size.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Option<Self> {
        if bytes.len() != len.div_ceil(64) * 8 {
            return None;
        }
        let words = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Some(Self { words, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_quantile_empty() {
        let mut scratch = Vec::new();
        assert!(weighted_quantile(&[], &[], 0.5, &mut scratch).is_nan());
    }

    #[test]
    fn test_weighted_quantile_unweighted_median() {
        let mut scratch = Vec::new();
        let values = [5.0, 1.0, 3.0, 2.0, 4.0];
        let result = weighted_quantile(&values, &[], 0.5, &mut scratch);
        assert!((result - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_quantile_high_weight_pulls_quantile() {
        let mut scratch = Vec::new();
        // Total weight 10, threshold 5: the heavy value is reached first.
        let result = weighted_quantile(&[1.0, 10.0], &[1.0, 9.0], 0.5, &mut scratch);
        assert!((result - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_mean() {
        let mean = weighted_mean([1.0f32, 3.0].into_iter(), &[3.0, 1.0]).unwrap();
        assert!((mean - 1.5).abs() < 1e-12);
        assert!(weighted_mean([1.0f32].into_iter(), &[0.0]).is_none());
    }

    #[test]
    fn test_parallelism_from_threads() {
        assert!(!Parallelism::from_threads(1).is_parallel());
        assert!(Parallelism::from_threads(2).is_parallel());
    }

    #[test]
    fn test_run_with_threads_explicit() {
        let result = run_with_threads(2, |_| rayon::current_num_threads());
        assert_eq!(result, 2);
    }

    #[test]
    fn test_maybe_par_map_keeps_order() {
        let seq: Vec<_> = Parallelism::Sequential.maybe_par_map(0..5usize, |i| i * 2);
        let par: Vec<_> = Parallelism::Parallel.maybe_par_map(0..5usize, |i| i * 2);
        assert_eq!(seq, vec![0, 2, 4, 6, 8]);
        assert_eq!(seq, par);
    }

    #[test]
    fn test_bitset_union_and_bytes() {
        let mut a = BitSet::new(70);
        let mut b = BitSet::new(70);
        a.set(3);
        b.set(69);
        a.union_with(&b);
        assert!(a.get(3) && a.get(69) && !a.get(4));

        let restored = BitSet::from_bytes(&a.to_bytes(), 70).unwrap();
        assert_eq!(restored, a);
        assert!(BitSet::from_bytes(&[0u8; 3], 70).is_none());
    }
}
