//! Structure-of-arrays gradient buffer in output-major layout.
//!
//! ```text
//! grads: [r0_g0, r1_g0, ..., rN_g0, r0_g1, ..., rN_g1, ...]
//! hess:  same layout
//! ```
//!
//! Index formula: `grads[group * n_rows + row]`. Each output group is contiguous,
//! which is what the tree builder and the linear updater iterate over.

use crate::collective::{decode_f32, encode_f32};
use crate::error::{LearnerError, Result};

/// First and second order gradient of one prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GradientPair {
    pub grad: f32,
    pub hess: f32,
}

impl GradientPair {
    pub fn new(grad: f32, hess: f32) -> Self {
        Self { grad, hess }
    }
}

/// Gradient buffer for `n_rows` rows and `n_groups` outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    grads: Vec<f32>,
    hess: Vec<f32>,
    n_rows: usize,
    n_groups: usize,
}

impl Gradients {
    pub fn new(n_rows: usize, n_groups: usize) -> Self {
        Self { grads: vec![0.0; n_rows * n_groups], hess: vec![0.0; n_rows * n_groups], n_rows, n_groups }
    }

    /// Build from user-supplied row-major buffers (`[row * n_groups + group]`).
    pub fn from_row_major(grad: &[f32], hess: &[f32], n_rows: usize, n_groups: usize) -> Result<Self> {
        let expected = n_rows * n_groups;
        if grad.len() != expected || hess.len() != expected {
            return Err(LearnerError::data(format!(
                "gradient buffers have {} and {} entries, expected {expected} ({n_rows} rows x {n_groups} groups)",
                grad.len(),
                hess.len()
            )));
        }
        let mut out = Self::new(n_rows, n_groups);
        for row in 0..n_rows {
            for group in 0..n_groups {
                out.set(row, group, grad[row * n_groups + group], hess[row * n_groups + group]);
            }
        }
        Ok(out)
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    #[inline]
    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    #[inline]
    pub fn get(&self, row: usize, group: usize) -> GradientPair {
        let idx = group * self.n_rows + row;
        GradientPair::new(self.grads[idx], self.hess[idx])
    }

    #[inline]
    pub fn set(&mut self, row: usize, group: usize, grad: f32, hess: f32) {
        let idx = group * self.n_rows + row;
        self.grads[idx] = grad;
        self.hess[idx] = hess;
    }

    /// Gradients and hessians of one output group.
    #[inline]
    pub fn output(&self, group: usize) -> (&[f32], &[f32]) {
        let range = group * self.n_rows..(group + 1) * self.n_rows;
        (&self.grads[range.clone()], &self.hess[range])
    }

    #[inline]
    pub fn output_mut(&mut self, group: usize) -> (&mut [f32], &mut [f32]) {
        let range = group * self.n_rows..(group + 1) * self.n_rows;
        (&mut self.grads[range.clone()], &mut self.hess[range])
    }

    /// Serialize for broadcasting (grads followed by hessians).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.grads.iter().chain(&self.hess).copied().collect()
    }

    pub fn from_f32_vec(values: Vec<f32>, n_rows: usize, n_groups: usize) -> Result<Self> {
        let size = n_rows * n_groups;
        if values.len() != 2 * size {
            return Err(LearnerError::Collective(format!(
                "gradient buffer has {} values, expected {}",
                values.len(),
                2 * size
            )));
        }
        let mut grads = values;
        let hess = grads.split_off(size);
        Ok(Self { grads, hess, n_rows, n_groups })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_f32(&self.to_f32_vec())
    }

    pub fn from_bytes(bytes: &[u8], n_rows: usize, n_groups: usize) -> Result<Self> {
        Self::from_f32_vec(decode_f32(bytes)?, n_rows, n_groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_slices_are_contiguous() {
        let mut g = Gradients::new(3, 2);
        g.set(1, 1, -0.5, 0.25);
        let (grads, hess) = g.output(1);
        assert_eq!(grads, &[0.0, -0.5, 0.0]);
        assert_eq!(hess, &[0.0, 0.25, 0.0]);
        assert_eq!(g.get(1, 1), GradientPair::new(-0.5, 0.25));
    }

    #[test]
    fn row_major_input_is_transposed() {
        let grad = [1.0, 2.0, 3.0, 4.0];
        let hess = [1.0; 4];
        let g = Gradients::from_row_major(&grad, &hess, 2, 2).unwrap();
        assert_eq!(g.output(0).0, &[1.0, 3.0]);
        assert_eq!(g.output(1).0, &[2.0, 4.0]);
        assert!(Gradients::from_row_major(&grad, &hess, 3, 2).is_err());
    }

    #[test]
    fn byte_form_round_trips() {
        let mut g = Gradients::new(2, 1);
        g.set(0, 0, 0.125, 1.0);
        let back = Gradients::from_bytes(&g.to_bytes(), 2, 1).unwrap();
        assert_eq!(back, g);
    }
}
