//! Host reference matmul used to check device output.

use crate::config::MatmulProblem;
use crate::error::ConfigError;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Host-side operands: `a` is M x K, `b` is N x K (transposed layout).
#[derive(Debug, Clone, Copy)]
pub struct MatmulInputs<'a> {
    pub a: ArrayView2<'a, f32>,
    pub b: ArrayView2<'a, f32>,
}

impl<'a> MatmulInputs<'a> {
    pub fn new(a: ArrayView2<'a, f32>, b: ArrayView2<'a, f32>) -> Self {
        Self { a, b }
    }

    pub fn validate(&self, problem: &MatmulProblem) -> Result<(), ConfigError> {
        if self.a.dim() != (problem.m, problem.k) {
            return Err(ConfigError::InputShape {
                name: "A",
                expected: (problem.m, problem.k),
                actual: self.a.dim(),
            });
        }
        if self.b.dim() != (problem.n, problem.k) {
            return Err(ConfigError::InputShape {
                name: "B",
                expected: (problem.n, problem.k),
                actual: self.b.dim(),
            });
        }
        Ok(())
    }
}

/// `C[i][j] = sum_k A[i][k] * B[j][k]`, rows computed in parallel.
pub fn reference_matmul(inputs: &MatmulInputs<'_>) -> Array2<f32> {
    let a = inputs.a;
    let b = inputs.b;
    let mut output = Array2::<f32>::zeros((a.nrows(), b.nrows()));

    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(row_idx, mut row)| {
            let a_row = a.row(row_idx);
            for (col_idx, value) in row.iter_mut().enumerate() {
                *value = a_row.dot(&b.row(col_idx));
            }
        });

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn matches_transposed_dot() {
        let a = Array2::from_shape_fn((8, 16), |(i, j)| (i + j) as f32 * 0.1);
        let b = Array2::from_shape_fn((6, 16), |(i, j)| (i * j + 1) as f32 * 0.05);
        let inputs = MatmulInputs::new(a.view(), b.view());

        let expected = a.dot(&b.t());
        let output = reference_matmul(&inputs);
        for (lhs, rhs) in output.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-4);
        }
    }

    #[test]
    fn validate_reports_mismatched_operand() {
        let a = Array2::<f32>::zeros((4, 3));
        let b = Array2::<f32>::zeros((5, 2));
        let inputs = MatmulInputs::new(a.view(), b.view());
        let err = inputs.validate(&MatmulProblem::new(4, 3, 5)).unwrap_err();
        assert!(matches!(err, ConfigError::InputShape { name: "B", .. }));
    }
}
