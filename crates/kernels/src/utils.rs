//! Input generation and matrix previews.

use ndarray::{Array2, ArrayView2};
use std::fmt::Write;

/// Seed used when the caller does not pick one.
pub const DEFAULT_SEED: u64 = 314_159;

/// `rows x cols` matrix of standard-normal samples from a seeded generator.
pub fn randn(rows: usize, cols: usize, rng: &mut fastrand::Rng) -> Array2<f32> {
    let mut spare: Option<f32> = None;
    Array2::from_shape_simple_fn((rows, cols), || {
        if let Some(value) = spare.take() {
            return value;
        }
        // Box-Muller; 1 - u keeps the log argument in (0, 1].
        let u1 = 1.0 - rng.f64();
        let u2 = rng.f64();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        spare = Some((radius * theta.sin()) as f32);
        (radius * theta.cos()) as f32
    })
}

/// Operands for an `M x K` by `N x K` product drawn from one seeded stream.
pub fn random_operands(m: usize, k: usize, n: usize, seed: u64) -> (Array2<f32>, Array2<f32>) {
    let mut rng = fastrand::Rng::with_seed(seed);
    let a = randn(m, k, &mut rng);
    let b = randn(n, k, &mut rng);
    (a, b)
}

/// Compact preview showing the corners of a matrix.
pub fn format_matrix(matrix: ArrayView2<'_, f32>, name: &str) -> String {
    const EDGE: usize = 4;
    let (rows, cols) = matrix.dim();
    let mut out = format!("{name} ({rows} x {cols})\n");

    let pick = |len: usize| -> Vec<Option<usize>> {
        if len <= 2 * EDGE {
            (0..len).map(Some).collect()
        } else {
            (0..EDGE)
                .map(Some)
                .chain(std::iter::once(None))
                .chain((len - EDGE..len).map(Some))
                .collect()
        }
    };

    for row in pick(rows) {
        for col in pick(cols) {
            match (row, col) {
                (Some(r), Some(c)) => {
                    let _ = write!(out, "{:>9.3} ", matrix[(r, c)]);
                }
                _ => out.push_str("      ... "),
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randn_is_reproducible_and_roughly_standard() {
        let (a1, b1) = random_operands(64, 64, 32, DEFAULT_SEED);
        let (a2, b2) = random_operands(64, 64, 32, DEFAULT_SEED);
        assert_eq!(a1, a2);
        assert_eq!(b1, b2);

        let n = a1.len() as f32;
        let mean = a1.sum() / n;
        let var = a1.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((var - 1.0).abs() < 0.15, "var {var}");
    }

    #[test]
    fn format_matrix_elides_large_matrices() {
        let m = Array2::from_shape_fn((20, 3), |(i, j)| (i * 3 + j) as f32);
        let text = format_matrix(m.view(), "Input");
        assert!(text.starts_with("Input (20 x 3)"));
        assert!(text.contains("..."));
        assert_eq!(text.lines().count(), 1 + 2 * 4 + 1);
    }
}
