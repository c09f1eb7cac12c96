//! Output verification against the host reference.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use tileforge_kernels::{reference_matmul, MatmulInputs, Precision};
use tracing::{info, warn};

/// Per-element tolerance: `|c - r| <= max_abs_error + max_rel_error * |r|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerificationTolerance {
    pub max_abs_error: f32,
    pub max_rel_error: f32,
}

impl Default for VerificationTolerance {
    fn default() -> Self {
        Self {
            max_abs_error: 1e-3,
            max_rel_error: 1e-3,
        }
    }
}

impl VerificationTolerance {
    pub fn strict() -> Self {
        Self {
            max_abs_error: 1e-5,
            max_rel_error: 1e-4,
        }
    }

    /// Default tolerance widened to the rounding error of `precision`.
    pub fn for_precision(precision: Precision) -> Self {
        match precision {
            Precision::F32 => Self::default(),
            Precision::F16 => Self {
                max_abs_error: 1e-1,
                max_rel_error: 2e-2,
            },
        }
    }

    fn allows(&self, reference: f32, candidate: f32) -> bool {
        (candidate - reference).abs() <= self.max_abs_error + self.max_rel_error * reference.abs()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum VerificationResult {
    Passed {
        max_abs_error: f32,
        max_rel_error: f32,
    },
    Failed {
        reason: String,
        max_abs_error: f32,
        mismatches: usize,
    },
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        matches!(self, VerificationResult::Passed { .. })
    }

    pub fn max_abs_error(&self) -> f32 {
        match self {
            VerificationResult::Passed { max_abs_error, .. }
            | VerificationResult::Failed { max_abs_error, .. } => *max_abs_error,
        }
    }

    pub fn label(&self) -> &'static str {
        if self.passed() {
            "PASS"
        } else {
            "FAIL"
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Verifier {
    tolerance: VerificationTolerance,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tolerance(tolerance: VerificationTolerance) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> VerificationTolerance {
        self.tolerance
    }

    /// Checks `output` against the reference product of `inputs`.
    pub fn verify(
        &self,
        inputs: &MatmulInputs<'_>,
        output: ArrayView2<'_, f32>,
    ) -> VerificationResult {
        let reference = reference_matmul(inputs);
        let result = self.compare(reference.view(), output);
        match &result {
            VerificationResult::Passed { max_abs_error, .. } => {
                info!(max_abs_error, "verification PASS");
            }
            VerificationResult::Failed { reason, .. } => {
                warn!(%reason, "verification FAIL");
            }
        }
        result
    }

    /// Element-wise comparison of `candidate` against `reference`.
    pub fn compare(
        &self,
        reference: ArrayView2<'_, f32>,
        candidate: ArrayView2<'_, f32>,
    ) -> VerificationResult {
        if reference.dim() != candidate.dim() {
            return VerificationResult::Failed {
                reason: format!(
                    "shape mismatch: {:?} vs {:?}",
                    reference.dim(),
                    candidate.dim()
                ),
                max_abs_error: f32::INFINITY,
                mismatches: reference.len().max(candidate.len()),
            };
        }

        let mut max_abs = 0.0f32;
        let mut max_rel = 0.0f32;
        let mut mismatches = 0usize;
        let mut first: Option<((usize, usize), f32, f32)> = None;

        for ((index, r), c) in reference.indexed_iter().zip(candidate.iter()) {
            let abs_err = (r - c).abs();
            max_abs = max_abs.max(abs_err);
            if r.abs() > 1e-6 {
                max_rel = max_rel.max(abs_err / r.abs());
            }

            // NaN never satisfies the predicate.
            if !self.tolerance.allows(*r, *c) {
                mismatches += 1;
                if first.is_none() {
                    first = Some((index, *r, *c));
                }
            }
        }

        match first {
            None => VerificationResult::Passed {
                max_abs_error: max_abs,
                max_rel_error: max_rel,
            },
            Some(((row, col), expected, actual)) => VerificationResult::Failed {
                reason: format!(
                    "{mismatches} of {} elements outside tolerance; first at ({row}, {col}): expected {expected}, got {actual}",
                    reference.len()
                ),
                max_abs_error: max_abs,
                mismatches,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn compare_outputs_pass() {
        let verifier = Verifier::new();
        let a = Array2::from_elem((4, 4), 1.0f32);
        let b = Array2::from_elem((4, 4), 1.00001f32);
        assert!(verifier.compare(a.view(), b.view()).passed());
    }

    #[test]
    fn compare_outputs_fail() {
        let verifier = Verifier::with_tolerance(VerificationTolerance::strict());
        let a = Array2::from_elem((4, 4), 1.0f32);
        let mut b = a.clone();
        b[(2, 3)] = 1.1;
        match verifier.compare(a.view(), b.view()) {
            VerificationResult::Failed {
                reason, mismatches, ..
            } => {
                assert_eq!(mismatches, 1);
                assert!(reason.contains("(2, 3)"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn relative_term_scales_with_magnitude() {
        let verifier = Verifier::new();
        let reference = Array2::from_elem((1, 2), 1000.0f32);
        let candidate = Array2::from_elem((1, 2), 1000.5f32);
        assert!(verifier.compare(reference.view(), candidate.view()).passed());
    }

    #[test]
    fn nan_fails_and_shape_mismatch_fails() {
        let verifier = Verifier::new();
        let reference = Array2::from_elem((2, 2), 1.0f32);
        let mut candidate = reference.clone();
        candidate[(0, 0)] = f32::NAN;
        assert!(!verifier.compare(reference.view(), candidate.view()).passed());

        let narrow = Array2::from_elem((2, 1), 1.0f32);
        assert!(!verifier.compare(reference.view(), narrow.view()).passed());
    }

    #[test]
    fn verify_uses_transposed_b() {
        let a = Array2::from_shape_fn((3, 2), |(i, j)| (i + j) as f32);
        let b = Array2::from_shape_fn((4, 2), |(i, j)| (i * 2 + j) as f32);
        let output = a.dot(&b.t());
        let inputs = MatmulInputs::new(a.view(), b.view());
        assert!(Verifier::new().verify(&inputs, output.view()).passed());
    }
}
