//! Benchmark harness: run lifecycle, verification, reports and the
//! evaluation suite.

#[cfg(feature = "cli")]
pub mod cli;
pub mod eval;
pub mod report;
pub mod session;
pub mod tune;
pub mod verifier;

pub use eval::{EvaluationDelta, EvaluationReport, EvaluationSuite, MatmulEvalCase, MatmulEvalResult};
pub use report::BenchReport;
pub use session::{BenchContext, Operand, PreparedRun, RunState, RunTiming, SessionOptions};
pub use tune::tune_kernel;
pub use verifier::{VerificationResult, VerificationTolerance, Verifier};
