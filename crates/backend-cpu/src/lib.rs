//! Host simulator backend for tileforge.
//!
//! Executes rendered kernels workgroup by workgroup on the CPU, honouring the
//! barriers present in the source, so the dispatch harness can be exercised
//! without an accelerator.

pub mod program;
pub mod runtime;

pub use program::WorkgroupProgram;
pub use runtime::*;
