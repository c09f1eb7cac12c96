//! tileforge: tiled matmul kernel generation, dispatch and benchmarking.
//!
//! The workspace crates are re-exported here so callers can depend on a
//! single package.

pub use tileforge_autotune as autotune;
pub use tileforge_backend_cpu as backend_cpu;
pub use tileforge_backend_gpu as backend_gpu;
pub use tileforge_harness as harness;
pub use tileforge_kernels as kernels;

pub use tileforge_backend_cpu::SimBackend;
pub use tileforge_backend_gpu::WgpuBackend;
pub use tileforge_harness::{BenchContext, BenchReport, SessionOptions, Verifier};
pub use tileforge_kernels::{
    ComputeBackend, KernelConfig, KernelRegistry, MatmulProblem, Precision, Variant,
};
