//! Benchmark reports.

use crate::session::RunTiming;
use crate::verifier::VerificationResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use tileforge_kernels::{BackendInfo, KernelConfig, Variant};

/// Outcome of one benchmark run: timing plus optional verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchReport {
    pub kernel: String,
    pub variant: Variant,
    pub config: KernelConfig,
    pub backend: BackendInfo,
    pub iterations: usize,
    pub latency_ms: f64,
    pub gflops: f64,
    pub bandwidth_gbps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
}

impl BenchReport {
    pub fn new(
        kernel: &str,
        config: KernelConfig,
        backend: BackendInfo,
        timing: &RunTiming,
        verification: Option<VerificationResult>,
    ) -> Self {
        Self {
            kernel: kernel.to_string(),
            variant: config.variant(),
            config,
            backend,
            iterations: timing.iterations,
            latency_ms: timing.latency_per_dispatch_ms(),
            gflops: timing.gflops(),
            bandwidth_gbps: timing.bandwidth_gbps(),
            verification,
        }
    }

    /// True unless verification ran and failed.
    pub fn passed(&self) -> bool {
        self.verification
            .as_ref()
            .map_or(true, VerificationResult::passed)
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.config.problem;
        write!(
            f,
            "{} ({}): M={} K={} N={} {} iterations, {:.3} ms/dispatch, {:.2} GFLOP/s",
            self.kernel,
            p.precision,
            p.m,
            p.k,
            p.n,
            self.iterations,
            self.latency_ms,
            self.gflops
        )?;
        if let Some(result) = &self.verification {
            write!(f, " [{}]", result.label())?;
        }
        Ok(())
    }
}
