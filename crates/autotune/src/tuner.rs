//! Core autotuning logic.

use crate::cache::AutotuneCache;
use anyhow::{anyhow, Result};
use std::time::Duration;
use tileforge_kernels::backend::DeviceLimits;
use tileforge_kernels::config::{KernelConfig, KernelProfile, MatmulProblem};
use tileforge_kernels::matmul::MatmulKernel;
use tracing::{debug, info, warn};

/// How many times a candidate is run before and during measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trial {
    pub warmup_runs: usize,
    pub runs: usize,
}

pub struct Autotuner {
    cache: AutotuneCache,
    runs: usize,
    warmup_runs: usize,
}

impl Autotuner {
    pub fn new(cache: AutotuneCache) -> Self {
        Self {
            cache,
            runs: 5,
            warmup_runs: 1,
        }
    }

    pub fn with_runs(mut self, warmup_runs: usize, runs: usize) -> Self {
        self.warmup_runs = warmup_runs;
        self.runs = runs.max(1);
        self
    }

    pub fn cache(&self) -> &AutotuneCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut AutotuneCache {
        &mut self.cache
    }

    /// Candidate configurations of `kernel` that render and fit `limits`.
    pub fn feasible_candidates(
        kernel: &dyn MatmulKernel,
        problem: MatmulProblem,
        limits: &DeviceLimits,
    ) -> Vec<KernelConfig> {
        kernel
            .candidates(problem)
            .into_iter()
            .filter(|config| match kernel.render(config) {
                Ok(source) => match limits.check(config, source.grid) {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(kernel = kernel.name(), error = %err, "candidate exceeds device limits");
                        false
                    }
                },
                Err(err) => {
                    debug!(kernel = kernel.name(), error = %err, "candidate rejected");
                    false
                }
            })
            .collect()
    }

    /// Picks the fastest configuration of `kernel` for `problem`.
    ///
    /// `measure` runs one candidate per the given [`Trial`] and returns the
    /// total time of the timed runs. Candidates that fail to measure are
    /// skipped. Results are cached per problem and variant.
    pub fn select<F>(
        &mut self,
        kernel: &dyn MatmulKernel,
        problem: MatmulProblem,
        limits: &DeviceLimits,
        mut measure: F,
    ) -> Result<KernelProfile>
    where
        F: FnMut(&KernelConfig, Trial) -> Result<Duration>,
    {
        if let Some(profile) = self.cache.get_matmul(&problem, kernel.variant()) {
            debug!(kernel = kernel.name(), "autotune cache hit");
            return Ok(profile.clone());
        }

        let trial = Trial {
            warmup_runs: self.warmup_runs,
            runs: self.runs,
        };
        let mut best: Option<KernelProfile> = None;

        for config in Self::feasible_candidates(kernel, problem, limits) {
            let total = match measure(&config, trial) {
                Ok(total) => total,
                Err(err) => {
                    warn!(kernel = kernel.name(), error = %err, "candidate failed to run");
                    continue;
                }
            };

            let avg_ms = total.as_secs_f64() * 1000.0 / self.runs as f64;
            let profile = KernelProfile::new(kernel.name(), config, avg_ms);
            debug!(
                kernel = kernel.name(),
                workgroup = %config.workgroup,
                time_ms = avg_ms,
                gflops = profile.gflops,
                "measured candidate"
            );

            match &best {
                Some(best_profile) if profile.average_time_ms >= best_profile.average_time_ms => {
                    continue;
                }
                _ => best = Some(profile),
            }
        }

        let profile = best.ok_or_else(|| {
            anyhow!(
                "no {} configuration could run problem m={} k={} n={}",
                kernel.name(),
                problem.m,
                problem.k,
                problem.n
            )
        })?;

        info!(
            kernel = kernel.name(),
            time_ms = profile.average_time_ms,
            gflops = profile.gflops,
            "selected configuration"
        );
        self.cache.insert_matmul(profile.clone());
        Ok(profile)
    }
}
