//! Autotuning through the dispatch harness.

use crate::session::BenchContext;
use anyhow::Result;
use tileforge_autotune::{Autotuner, Trial};
use tileforge_kernels::{
    random_operands, ComputeBackend, KernelProfile, MatmulInputs, MatmulKernel, MatmulProblem,
};

/// Tunes `kernel` for `problem`, measuring each candidate with a fresh run.
pub fn tune_kernel<B: ComputeBackend>(
    ctx: &BenchContext<B>,
    tuner: &mut Autotuner,
    kernel: &dyn MatmulKernel,
    problem: MatmulProblem,
) -> Result<KernelProfile> {
    let (a, b) = random_operands(problem.m, problem.k, problem.n, ctx.options().seed);
    let inputs = MatmulInputs::new(a.view(), b.view());
    let limits = ctx.backend().limits();

    tuner.select(kernel, problem, &limits, |config, trial: Trial| {
        let mut run = ctx.prepare_run(config, &inputs)?;
        run.warm_up(trial.warmup_runs)?;
        let timing = run.run_iterations(trial.runs)?;
        run.teardown()?;
        Ok(timing.elapsed)
    })
}
