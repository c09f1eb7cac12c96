use anyhow::Result;
use tileforge::harness::{BenchContext, SessionOptions, Verifier};
use tileforge::kernels::{
    barrier_mutants, drop_barrier, random_operands, BarrierSite, BlockTiledMatmul, KernelSource,
    MatmulInputs, MatmulKernel, MatmulProblem, NaiveMatmul, TiledMatmul,
};
use tileforge::SimBackend;

fn verify_source(kernel: &dyn MatmulKernel, source: KernelSource, seed: u64) -> Result<bool> {
    let ctx = BenchContext::new(SimBackend::new(), SessionOptions::default());
    let problem = source.config.problem;
    let (a, b) = random_operands(problem.m, problem.k, problem.n, seed);
    let inputs = MatmulInputs::new(a.view(), b.view());

    let mut run = ctx.prepare_source(kernel.name(), source, &inputs)?;
    run.run_iterations(1)?;
    let output = run.retrieve_output()?;
    run.teardown()?;
    Ok(Verifier::new().verify(&inputs, output.view()).passed())
}

fn assert_mutants_caught(kernel: &dyn MatmulKernel, problem: MatmulProblem) -> Result<()> {
    let source = kernel.render(&kernel.default_config(problem))?;
    assert!(verify_source(kernel, source.clone(), 3)?, "unmutated kernel must pass");

    let mutants = barrier_mutants(&source.code);
    assert_eq!(mutants.len(), BarrierSite::ALL.len());
    for mutant in mutants {
        let mutated = KernelSource {
            code: mutant.code,
            ..source.clone()
        };
        assert!(
            !verify_source(kernel, mutated, 3)?,
            "{} went undetected",
            mutant.description
        );
    }
    Ok(())
}

#[test]
fn tiled_barrier_mutants_fail_verification() -> Result<()> {
    // K spans four tiles so the consumed barrier guards a real overwrite.
    assert_mutants_caught(&TiledMatmul::with_tile_size(4), MatmulProblem::new(8, 16, 8))
}

#[test]
fn masked_tiled_barrier_mutants_fail_verification() -> Result<()> {
    assert_mutants_caught(&TiledMatmul::with_tile_size(4), MatmulProblem::new(9, 14, 7))
}

#[test]
fn block_tiled_barrier_mutants_fail_verification() -> Result<()> {
    assert_mutants_caught(
        &BlockTiledMatmul::with_blocks(16, 8, 4, 4),
        MatmulProblem::new(32, 16, 16),
    )
}

#[test]
fn naive_kernel_has_no_barriers_to_drop() -> Result<()> {
    let kernel = NaiveMatmul::new();
    let source = kernel.render(&kernel.default_config(MatmulProblem::new(8, 8, 8)))?;
    assert!(barrier_mutants(&source.code).is_empty());
    for site in BarrierSite::ALL {
        assert!(drop_barrier(&source.code, site).is_none());
    }
    Ok(())
}
