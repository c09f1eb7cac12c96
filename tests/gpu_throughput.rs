//! Device tests; run with `--ignored` on a machine with a wgpu adapter.

use anyhow::Result;
use tileforge::harness::{BenchContext, SessionOptions};
use tileforge::kernels::{ProblemPreset, Variant};
use tileforge::WgpuBackend;

fn gpu_context(iterations: usize) -> Result<BenchContext<WgpuBackend>> {
    Ok(BenchContext::new(
        WgpuBackend::new()?,
        SessionOptions {
            iterations,
            warmup_iterations: 1,
            ..SessionOptions::default()
        },
    ))
}

#[test]
#[ignore = "requires a GPU adapter"]
fn every_variant_passes_on_device() -> Result<()> {
    let ctx = gpu_context(4)?;
    let problem = ProblemPreset::Small.problem();
    for variant in Variant::ALL {
        let kernel = ctx.registry().find(variant).expect("registered");
        let report = ctx.benchmark(&kernel.default_config(problem))?;
        assert!(report.passed(), "{report}");
    }
    Ok(())
}

#[test]
#[ignore = "requires a GPU adapter"]
fn register_blocking_beats_naive_on_large_problem() -> Result<()> {
    let ctx = BenchContext::new(
        WgpuBackend::new()?,
        SessionOptions {
            iterations: 3,
            warmup_iterations: 1,
            verify: false,
            ..SessionOptions::default()
        },
    );
    let problem = ProblemPreset::Large.problem();
    let mut best = |variant: Variant| -> Result<f64> {
        let kernel = ctx.registry().find(variant).expect("registered");
        let config = kernel.default_config(problem);
        let mut best = 0.0f64;
        for _ in 0..3 {
            best = best.max(ctx.benchmark(&config)?.gflops);
        }
        Ok(best)
    };

    let naive = best(Variant::Naive)?;
    let blocked = best(Variant::BlockTiled)?;
    // 10% slack for clock and scheduling noise.
    assert!(blocked >= naive * 0.9, "block-tiled {blocked:.1} < naive {naive:.1} GFLOP/s");
    Ok(())
}
