//! CLI wiring for tileforge.

use crate::eval::{EvaluationReport, EvaluationSuite};
use crate::session::{BenchContext, SessionOptions};
use crate::tune::tune_kernel;
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tileforge_autotune::{AutotuneCache, Autotuner};
use tileforge_backend_cpu::SimBackend;
use tileforge_backend_gpu::WgpuBackend;
use tileforge_kernels::{
    ComputeBackend, KernelConfig, KernelRegistry, Masking, MatmulProblem, Precision,
    ProblemPreset, Tiling, Variant,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tileforge", about = "Tiled matmul kernel generator and benchmark harness")]
pub struct Cli {
    /// Where kernels run: a wgpu adapter or the host workgroup simulator.
    #[arg(long, value_enum, default_value = "gpu")]
    pub backend: BackendArg,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum BackendArg {
    Gpu,
    Sim,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum PresetArg {
    Tiny,
    Small,
    Large,
}

impl From<PresetArg> for ProblemPreset {
    fn from(value: PresetArg) -> ProblemPreset {
        match value {
            PresetArg::Tiny => ProblemPreset::Tiny,
            PresetArg::Small => ProblemPreset::Small,
            PresetArg::Large => ProblemPreset::Large,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum VariantArg {
    Naive,
    Tiled,
    BlockTiled,
}

impl From<VariantArg> for Variant {
    fn from(value: VariantArg) -> Variant {
        match value {
            VariantArg::Naive => Variant::Naive,
            VariantArg::Tiled => Variant::Tiled,
            VariantArg::BlockTiled => Variant::BlockTiled,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum MaskingArg {
    Auto,
    Always,
    Never,
}

impl From<MaskingArg> for Masking {
    fn from(value: MaskingArg) -> Masking {
        match value {
            MaskingArg::Auto => Masking::Auto,
            MaskingArg::Always => Masking::Always,
            MaskingArg::Never => Masking::Never,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProblemArgs {
    /// Named problem size; overrides --m/--k/--n.
    #[arg(long, value_enum)]
    pub preset: Option<PresetArg>,
    #[arg(long, default_value_t = 16)]
    pub m: usize,
    #[arg(long, default_value_t = 4)]
    pub k: usize,
    #[arg(long, default_value_t = 8)]
    pub n: usize,
    /// Use 16-bit floats (simulator backend only).
    #[arg(long, default_value_t = false)]
    pub f16: bool,
}

impl ProblemArgs {
    pub fn problem(&self) -> MatmulProblem {
        let problem = match self.preset {
            Some(preset) => ProblemPreset::from(preset).problem(),
            None => MatmulProblem::new(self.m, self.k, self.n),
        };
        if self.f16 {
            problem.with_precision(Precision::F16)
        } else {
            problem
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct KernelArgs {
    #[arg(long, value_enum, default_value = "block-tiled")]
    pub variant: VariantArg,
    /// Square tile edge for the tiled variant.
    #[arg(long)]
    pub tile_size: Option<u32>,
    #[arg(long, value_enum, default_value = "auto")]
    pub masking: MaskingArg,
    /// Register-blocked parameters, all four or none.
    #[arg(long, num_args = 4, value_names = ["BM", "BN", "BK", "TM"])]
    pub blocks: Option<Vec<u32>>,
}

impl KernelArgs {
    pub fn config(&self, registry: &KernelRegistry, problem: MatmulProblem) -> Result<KernelConfig> {
        let variant = Variant::from(self.variant);
        let kernel = registry
            .find(variant)
            .ok_or_else(|| anyhow!("no kernel registered for variant {variant}"))?;
        let mut config = match (variant, self.tile_size, self.blocks.as_deref()) {
            (Variant::Tiled, Some(tile), _) => KernelConfig::tiled(problem, tile, self.masking.into()),
            (Variant::BlockTiled, _, Some(&[bm, bn, bk, tm])) => {
                KernelConfig::block_tiled(problem, bm, bn, bk, tm)
            }
            _ => kernel.default_config(problem),
        };
        if let Tiling::SharedMemory { masking, .. } = &mut config.tiling {
            *masking = self.masking.into();
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Benchmark one kernel configuration.
    Bench {
        #[command(flatten)]
        problem: ProblemArgs,
        #[command(flatten)]
        kernel: KernelArgs,
        #[arg(long, default_value_t = 4)]
        iterations: usize,
        #[arg(long, default_value_t = 1)]
        warmup: usize,
        #[arg(long, default_value_t = false)]
        no_verify: bool,
        #[arg(long, default_value_t = tileforge_kernels::DEFAULT_SEED)]
        seed: u64,
        /// Write the report as JSON.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the rendered shader source for a configuration.
    Emit {
        #[command(flatten)]
        problem: ProblemArgs,
        #[command(flatten)]
        kernel: KernelArgs,
    },
    /// Run every variant over the evaluation cases and emit a JSON report.
    Suite {
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        baseline: Option<PathBuf>,
        #[arg(long, default_value_t = 3)]
        iterations: usize,
    },
    /// Sweep candidate tilings and keep the fastest per variant.
    Tune {
        #[command(flatten)]
        problem: ProblemArgs,
        /// Variant to tune; all variants when omitted.
        #[arg(long, value_enum)]
        variant: Option<VariantArg>,
        #[arg(long)]
        autotune_cache: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        autotune_warmup: usize,
        #[arg(long, default_value_t = 5)]
        autotune_runs: usize,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli { backend, command } = cli;

    if let Command::Emit { problem, kernel } = &command {
        return emit(problem, kernel);
    }

    match backend {
        BackendArg::Gpu => run_with(WgpuBackend::new()?, command),
        BackendArg::Sim => run_with(SimBackend::new(), command),
    }
}

/// Prints the rendered shader; needs no device.
fn emit(problem: &ProblemArgs, kernel: &KernelArgs) -> Result<()> {
    let registry = KernelRegistry::with_default_kernels();
    let config = kernel.config(&registry, problem.problem())?;
    let source = registry
        .find(config.variant())
        .ok_or_else(|| anyhow!("no kernel registered for variant {}", config.variant()))?
        .render(&config)?;
    println!("// workgroup {} grid {}", config.workgroup, source.grid);
    println!("{}", source.code.source());
    Ok(())
}

fn run_with<B: ComputeBackend>(backend: B, command: Command) -> Result<()> {
    match command {
        Command::Bench {
            problem,
            kernel,
            iterations,
            warmup,
            no_verify,
            seed,
            output,
        } => {
            let options = SessionOptions {
                iterations,
                warmup_iterations: warmup,
                verify: !no_verify,
                seed,
                ..SessionOptions::default()
            };
            let ctx = BenchContext::new(backend, options);
            let config = kernel.config(ctx.registry(), problem.problem())?;
            let report = ctx.benchmark(&config)?;
            println!("{report}");

            if let Some(path) = output {
                fs::write(path, serde_json::to_string_pretty(&report)?)?;
            }
            ctx.teardown();
        }
        Command::Emit { problem, kernel } => emit(&problem, &kernel)?,
        Command::Suite {
            output,
            baseline,
            iterations,
        } => {
            let options = SessionOptions {
                iterations,
                ..SessionOptions::default()
            };
            let ctx = BenchContext::new(backend, options);
            let report = EvaluationSuite::default_suite().run(&ctx)?;

            println!(
                "backend={}, cases={}, generated_at={}",
                report.backend,
                report.cases.len(),
                report.generated_at_unix_ms
            );
            for case in &report.cases {
                println!(
                    "- {}: latency_ms={:.3} gflops={:.3} max_abs_error={:.3e} {}",
                    case.key(),
                    case.latency_ms,
                    case.gflops,
                    case.max_abs_error,
                    if case.passed { "PASS" } else { "FAIL" }
                );
            }

            if let Some(path) = baseline {
                if path.exists() {
                    let baseline_blob = fs::read_to_string(&path)?;
                    let baseline_report: EvaluationReport = serde_json::from_str(&baseline_blob)?;
                    for (name, delta) in report.diff(&baseline_report) {
                        println!(
                            "Δ {}: latency_ms={:+.3} gflops={:+.3}",
                            name, delta.latency_ms_delta, delta.gflops_delta
                        );
                    }
                } else {
                    info!(path = %path.display(), "baseline report not found; skipping diff");
                }
            }

            if let Some(path) = output {
                fs::write(path, serde_json::to_string_pretty(&report)?)?;
            }
            ctx.teardown();
        }
        Command::Tune {
            problem,
            variant,
            autotune_cache,
            autotune_warmup,
            autotune_runs,
        } => {
            let cache = match &autotune_cache {
                Some(path) => AutotuneCache::load_from_file(path)?,
                None => AutotuneCache::new(),
            };
            let mut tuner = Autotuner::new(cache).with_runs(autotune_warmup, autotune_runs);
            let ctx = BenchContext::new(backend, SessionOptions::default());
            let problem = problem.problem();
            let variants = match variant {
                Some(variant) => vec![Variant::from(variant)],
                None => Variant::ALL.to_vec(),
            };

            for variant in variants {
                let kernel = ctx
                    .registry()
                    .find(variant)
                    .ok_or_else(|| anyhow!("no kernel registered for variant {variant}"))?;
                let profile = tune_kernel(&ctx, &mut tuner, kernel.as_ref(), problem)?;
                println!("{}", serde_json::to_string_pretty(&profile)?);
            }

            if let Some(path) = autotune_cache {
                tuner.cache().save_to_file(&path)?;
            }
            ctx.teardown();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bench_with_block_parameters() {
        let cli = Cli::try_parse_from([
            "tileforge", "--backend", "sim", "bench", "--preset", "small", "--variant",
            "block-tiled", "--blocks", "64", "32", "8", "8",
        ])
        .unwrap();
        let Command::Bench {
            problem, kernel, ..
        } = cli.command
        else {
            panic!("expected bench");
        };
        let config = kernel
            .config(&KernelRegistry::with_default_kernels(), problem.problem())
            .unwrap();
        assert_eq!(config, KernelConfig::block_tiled(ProblemPreset::Small.problem(), 64, 32, 8, 8));
    }

    #[test]
    fn tiled_defaults_to_registry_tile() {
        let cli = Cli::try_parse_from(["tileforge", "emit", "--variant", "tiled", "--m", "17"]).unwrap();
        let Command::Emit { problem, kernel } = cli.command else {
            panic!("expected emit");
        };
        let config = kernel
            .config(&KernelRegistry::with_default_kernels(), problem.problem())
            .unwrap();
        assert_eq!(config.workgroup.volume(), 256);
        assert!(config.needs_masking());
    }

    #[test]
    fn run_with_sim_benchmarks_and_writes_json() {
        let path = std::env::temp_dir().join(format!("tileforge-bench-{}.json", std::process::id()));
        let cli = Cli::try_parse_from([
            "tileforge",
            "--backend",
            "sim",
            "bench",
            "--variant",
            "tiled",
            "--tile-size",
            "4",
            "--output",
            path.to_str().unwrap(),
        ])
        .unwrap();
        run_with(SimBackend::new(), cli.command).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["verification"]["status"], "Passed");
        fs::remove_file(path).unwrap();
    }
}
