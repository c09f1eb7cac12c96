//! Evaluation suite for the matmul variants.
//!
//! Runs every registered variant over a handful of named problems, checks
//! each output against the host reference, and collects latency and
//! throughput in a JSON report that can be diffed against a baseline.

use crate::session::BenchContext;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tileforge_kernels::{
    random_operands, ComputeBackend, MatmulInputs, MatmulProblem, ProblemPreset, Variant,
};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatmulEvalCase {
    pub name: String,
    pub problem: MatmulProblem,
}

impl MatmulEvalCase {
    pub fn new(name: impl Into<String>, problem: MatmulProblem) -> Self {
        Self {
            name: name.into(),
            problem,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatmulEvalResult {
    pub case: String,
    pub kernel: String,
    pub variant: Variant,
    pub latency_ms: f64,
    pub gflops: f64,
    pub bandwidth_gbps: f64,
    pub max_abs_error: f32,
    pub passed: bool,
    pub problem: MatmulProblem,
}

impl MatmulEvalResult {
    /// Report key: case name and variant.
    pub fn key(&self) -> String {
        format!("{}/{}", self.case, self.variant)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub backend: String,
    pub generated_at_unix_ms: u128,
    pub cases: Vec<MatmulEvalResult>,
}

impl EvaluationReport {
    pub fn as_map(&self) -> BTreeMap<String, &MatmulEvalResult> {
        self.cases.iter().map(|case| (case.key(), case)).collect()
    }

    pub fn all_passed(&self) -> bool {
        self.cases.iter().all(|case| case.passed)
    }

    pub fn diff<'a>(
        &'a self,
        baseline: &'a EvaluationReport,
    ) -> BTreeMap<String, EvaluationDelta<'a>> {
        let mut deltas = BTreeMap::new();
        let previous = baseline.as_map();

        for (key, result) in self.as_map() {
            if let Some(&baseline_result) = previous.get(&key) {
                deltas.insert(
                    key,
                    EvaluationDelta {
                        current: result,
                        baseline: baseline_result,
                        latency_ms_delta: result.latency_ms - baseline_result.latency_ms,
                        gflops_delta: result.gflops - baseline_result.gflops,
                    },
                );
            }
        }

        deltas
    }
}

#[derive(Debug)]
pub struct EvaluationDelta<'a> {
    pub current: &'a MatmulEvalResult,
    pub baseline: &'a MatmulEvalResult,
    pub latency_ms_delta: f64,
    pub gflops_delta: f64,
}

pub struct EvaluationSuite {
    cases: Vec<MatmulEvalCase>,
    variants: Vec<Variant>,
}

impl EvaluationSuite {
    pub fn new(cases: Vec<MatmulEvalCase>) -> Self {
        Self {
            cases,
            variants: Variant::ALL.to_vec(),
        }
    }

    pub fn with_variants(mut self, variants: Vec<Variant>) -> Self {
        self.variants = variants;
        self
    }

    /// Tiny and small presets plus shapes no tile size divides.
    pub fn default_suite() -> Self {
        Self::new(vec![
            MatmulEvalCase::new("tiny", ProblemPreset::Tiny.problem()),
            MatmulEvalCase::new("ragged_17x33x9", MatmulProblem::new(17, 33, 9)),
            MatmulEvalCase::new("ragged_100x70x130", MatmulProblem::new(100, 70, 130)),
            MatmulEvalCase::new("small", ProblemPreset::Small.problem()),
        ])
    }

    pub fn cases(&self) -> &[MatmulEvalCase] {
        &self.cases
    }

    pub fn run<B: ComputeBackend>(&self, ctx: &BenchContext<B>) -> Result<EvaluationReport> {
        let mut results = Vec::with_capacity(self.cases.len() * self.variants.len());
        let seed = ctx.options().seed;

        for case in &self.cases {
            let problem = case.problem;
            let (a, b) = random_operands(problem.m, problem.k, problem.n, seed);
            let inputs = MatmulInputs::new(a.view(), b.view());

            for &variant in &self.variants {
                let kernel = ctx
                    .registry()
                    .find(variant)
                    .ok_or_else(|| anyhow!("no kernel registered for variant {variant}"))?;
                let config = kernel.default_config(problem);

                let mut run = ctx.prepare_run(&config, &inputs)?;
                run.warm_up(ctx.options().warmup_iterations)?;
                let timing = run.run_iterations(ctx.options().iterations.max(1))?;
                let output = run.retrieve_output()?;
                run.teardown()?;

                let verification = ctx
                    .options()
                    .verifier_for(&problem)
                    .verify(&inputs, output.view());
                info!(
                    case = %case.name,
                    kernel = kernel.name(),
                    latency_ms = timing.latency_per_dispatch_ms(),
                    gflops = timing.gflops(),
                    verdict = verification.label(),
                    "evaluated case"
                );

                results.push(MatmulEvalResult {
                    case: case.name.clone(),
                    kernel: kernel.name().to_string(),
                    variant,
                    latency_ms: timing.latency_per_dispatch_ms(),
                    gflops: timing.gflops(),
                    bandwidth_gbps: timing.bandwidth_gbps(),
                    max_abs_error: verification.max_abs_error(),
                    passed: verification.passed(),
                    problem,
                });
            }
        }

        let generated_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis();

        Ok(EvaluationReport {
            backend: ctx.info().backend,
            generated_at_unix_ms,
            cases: results,
        })
    }
}
