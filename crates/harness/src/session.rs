//! Bench session orchestration.
//!
//! A [`BenchContext`] owns a backend and a kernel registry. Each run goes
//! through `prepare_run` (render + allocate + compile once), any number of
//! `run_iterations` calls, optional readback, and `teardown`.

use crate::report::BenchReport;
use crate::verifier::{VerificationResult, VerificationTolerance, Verifier};
use anyhow::{anyhow, bail, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tileforge_kernels::{
    format_matrix, random_operands, BackendInfo, ComputeBackend, KernelConfig, KernelRegistry,
    KernelSource, MatmulInputs, MatmulProblem, DEFAULT_SEED,
};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Timed dispatches per run.
    pub iterations: usize,
    /// Untimed dispatches before the timed loop.
    pub warmup_iterations: usize,
    pub verify: bool,
    /// Tolerance override; by default derived from the problem precision.
    pub tolerance: Option<VerificationTolerance>,
    pub seed: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            iterations: 4,
            warmup_iterations: 1,
            verify: true,
            tolerance: None,
            seed: DEFAULT_SEED,
        }
    }
}

impl SessionOptions {
    pub fn verifier_for(&self, problem: &MatmulProblem) -> Verifier {
        Verifier::with_tolerance(
            self.tolerance
                .unwrap_or_else(|| VerificationTolerance::for_precision(problem.precision)),
        )
    }
}

/// Lifecycle of one kernel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Unconfigured,
    /// Source rendered and kernel compiled.
    Configured,
    /// Dispatches in flight or being awaited.
    Running,
    /// Timing available.
    Completed,
    /// Backend resources released.
    TornDown,
}

impl RunState {
    pub fn can_advance_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Unconfigured, Configured)
                | (Configured, Running)
                | (Completed, Running)
                | (Running, Completed)
                | (Configured | Running | Completed, TornDown)
        )
    }

    fn advance(&mut self, next: RunState) -> Result<()> {
        if !self.can_advance_to(next) {
            bail!("illegal run transition {self:?} -> {next:?}");
        }
        *self = next;
        Ok(())
    }
}

/// Wall-clock timing of a sequence of dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunTiming {
    pub problem: MatmulProblem,
    pub iterations: usize,
    pub elapsed: Duration,
}

impl RunTiming {
    pub fn latency_per_dispatch_ms(&self) -> f64 {
        if self.iterations == 0 {
            return 0.0;
        }
        self.elapsed.as_secs_f64() * 1000.0 / self.iterations as f64
    }

    /// `2 * M * N * K * iterations / seconds / 1e9`.
    pub fn gflops(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.problem.flops() * self.iterations as f64 / secs / 1e9
    }

    pub fn bandwidth_gbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.problem.data_footprint_bytes() as f64 * self.iterations as f64 / secs / 1e9
    }
}

/// Tensors bound to a kernel, in binding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    A,
    B,
    C,
}

struct RunResources<B: ComputeBackend> {
    a: B::Tensor,
    b: B::Tensor,
    c: B::Tensor,
    kernel: B::Kernel,
}

/// A compiled kernel with its tensors, bound to the context that created it.
pub struct PreparedRun<'ctx, B: ComputeBackend> {
    backend: &'ctx B,
    source: KernelSource,
    kernel_name: &'static str,
    resources: Option<RunResources<B>>,
    state: RunState,
    dispatches: u64,
}

impl<'ctx, B: ComputeBackend> PreparedRun<'ctx, B> {
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &KernelConfig {
        &self.source.config
    }

    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel_name
    }

    /// Total dispatches issued, warmup included.
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    fn resources(&mut self) -> Result<&mut RunResources<B>> {
        self.resources
            .as_mut()
            .ok_or_else(|| anyhow!("run for {} has been torn down", self.kernel_name))
    }

    /// One dispatch: submit, block on its completion, re-arm the recorder.
    fn dispatch_once(&mut self) -> Result<()> {
        let backend = self.backend;
        let resources = self.resources()?;
        let ticket = backend.dispatch(&mut resources.kernel)?;
        backend.wait(ticket)?;
        backend.reset(&mut resources.kernel)?;
        self.dispatches += 1;
        Ok(())
    }

    fn dispatch_n(&mut self, n: usize) -> Result<RunTiming> {
        self.state.advance(RunState::Running)?;
        let start = Instant::now();
        for _ in 0..n {
            self.dispatch_once()?;
        }
        let elapsed = start.elapsed();
        self.state.advance(RunState::Completed)?;
        Ok(RunTiming {
            problem: self.source.config.problem,
            iterations: n,
            elapsed,
        })
    }

    /// Untimed dispatches to absorb first-submission costs.
    pub fn warm_up(&mut self, n: usize) -> Result<()> {
        if n > 0 {
            self.dispatch_n(n)?;
            debug!(kernel = self.kernel_name, iterations = n, "warmup complete");
        }
        Ok(())
    }

    /// Dispatches the kernel `n` times, strictly one at a time.
    pub fn run_iterations(&mut self, n: usize) -> Result<RunTiming> {
        let timing = self.dispatch_n(n)?;
        info!(
            kernel = self.kernel_name,
            m = timing.problem.m,
            k = timing.problem.k,
            n = timing.problem.n,
            iterations = n,
            latency_ms = timing.latency_per_dispatch_ms(),
            gflops = timing.gflops(),
            "run complete"
        );
        Ok(timing)
    }

    /// Blocking copy of one bound tensor back to the host.
    pub fn retrieve(&self, operand: Operand) -> Result<Array2<f32>> {
        let resources = self
            .resources
            .as_ref()
            .ok_or_else(|| anyhow!("run for {} has been torn down", self.kernel_name))?;
        let problem = &self.source.config.problem;
        let (tensor, shape) = match operand {
            Operand::A => (&resources.a, (problem.m, problem.k)),
            Operand::B => (&resources.b, (problem.n, problem.k)),
            Operand::C => (&resources.c, (problem.m, problem.n)),
        };
        let data = self.backend.to_host(tensor)?;
        Array2::from_shape_vec(shape, data)
            .map_err(|err| anyhow!("failed to shape device tensor {operand:?}: {err}"))
    }

    pub fn retrieve_output(&self) -> Result<Array2<f32>> {
        let output = self.retrieve(Operand::C)?;
        debug!("{}", format_matrix(output.view(), "Output"));
        Ok(output)
    }

    /// Releases the run's tensors and kernel.
    pub fn teardown(&mut self) -> Result<()> {
        self.state.advance(RunState::TornDown)?;
        self.resources = None;
        debug!(kernel = self.kernel_name, dispatches = self.dispatches, "run torn down");
        Ok(())
    }
}

/// Explicit context every bench operation runs against.
pub struct BenchContext<B: ComputeBackend> {
    backend: B,
    registry: KernelRegistry,
    options: SessionOptions,
}

impl<B: ComputeBackend> BenchContext<B> {
    pub fn new(backend: B, options: SessionOptions) -> Self {
        let info = backend.info();
        info!(device = %info.name, backend = %info.backend, "bench context created");
        Self {
            backend,
            registry: KernelRegistry::with_default_kernels(),
            options,
        }
    }

    pub fn with_registry(mut self, registry: KernelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn info(&self) -> BackendInfo {
        self.backend.info()
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Renders `config` with the registered kernel for its variant and prepares it.
    pub fn prepare_run(
        &self,
        config: &KernelConfig,
        inputs: &MatmulInputs<'_>,
    ) -> Result<PreparedRun<'_, B>> {
        let kernel = self
            .registry
            .find(config.variant())
            .ok_or_else(|| anyhow!("no kernel registered for variant {}", config.variant()))?;
        let source = kernel.render(config)?;
        self.prepare_source(kernel.name(), source, inputs)
    }

    /// Allocates tensors, uploads the operands and compiles `source` once.
    pub fn prepare_source(
        &self,
        kernel_name: &'static str,
        source: KernelSource,
        inputs: &MatmulInputs<'_>,
    ) -> Result<PreparedRun<'_, B>> {
        let config = source.config;
        let problem = config.problem;
        config.validate()?;
        inputs.validate(&problem)?;
        self.backend.limits().check(&config, source.grid)?;

        let a_host = inputs.a.as_standard_layout();
        let b_host = inputs.b.as_standard_layout();
        let backend = &self.backend;
        let precision = problem.precision;
        let a = backend.create_tensor("A", problem.m, problem.k, precision, a_host.as_slice())?;
        let b = backend.create_tensor("B", problem.n, problem.k, precision, b_host.as_slice())?;
        let c = backend.create_tensor("C", problem.m, problem.n, precision, None)?;
        let kernel = backend.compile(&config, &source.code, &[&a, &b, &c], source.grid)?;

        info!(
            kernel = kernel_name,
            m = problem.m,
            k = problem.k,
            n = problem.n,
            precision = %problem.precision,
            workgroup = %config.workgroup,
            grid = %source.grid,
            "kernel configured"
        );

        let mut state = RunState::default();
        state.advance(RunState::Configured)?;
        Ok(PreparedRun {
            backend,
            source,
            kernel_name,
            resources: Some(RunResources { a, b, c, kernel }),
            state,
            dispatches: 0,
        })
    }

    /// Full run for `config` on seeded random inputs.
    pub fn benchmark(&self, config: &KernelConfig) -> Result<BenchReport> {
        let problem = config.problem;
        let (a, b) = random_operands(problem.m, problem.k, problem.n, self.options.seed);
        debug!("{}", format_matrix(a.view(), "A"));
        debug!("{}", format_matrix(b.view(), "B"));
        let inputs = MatmulInputs::new(a.view(), b.view());
        self.benchmark_inputs(config, &inputs)
    }

    /// Full run for `config` on caller supplied inputs.
    pub fn benchmark_inputs(
        &self,
        config: &KernelConfig,
        inputs: &MatmulInputs<'_>,
    ) -> Result<BenchReport> {
        let mut run = self.prepare_run(config, inputs)?;
        let outcome = self.measure(&mut run, inputs);
        run.teardown()?;
        let (timing, verification) = outcome?;

        Ok(BenchReport::new(
            run.kernel_name(),
            *config,
            self.backend.info(),
            &timing,
            verification,
        ))
    }

    fn measure(
        &self,
        run: &mut PreparedRun<'_, B>,
        inputs: &MatmulInputs<'_>,
    ) -> Result<(RunTiming, Option<VerificationResult>)> {
        run.warm_up(self.options.warmup_iterations)?;
        let timing = run.run_iterations(self.options.iterations)?;
        let verification = if self.options.verify {
            let output = run.retrieve_output()?;
            let verifier = self.options.verifier_for(&run.config().problem);
            Some(verifier.verify(inputs, output.view()))
        } else {
            None
        };
        Ok((timing, verification))
    }

    /// Ends the context and releases the backend.
    pub fn teardown(self) -> B {
        info!(device = %self.backend.info().name, "bench context torn down");
        self.backend
    }
}
