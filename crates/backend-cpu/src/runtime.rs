//! Simulator backend: the backend contract executed on host threads.

use crate::program::WorkgroupProgram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use tileforge_kernels::{
    completion_pair, BackendError, BackendInfo, BarrierPolicy, ComputeBackend, DeviceLimits,
    DispatchTicket, KernelConfig, Precision, Shape, ShaderCode,
};
use tracing::{debug, trace};

/// Host-resident buffer standing in for a device tensor.
#[derive(Debug, Clone)]
pub struct SimTensor {
    label: Arc<str>,
    rows: usize,
    cols: usize,
    precision: Precision,
    data: Arc<RwLock<Vec<f32>>>,
}

impl SimTensor {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }
}

#[derive(Debug)]
pub struct SimKernel {
    label: String,
    program: Arc<WorkgroupProgram>,
    a: SimTensor,
    b: SimTensor,
    c: SimTensor,
    recorder_ready: bool,
}

impl SimKernel {
    /// Barriers found in the compiled source.
    pub fn barriers(&self) -> BarrierPolicy {
        self.program.barriers()
    }

    pub fn grid(&self) -> Shape {
        self.program.grid()
    }
}

#[derive(Debug)]
pub struct SimBackend {
    limits: DeviceLimits,
    next_dispatch: AtomicU64,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits {
            supports_f16: true,
            ..DeviceLimits::default()
        })
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            next_dispatch: AtomicU64::new(0),
        }
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn round_to(precision: Precision, value: f32) -> f32 {
    match precision {
        Precision::F32 => value,
        Precision::F16 => half::f16::from_f32(value).to_f32(),
    }
}

fn execute(
    program: &WorkgroupProgram,
    a: &SimTensor,
    b: &SimTensor,
    c: &SimTensor,
) -> Result<(), String> {
    let a_data = a.data.read().map_err(|_| "tensor A lock poisoned".to_string())?;
    let b_data = b.data.read().map_err(|_| "tensor B lock poisoned".to_string())?;
    let mut c_data = c
        .data
        .write()
        .map_err(|_| "tensor C lock poisoned".to_string())?;
    program.execute(&a_data, &b_data, &mut c_data)?;
    if c.precision == Precision::F16 {
        for value in c_data.iter_mut() {
            *value = round_to(Precision::F16, *value);
        }
    }
    Ok(())
}

impl ComputeBackend for SimBackend {
    type Tensor = SimTensor;
    type Kernel = SimKernel;
    type Ticket = DispatchTicket;

    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "workgroup simulator".to_string(),
            backend: "cpu".to_string(),
        }
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_tensor(
        &self,
        label: &str,
        rows: usize,
        cols: usize,
        precision: Precision,
        data: Option<&[f32]>,
    ) -> Result<SimTensor, BackendError> {
        let len = rows.checked_mul(cols).ok_or_else(|| {
            BackendError::Allocation(format!("{label}: {rows} x {cols} overflows"))
        })?;
        let bytes = len as u64 * precision.element_size_bytes() as u64;
        if bytes > self.limits.max_storage_binding_bytes {
            return Err(BackendError::Allocation(format!(
                "{label}: {bytes} bytes exceeds the {} byte binding limit",
                self.limits.max_storage_binding_bytes
            )));
        }

        let contents = match data {
            Some(values) if values.len() != len => {
                return Err(BackendError::Allocation(format!(
                    "{label}: upload of {} elements into a {rows} x {cols} tensor",
                    values.len()
                )));
            }
            Some(values) => values.iter().map(|v| round_to(precision, *v)).collect(),
            None => vec![0.0; len],
        };

        debug!(label, rows, cols, precision = %precision, "allocated simulator tensor");
        Ok(SimTensor {
            label: Arc::from(label),
            rows,
            cols,
            precision,
            data: Arc::new(RwLock::new(contents)),
        })
    }

    fn compile(
        &self,
        config: &KernelConfig,
        code: &ShaderCode,
        bindings: &[&SimTensor],
        grid: Shape,
    ) -> Result<SimKernel, BackendError> {
        let source = code.source();
        if !source.contains("@compute") || !source.contains("fn main") {
            return Err(BackendError::Compilation(
                "source has no `main` compute entry point".into(),
            ));
        }
        if let Some(offset) = source.find("{{") {
            return Err(BackendError::Compilation(format!(
                "unexpected token `{{{{` at byte {offset}"
            )));
        }
        if code.workgroup() != config.workgroup {
            return Err(BackendError::Compilation(format!(
                "source declares workgroup {} but the configuration expects {}",
                code.workgroup(),
                config.workgroup
            )));
        }

        let [a, b, c] = bindings else {
            return Err(BackendError::Compilation(format!(
                "expected 3 bindings, got {}",
                bindings.len()
            )));
        };
        let problem = &config.problem;
        for (tensor, expected) in [
            (a, (problem.m, problem.k)),
            (b, (problem.n, problem.k)),
            (c, (problem.m, problem.n)),
        ] {
            if tensor.shape() != expected {
                return Err(BackendError::Compilation(format!(
                    "binding `{}` is {:?}, kernel expects {:?}",
                    tensor.label(),
                    tensor.shape(),
                    expected
                )));
            }
        }

        let barriers = BarrierPolicy::from_source(source);
        let label = format!("{}[{}x{}x{}]", config.variant(), problem.m, problem.k, problem.n);
        debug!(
            kernel = %label,
            workgroup = %config.workgroup,
            grid = %grid,
            tile_loaded = barriers.tile_loaded,
            tile_consumed = barriers.tile_consumed,
            "compiled simulator kernel"
        );

        Ok(SimKernel {
            label,
            program: Arc::new(WorkgroupProgram::new(*config, grid, barriers)),
            a: (*a).clone(),
            b: (*b).clone(),
            c: (*c).clone(),
            recorder_ready: true,
        })
    }

    fn dispatch(&self, kernel: &mut SimKernel) -> Result<DispatchTicket, BackendError> {
        if !kernel.recorder_ready {
            return Err(BackendError::RecorderNotReset(kernel.label.clone()));
        }
        kernel.recorder_ready = false;

        let id = self.next_dispatch.fetch_add(1, Ordering::Relaxed);
        let (signal, ticket) = completion_pair(id);
        let program = Arc::clone(&kernel.program);
        let (a, b, c) = (kernel.a.clone(), kernel.b.clone(), kernel.c.clone());

        thread::Builder::new()
            .name(format!("sim-dispatch-{id}"))
            .spawn(move || {
                let outcome = execute(&program, &a, &b, &c);
                signal.fire(outcome);
            })
            .map_err(|err| BackendError::Dispatch(err.to_string()))?;

        trace!(kernel = %kernel.label, dispatch = id, "submitted");
        Ok(ticket)
    }

    fn wait(&self, ticket: DispatchTicket) -> Result<(), BackendError> {
        ticket.wait()
    }

    fn reset(&self, kernel: &mut SimKernel) -> Result<(), BackendError> {
        kernel.recorder_ready = true;
        Ok(())
    }

    fn to_host(&self, tensor: &SimTensor) -> Result<Vec<f32>, BackendError> {
        tensor
            .data
            .read()
            .map(|data| data.clone())
            .map_err(|_| BackendError::Readback(format!("{} lock poisoned", tensor.label())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tileforge_kernels::{
        drop_barrier, BarrierSite, MatmulKernel, MatmulProblem, NaiveMatmul, TiledMatmul,
    };

    fn compile_tiny(
        backend: &SimBackend,
        code_override: Option<ShaderCode>,
    ) -> (SimKernel, SimTensor) {
        let problem = MatmulProblem::new(4, 8, 4);
        let kernel = TiledMatmul::with_tile_size(2);
        let source = kernel.render(&kernel.default_config(problem)).unwrap();
        let a = backend
            .create_tensor("A", 4, 8, Precision::F32, Some(&[1.0; 32]))
            .unwrap();
        let b = backend
            .create_tensor("B", 4, 8, Precision::F32, Some(&[0.5; 32]))
            .unwrap();
        let c = backend.create_tensor("C", 4, 4, Precision::F32, None).unwrap();
        let code = code_override.unwrap_or(source.code);
        let compiled = backend
            .compile(&source.config, &code, &[&a, &b, &c], source.grid)
            .unwrap();
        (compiled, c)
    }

    #[test]
    fn dispatch_wait_reset_cycle() {
        let backend = SimBackend::new();
        let (mut kernel, c) = compile_tiny(&backend, None);
        for _ in 0..3 {
            let ticket = backend.dispatch(&mut kernel).unwrap();
            backend.wait(ticket).unwrap();
            backend.reset(&mut kernel).unwrap();
        }
        for value in backend.to_host(&c).unwrap() {
            assert_abs_diff_eq!(value, 4.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn second_dispatch_without_reset_is_rejected() {
        let backend = SimBackend::new();
        let (mut kernel, _) = compile_tiny(&backend, None);
        let ticket = backend.dispatch(&mut kernel).unwrap();
        assert!(matches!(
            backend.dispatch(&mut kernel),
            Err(BackendError::RecorderNotReset(_))
        ));
        backend.wait(ticket).unwrap();
    }

    #[test]
    fn compile_reads_barriers_from_source() {
        let backend = SimBackend::new();
        let (kernel, _) = compile_tiny(&backend, None);
        assert_eq!(kernel.barriers(), BarrierPolicy::FULL);

        let problem = MatmulProblem::new(4, 8, 4);
        let source = TiledMatmul::with_tile_size(2)
            .render(&KernelConfig::tiled(problem, 2, Default::default()))
            .unwrap();
        let mutated = drop_barrier(&source.code, BarrierSite::TileConsumed).unwrap();
        let (kernel, _) = compile_tiny(&backend, Some(mutated));
        assert!(!kernel.barriers().tile_consumed);
    }

    #[test]
    fn compile_rejects_wrong_binding_count_and_leftover_placeholders() {
        let backend = SimBackend::new();
        let problem = MatmulProblem::new(4, 4, 4);
        let naive = NaiveMatmul::new();
        let source = naive.render(&naive.default_config(problem)).unwrap();
        let a = backend.create_tensor("A", 4, 4, Precision::F32, None).unwrap();
        assert!(matches!(
            backend.compile(&source.config, &source.code, &[&a], source.grid),
            Err(BackendError::Compilation(_))
        ));

        let broken = ShaderCode::new("@compute fn main() { {{M}} }", source.code.workgroup());
        assert!(matches!(
            backend.compile(&source.config, &broken, &[&a, &a, &a], source.grid),
            Err(BackendError::Compilation(_))
        ));
    }

    #[test]
    fn upload_length_must_match_shape() {
        let backend = SimBackend::new();
        assert!(matches!(
            backend.create_tensor("A", 2, 2, Precision::F32, Some(&[1.0; 3])),
            Err(BackendError::Allocation(_))
        ));
    }

    #[test]
    fn f16_tensors_round_on_upload() {
        let backend = SimBackend::new();
        let tensor = backend
            .create_tensor("A", 1, 1, Precision::F16, Some(&[0.1]))
            .unwrap();
        let value = backend.to_host(&tensor).unwrap()[0];
        assert_eq!(value, half::f16::from_f32(0.1).to_f32());
        assert_ne!(value, 0.1);
    }
}
