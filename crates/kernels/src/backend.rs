//! Contract between the dispatch harness and a compute backend.
//!
//! A backend owns device acquisition, buffer allocation, pipeline compilation
//! and execution. Dispatch is asynchronous: it returns a ticket that must be
//! consumed by exactly one `wait` before the kernel's command recorder is reset
//! and reused.

use crate::config::{KernelConfig, MatmulProblem, Precision, Shape};
use crate::error::{BackendError, ConfigError};
use crate::template::ShaderCode;
use serde::{Deserialize, Serialize};
use std::sync::mpsc;

/// Description of the device a backend runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub name: String,
    pub backend: String,
}

/// Resource limits a kernel configuration has to respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub max_invocations_per_workgroup: u32,
    pub max_workgroup_size: [u32; 3],
    pub max_workgroups_per_dimension: u32,
    pub max_workgroup_storage_bytes: u32,
    pub max_storage_binding_bytes: u64,
    pub supports_f16: bool,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_invocations_per_workgroup: 256,
            max_workgroup_size: [256, 256, 64],
            max_workgroups_per_dimension: 65_535,
            max_workgroup_storage_bytes: 16_384,
            max_storage_binding_bytes: 128 << 20,
            supports_f16: false,
        }
    }
}

impl DeviceLimits {
    pub fn check(&self, config: &KernelConfig, grid: Shape) -> Result<(), ConfigError> {
        let wg = config.workgroup;
        let problem = &config.problem;

        exceeds(
            "workgroup invocations",
            wg.volume(),
            self.max_invocations_per_workgroup as u64,
        )?;
        for (what, value, limit) in [
            ("workgroup size x", wg.x, self.max_workgroup_size[0]),
            ("workgroup size y", wg.y, self.max_workgroup_size[1]),
            ("workgroup size z", wg.z, self.max_workgroup_size[2]),
            ("workgroups along x", grid.x, self.max_workgroups_per_dimension),
            ("workgroups along y", grid.y, self.max_workgroups_per_dimension),
            ("workgroups along z", grid.z, self.max_workgroups_per_dimension),
        ] {
            exceeds(what, value as u64, limit as u64)?;
        }

        let elem = problem.precision.element_size_bytes() as u64;
        exceeds(
            "workgroup storage bytes",
            config.scratch_elements() * elem,
            self.max_workgroup_storage_bytes as u64,
        )?;
        let largest = largest_operand_elements(problem) as u64 * elem;
        exceeds(
            "storage binding bytes",
            largest,
            self.max_storage_binding_bytes,
        )?;

        if problem.precision == Precision::F16 && !self.supports_f16 {
            return Err(ConfigError::UnsupportedPrecision(
                problem.precision.to_string(),
            ));
        }
        Ok(())
    }
}

fn exceeds(what: &'static str, value: u64, limit: u64) -> Result<(), ConfigError> {
    if value > limit {
        return Err(ConfigError::ExceedsDeviceLimit { what, value, limit });
    }
    Ok(())
}

fn largest_operand_elements(problem: &MatmulProblem) -> usize {
    (problem.m * problem.k)
        .max(problem.n * problem.k)
        .max(problem.m * problem.n)
}

/// Upstream compute backend. Implementations are single-owner: tensors and
/// kernels created by one backend belong to the run that created them.
pub trait ComputeBackend {
    type Tensor;
    type Kernel;
    type Ticket;

    fn info(&self) -> BackendInfo;

    fn limits(&self) -> DeviceLimits;

    /// Allocates a device tensor of `rows x cols` elements, uploading `data` if given.
    fn create_tensor(
        &self,
        label: &str,
        rows: usize,
        cols: usize,
        precision: Precision,
        data: Option<&[f32]>,
    ) -> Result<Self::Tensor, BackendError>;

    /// Compiles `code` with `bindings` in binding order and a fixed dispatch grid.
    fn compile(
        &self,
        config: &KernelConfig,
        code: &ShaderCode,
        bindings: &[&Self::Tensor],
        grid: Shape,
    ) -> Result<Self::Kernel, BackendError>;

    /// Submits one execution of `kernel` and returns immediately.
    fn dispatch(&self, kernel: &mut Self::Kernel) -> Result<Self::Ticket, BackendError>;

    /// Blocks until the dispatch behind `ticket` has completed.
    fn wait(&self, ticket: Self::Ticket) -> Result<(), BackendError>;

    /// Re-arms the kernel's command recorder for another submission.
    fn reset(&self, kernel: &mut Self::Kernel) -> Result<(), BackendError>;

    /// Blocking copy of `tensor` back to host memory, converted to f32.
    fn to_host(&self, tensor: &Self::Tensor) -> Result<Vec<f32>, BackendError>;
}

/// Sending half of a single-use completion channel.
#[derive(Debug)]
pub struct CompletionSignal {
    id: u64,
    sender: mpsc::SyncSender<Result<(), String>>,
}

impl CompletionSignal {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Reports the outcome of the dispatch. Consumes the signal.
    pub fn fire(self, outcome: Result<(), String>) {
        // The ticket may already be gone if the waiter gave up.
        let _ = self.sender.send(outcome);
    }
}

/// Receiving half: one in-flight dispatch, consumed by exactly one wait.
#[derive(Debug)]
#[must_use = "a dispatch ticket must be waited on"]
pub struct DispatchTicket {
    id: u64,
    receiver: mpsc::Receiver<Result<(), String>>,
}

impl DispatchTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn wait(self) -> Result<(), BackendError> {
        match self.receiver.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(detail)) => Err(BackendError::Wait {
                id: self.id,
                detail,
            }),
            Err(_) => Err(BackendError::Wait {
                id: self.id,
                detail: "completion signal dropped before firing".into(),
            }),
        }
    }
}

pub fn completion_pair(id: u64) -> (CompletionSignal, DispatchTicket) {
    let (sender, receiver) = mpsc::sync_channel(1);
    (
        CompletionSignal { id, sender },
        DispatchTicket { id, receiver },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Masking;

    #[test]
    fn ticket_receives_fired_signal_across_threads() {
        let (signal, ticket) = completion_pair(7);
        std::thread::spawn(move || signal.fire(Ok(())));
        assert!(ticket.wait().is_ok());
    }

    #[test]
    fn dropped_signal_fails_the_wait() {
        let (signal, ticket) = completion_pair(3);
        drop(signal);
        assert!(matches!(ticket.wait(), Err(BackendError::Wait { id: 3, .. })));
    }

    #[test]
    fn failed_dispatch_surfaces_detail() {
        let (signal, ticket) = completion_pair(1);
        signal.fire(Err("device lost".into()));
        let err = ticket.wait().unwrap_err();
        assert!(err.to_string().contains("device lost"));
    }

    #[test]
    fn limits_reject_oversized_workgroups() {
        let limits = DeviceLimits::default();
        let config = KernelConfig::tiled(MatmulProblem::new(64, 64, 64), 32, Masking::Auto);
        let err = limits.check(&config, Shape::linear(1)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ExceedsDeviceLimit {
                what: "workgroup invocations",
                value: 1024,
                ..
            }
        ));
    }

    #[test]
    fn limits_reject_f16_without_support() {
        let limits = DeviceLimits::default();
        let problem = MatmulProblem::new(16, 16, 16).with_precision(Precision::F16);
        let config = KernelConfig::tiled(problem, 16, Masking::Auto);
        assert!(matches!(
            limits.check(&config, Shape::linear(1)),
            Err(ConfigError::UnsupportedPrecision(_))
        ));
    }
}
