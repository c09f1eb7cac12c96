//! wgpu implementation of the compute backend.
//!
//! wgpu maps to Metal on macOS and Vulkan/DX12 elsewhere. Each compiled kernel
//! owns one command encoder; a dispatch consumes it and `reset` records a
//! fresh one, so a kernel can only have one submission in flight.

use bytemuck::cast_slice;
use pollster::block_on;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use tileforge_kernels::{
    completion_pair, BackendError, BackendInfo, ComputeBackend, DeviceLimits, DispatchTicket,
    KernelConfig, Precision, Shape, ShaderCode,
};
use tracing::{debug, error, info, trace};
use wgpu::util::DeviceExt;

/// Device buffer holding one matrix.
#[derive(Debug)]
pub struct GpuTensor {
    label: String,
    rows: usize,
    cols: usize,
    precision: Precision,
    buffer: wgpu::Buffer,
}

impl GpuTensor {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }
}

#[derive(Debug)]
pub struct GpuKernel {
    label: String,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    grid: Shape,
    encoder: Option<wgpu::CommandEncoder>,
}

impl GpuKernel {
    pub fn grid(&self) -> Shape {
        self.grid
    }
}

/// In-flight submission of a [`GpuKernel`].
#[derive(Debug)]
#[must_use = "a dispatch ticket must be waited on"]
pub struct GpuTicket {
    ticket: DispatchTicket,
    submission: wgpu::SubmissionIndex,
}

impl GpuTicket {
    pub fn id(&self) -> u64 {
        self.ticket.id()
    }
}

/// Maps wgpu limits onto the ones kernel configurations are checked against.
///
/// The WGSL front end of wgpu 0.19 rejects `enable f16;`, so F16 kernels are
/// refused up front whatever the adapter advertises.
pub fn device_limits(limits: &wgpu::Limits) -> DeviceLimits {
    DeviceLimits {
        max_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
        max_workgroup_size: [
            limits.max_compute_workgroup_size_x,
            limits.max_compute_workgroup_size_y,
            limits.max_compute_workgroup_size_z,
        ],
        max_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
        max_workgroup_storage_bytes: limits.max_compute_workgroup_storage_size,
        max_storage_binding_bytes: (limits.max_storage_buffer_binding_size as u64)
            .min(limits.max_buffer_size),
        supports_f16: false,
    }
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: BackendInfo,
    limits: DeviceLimits,
    next_dispatch: AtomicU64,
}

impl WgpuBackend {
    /// Acquires a high-performance adapter and a device with its full limits.
    pub fn new() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::default();
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(BackendError::NoAdapter)?;

        let adapter_info = adapter.get_info();
        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("tileforge device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
            },
            None,
        ))
        .map_err(|err| BackendError::DeviceRequest(err.to_string()))?;

        device.on_uncaptured_error(Box::new(|err| {
            error!(error = %err, "uncaptured wgpu error");
        }));

        let limits = device_limits(&device.limits());

        let info = BackendInfo {
            name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend),
        };
        info!(
            adapter = %info.name,
            backend = %info.backend,
            f16 = limits.supports_f16,
            "acquired gpu device"
        );

        Ok(Self {
            device,
            queue,
            info,
            limits,
            next_dispatch: AtomicU64::new(0),
        })
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn pop_error_scope(&self) -> Option<wgpu::Error> {
        block_on(self.device.pop_error_scope())
    }
}

/// Host values encoded at `precision`, ready for upload.
pub fn encode(precision: Precision, values: &[f32]) -> Vec<u8> {
    match precision {
        Precision::F32 => cast_slice(values).to_vec(),
        Precision::F16 => {
            let halves: Vec<half::f16> = values.iter().map(|v| half::f16::from_f32(*v)).collect();
            cast_slice(&halves).to_vec()
        }
    }
}

/// First `len` elements of a device buffer, widened to f32.
pub fn decode(precision: Precision, bytes: &[u8], len: usize) -> Vec<f32> {
    let bytes = &bytes[..(len * precision.element_size_bytes()).min(bytes.len())];
    match precision {
        Precision::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(bytes),
        Precision::F16 => bytemuck::pod_collect_to_vec::<u8, half::f16>(bytes)
            .into_iter()
            .map(half::f16::to_f32)
            .collect(),
    }
}

fn padded_size(bytes: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    bytes.div_ceil(align).max(1) * align
}

impl ComputeBackend for WgpuBackend {
    type Tensor = GpuTensor;
    type Kernel = GpuKernel;
    type Ticket = GpuTicket;

    fn info(&self) -> BackendInfo {
        self.info.clone()
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
    ) -> Result<GpuTensor, BackendError> {
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
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = match data {
            Some(values) if values.len() != len => {
                // Balance the scopes before bailing out.
                let _ = self.pop_error_scope();
                let _ = self.pop_error_scope();
                return Err(BackendError::Allocation(format!(
                    "{label}: upload of {} elements into a {rows} x {cols} tensor",
                    values.len()
                )));
            }
            Some(values) => self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: &encode(precision, values),
                    usage,
                }),
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: padded_size(bytes),
                usage,
                mapped_at_creation: false,
            }),
        };
        let validation = self.pop_error_scope();
        let out_of_memory = self.pop_error_scope();
        if let Some(err) = validation.or(out_of_memory) {
            return Err(BackendError::Allocation(format!("{label}: {err}")));
        }

        debug!(label, rows, cols, precision = %precision, bytes, "allocated gpu tensor");
        Ok(GpuTensor {
            label: label.to_string(),
            rows,
            cols,
            precision,
            buffer,
        })
    }

    fn compile(
        &self,
        config: &KernelConfig,
        code: &ShaderCode,
        bindings: &[&GpuTensor],
        grid: Shape,
    ) -> Result<GpuKernel, BackendError> {
        if code.workgroup() != config.workgroup {
            return Err(BackendError::Compilation(format!(
                "source declares workgroup {} but the configuration expects {}",
                code.workgroup(),
                config.workgroup
            )));
        }
        let problem = &config.problem;
        let label = format!("{}[{}x{}x{}]", config.variant(), problem.m, problem.k, problem.n);

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(code.source().into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&label),
                layout: None,
                module: &module,
                entry_point: "main",
            });
        let entries: Vec<wgpu::BindGroupEntry<'_>> = bindings
            .iter()
            .enumerate()
            .map(|(binding, tensor)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: tensor.buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&label),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });
        if let Some(err) = self.pop_error_scope() {
            return Err(BackendError::Compilation(err.to_string()));
        }

        info!(
            kernel = %label,
            workgroup = %config.workgroup,
            grid = %grid,
            "compiled gpu kernel"
        );
        let encoder = self.encoder(&label);
        Ok(GpuKernel {
            label,
            pipeline,
            bind_group,
            grid,
            encoder: Some(encoder),
        })
    }

    fn dispatch(&self, kernel: &mut GpuKernel) -> Result<GpuTicket, BackendError> {
        let mut encoder = kernel
            .encoder
            .take()
            .ok_or_else(|| BackendError::RecorderNotReset(kernel.label.clone()))?;
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&kernel.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &kernel.bind_group, &[]);
            pass.dispatch_workgroups(kernel.grid.x, kernel.grid.y, kernel.grid.z);
        }

        let id = self.next_dispatch.fetch_add(1, Ordering::Relaxed);
        let (signal, ticket) = completion_pair(id);
        let submission = self.queue.submit(Some(encoder.finish()));
        self.queue
            .on_submitted_work_done(move || signal.fire(Ok(())));

        trace!(kernel = %kernel.label, dispatch = id, "submitted");
        Ok(GpuTicket { ticket, submission })
    }

    fn wait(&self, ticket: GpuTicket) -> Result<(), BackendError> {
        let GpuTicket { ticket, submission } = ticket;
        self.device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(submission));
        ticket.wait()
    }

    fn reset(&self, kernel: &mut GpuKernel) -> Result<(), BackendError> {
        kernel.encoder = Some(self.encoder(&kernel.label));
        Ok(())
    }

    fn to_host(&self, tensor: &GpuTensor) -> Result<Vec<f32>, BackendError> {
        let size = tensor.buffer.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.encoder("readback");
        encoder.copy_buffer_to_buffer(&tensor.buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| BackendError::Readback("map callback dropped".into()))?
            .map_err(|err| BackendError::Readback(format!("{}: {err}", tensor.label)))?;

        let data = slice.get_mapped_range();
        let values = decode(tensor.precision, &data, tensor.rows * tensor.cols);
        drop(data);
        staging.unmap();
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f16_encoding_halves_the_byte_count() {
        let values = [1.0f32, -2.5, 0.125];
        let bytes = encode(Precision::F16, &values);
        assert_eq!(bytes.len(), 6);
        assert_eq!(decode(Precision::F16, &bytes, 3), values.to_vec());
    }

    #[test]
    fn decode_ignores_copy_padding() {
        let mut bytes = encode(Precision::F16, &[3.0]);
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(decode(Precision::F16, &bytes, 1), vec![3.0]);
        assert_eq!(decode(Precision::F32, &encode(Precision::F32, &[7.0]), 1), vec![7.0]);
    }

    #[test]
    fn buffer_sizes_are_copy_aligned() {
        assert_eq!(padded_size(6), 8);
        assert_eq!(padded_size(0), wgpu::COPY_BUFFER_ALIGNMENT);
        assert_eq!(padded_size(16), 16);
    }

    #[test]
    fn mapped_limits_refuse_f16_kernels() {
        use tileforge_kernels::{ConfigError, MatmulKernel, MatmulProblem, TiledMatmul};

        let limits = device_limits(&wgpu::Limits::default());
        assert_eq!(limits.max_invocations_per_workgroup, 256);
        assert!(!limits.supports_f16);

        let tiled = TiledMatmul::new();
        let problem = MatmulProblem::new(16, 4, 8);
        let source = tiled.render(&tiled.default_config(problem)).unwrap();
        assert!(limits.check(&source.config, source.grid).is_ok());

        let half = problem.with_precision(Precision::F16);
        let source = tiled.render(&tiled.default_config(half)).unwrap();
        assert!(matches!(
            limits.check(&source.config, source.grid),
            Err(ConfigError::UnsupportedPrecision(_))
        ));
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn recorder_must_be_reset_between_dispatches() {
        use tileforge_kernels::{MatmulKernel, MatmulProblem, NaiveMatmul};

        let backend = WgpuBackend::new().unwrap();
        let problem = MatmulProblem::new(16, 4, 8);
        let naive = NaiveMatmul::new();
        let source = naive.render(&naive.default_config(problem)).unwrap();
        let a = backend
            .create_tensor("A", 16, 4, Precision::F32, Some(&[1.0; 64]))
            .unwrap();
        let b = backend
            .create_tensor("B", 8, 4, Precision::F32, Some(&[2.0; 32]))
            .unwrap();
        let c = backend.create_tensor("C", 16, 8, Precision::F32, None).unwrap();
        let mut kernel = backend
            .compile(&source.config, &source.code, &[&a, &b, &c], source.grid)
            .unwrap();

        let ticket = backend.dispatch(&mut kernel).unwrap();
        assert!(matches!(
            backend.dispatch(&mut kernel),
            Err(BackendError::RecorderNotReset(_))
        ));
        backend.wait(ticket).unwrap();
        backend.reset(&mut kernel).unwrap();
        backend.wait(backend.dispatch(&mut kernel).unwrap()).unwrap();

        assert!(backend.to_host(&c).unwrap().iter().all(|v| *v == 8.0));
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn invalid_source_is_a_compilation_error() {
        use tileforge_kernels::{MatmulKernel, MatmulProblem, NaiveMatmul};

        let backend = WgpuBackend::new().unwrap();
        let problem = MatmulProblem::new(4, 4, 4);
        let naive = NaiveMatmul::new();
        let config = naive.default_config(problem);
        let broken = ShaderCode::new("@compute fn main( {", config.workgroup);
        let a = backend.create_tensor("A", 4, 4, Precision::F32, None).unwrap();
        let b = backend.create_tensor("B", 4, 4, Precision::F32, None).unwrap();
        let c = backend.create_tensor("C", 4, 4, Precision::F32, None).unwrap();
        assert!(matches!(
            backend.compile(&config, &broken, &[&a, &b, &c], Shape::linear(1)),
            Err(BackendError::Compilation(_))
        ));
    }
}
