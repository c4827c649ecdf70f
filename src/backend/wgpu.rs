//! WebGPU compute backend
//!
//! Implements [`ComputeBackend`] on a wgpu device: storage/uniform buffers,
//! one compute pipeline per named kernel compiled at construction, one
//! command encoder per submitted batch, and readback through a staging
//! MAP_READ buffer. Device, queue, and every buffer are released by drop on
//! all exit paths, including failures.
//!
//! The f16 matmul pipeline is only built when the adapter offers
//! `SHADER_F16`; dispatching it without the feature fails the batch.

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::debug;

use crate::backend::{BufferId, BufferUsage, Command, ComputeBackend, Kernel};
use crate::error::{Error, Result};

const KERNELS: &[(Kernel, &str)] = &[
    (Kernel::BlockScore, include_str!("shaders/block_score.wgsl")),
    (
        Kernel::SoftmaxStatsUpdate,
        include_str!("shaders/softmax_stats.wgsl"),
    ),
    (
        Kernel::OutputAccumulate,
        include_str!("shaders/output_accum.wgsl"),
    ),
    (Kernel::MatmulF32, include_str!("shaders/matmul_f32.wgsl")),
];

const KERNEL_F16: (Kernel, &str) = (Kernel::MatmulF16, include_str!("shaders/matmul_f16.wgsl"));

/// Which storage bindings a kernel writes; everything else is read-only.
/// Must agree with the `var<storage, read_write>` declarations in the WGSL.
fn writable_bindings(kernel: Kernel) -> &'static [usize] {
    match kernel {
        Kernel::BlockScore => &[2],
        Kernel::SoftmaxStatsUpdate => &[3, 4, 5],
        Kernel::OutputAccumulate => &[7],
        Kernel::MatmulF32 | Kernel::MatmulF16 => &[2],
    }
}

struct Pipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

struct TrackedBuffer {
    raw: wgpu::Buffer,
    /// Requested size; allocations are padded up to copy alignment.
    logical: u64,
}

/// Compute backend on a WebGPU device.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: HashMap<Kernel, Pipeline>,
    buffers: RefCell<Vec<TrackedBuffer>>,
}

impl WgpuBackend {
    /// Acquire an adapter and device and compile the kernel pipelines.
    ///
    /// Fails with [`Error::BackendUnavailable`] when no adapter can be
    /// requested.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| Error::BackendUnavailable {
            reason: "no suitable WebGPU adapter".into(),
        })?;

        let mut features = wgpu::Features::empty();
        if adapter.features().contains(wgpu::Features::SHADER_F16) {
            features |= wgpu::Features::SHADER_F16;
        }

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("attnr.device"),
                required_features: features,
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))
        .map_err(|err| Error::BackendUnavailable {
            reason: format!("could not request device: {err}"),
        })?;

        let info = adapter.get_info();
        debug!(adapter = %info.name, backend = ?info.backend, "acquired device");

        let mut pipelines = HashMap::new();
        for &(kernel, source) in KERNELS {
            pipelines.insert(kernel, build_pipeline(&device, kernel, source));
        }
        if features.contains(wgpu::Features::SHADER_F16) {
            let (kernel, source) = KERNEL_F16;
            pipelines.insert(kernel, build_pipeline(&device, kernel, source));
        }

        Ok(Self {
            device,
            queue,
            pipelines,
            buffers: RefCell::new(Vec::new()),
        })
    }

    /// Whether the device supports the f16 matmul kernel.
    pub fn supports_f16(&self) -> bool {
        self.pipelines.contains_key(&Kernel::MatmulF16)
    }

    fn encode_dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        kernel: Kernel,
        bindings: &[BufferId],
        grid: (u32, u32),
    ) -> Result<()> {
        let pipeline = self.pipelines.get(&kernel).ok_or_else(|| {
            Error::BackendOperation {
                reason: format!(
                    "kernel {} is not available on this device (shader-f16 missing?)",
                    kernel.name()
                ),
            }
        })?;
        if bindings.len() != kernel.storage_bindings() + 1 {
            return Err(Error::BackendOperation {
                reason: format!(
                    "kernel {} expects {} bindings plus params, got {}",
                    kernel.name(),
                    kernel.storage_bindings(),
                    bindings.len()
                ),
            });
        }

        let buffers = self.buffers.borrow();
        let mut entries = Vec::with_capacity(bindings.len());
        for (index, id) in bindings.iter().enumerate() {
            let tracked = buffers
                .get(id.0 as usize)
                .ok_or_else(|| unknown_buffer(*id))?;
            entries.push(wgpu::BindGroupEntry {
                binding: index as u32,
                resource: tracked.raw.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.name()),
            layout: &pipeline.layout,
            entries: &entries,
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(kernel.name()),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(grid.0, grid.1, 1);
        Ok(())
    }
}

impl ComputeBackend for WgpuBackend {
    fn alloc(&self, byte_size: u64, usage: BufferUsage) -> Result<BufferId> {
        let padded = pad_size(byte_size);
        let usage = match usage {
            BufferUsage::Storage => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
            BufferUsage::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        };
        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("attnr.buffer"),
            size: padded,
            usage,
            mapped_at_creation: false,
        });
        let mut buffers = self.buffers.borrow_mut();
        let id = BufferId(buffers.len() as u32);
        buffers.push(TrackedBuffer {
            raw,
            logical: byte_size,
        });
        Ok(id)
    }

    fn write(&self, dst: BufferId, dst_offset: u64, bytes: &[u8]) -> Result<()> {
        let buffers = self.buffers.borrow();
        let tracked = buffers
            .get(dst.0 as usize)
            .ok_or_else(|| unknown_buffer(dst))?;
        if dst_offset + bytes.len() as u64 > pad_size(tracked.logical) {
            return Err(Error::BackendOperation {
                reason: format!(
                    "write of {} bytes at offset {dst_offset} overruns buffer {}",
                    bytes.len(),
                    dst.0
                ),
            });
        }
        // write_buffer requires 4-byte-aligned sizes; pad into the slack the
        // allocation already carries.
        if bytes.len() % 4 != 0 {
            let mut padded = bytes.to_vec();
            padded.resize(bytes.len().next_multiple_of(4), 0);
            self.queue.write_buffer(&tracked.raw, dst_offset, &padded);
        } else {
            self.queue.write_buffer(&tracked.raw, dst_offset, bytes);
        }
        Ok(())
    }

    fn submit(&self, commands: &[Command]) -> Result<()> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("attnr.batch"),
            });

        for command in commands {
            match command {
                Command::CopyRange {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    byte_len,
                } => {
                    let buffers = self.buffers.borrow();
                    let src_buf = buffers
                        .get(src.0 as usize)
                        .ok_or_else(|| unknown_buffer(*src))?;
                    let dst_buf = buffers
                        .get(dst.0 as usize)
                        .ok_or_else(|| unknown_buffer(*dst))?;
                    encoder.copy_buffer_to_buffer(
                        &src_buf.raw,
                        *src_offset,
                        &dst_buf.raw,
                        *dst_offset,
                        *byte_len,
                    );
                }
                Command::Dispatch {
                    kernel,
                    bindings,
                    grid,
                } => self.encode_dispatch(&mut encoder, *kernel, bindings, *grid)?,
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        let _ = self.device.poll(wgpu::Maintain::Wait);

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::BackendOperation {
                reason: format!("batch failed validation: {err}"),
            });
        }
        Ok(())
    }

    fn read_back(&self, src: BufferId) -> Result<Vec<u8>> {
        let (staging, logical) = {
            let buffers = self.buffers.borrow();
            let tracked = buffers
                .get(src.0 as usize)
                .ok_or_else(|| unknown_buffer(src))?;
            let padded = pad_size(tracked.logical);
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("attnr.readback"),
                size: padded,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("attnr.readback"),
                });
            encoder.copy_buffer_to_buffer(&tracked.raw, 0, &staging, 0, padded);
            self.queue.submit(std::iter::once(encoder.finish()));
            (staging, tracked.logical)
        };

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(Error::BackendOperation {
                    reason: format!("readback mapping failed: {err:?}"),
                });
            }
            Err(_) => {
                return Err(Error::BackendOperation {
                    reason: "readback mapping callback dropped".into(),
                });
            }
        }

        let mut bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        bytes.truncate(logical as usize);
        Ok(bytes)
    }
}

fn build_pipeline(device: &wgpu::Device, kernel: Kernel, source: &str) -> Pipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(kernel.name()),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let writable = writable_bindings(kernel);
    let mut entries = Vec::new();
    for index in 0..kernel.storage_bindings() {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: index as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage {
                    read_only: !writable.contains(&index),
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }
    entries.push(wgpu::BindGroupLayoutEntry {
        binding: kernel.storage_bindings() as u32,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    });

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(kernel.name()),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(kernel.name()),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(kernel.name()),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some(kernel.name()),
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });

    Pipeline { pipeline, layout }
}

fn pad_size(byte_size: u64) -> u64 {
    byte_size.max(4).next_multiple_of(4)
}

fn unknown_buffer(id: BufferId) -> Error {
    Error::BackendOperation {
        reason: format!("unknown buffer handle {}", id.0),
    }
}
