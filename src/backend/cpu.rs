//! CPU compute backend
//!
//! Executes the same staging/dispatch/readback protocol as the GPU backend,
//! with buffers as plain byte vectors and kernel bodies from [`crate::kernels`].
//! Always available; the orchestrator and its tests run against it without
//! any device. Commands run strictly in submission order, so the batch
//! barrier semantics hold trivially.

use std::cell::RefCell;

use crate::backend::{BufferId, BufferUsage, Command, ComputeBackend, Kernel};
use crate::error::{Error, Result};
use crate::kernels::{self, BlockParams, MatmulParams};

/// In-process backend backed by host memory.
#[derive(Debug, Default)]
pub struct CpuBackend {
    buffers: RefCell<Vec<Vec<u8>>>,
}

impl CpuBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_bytes(&self, id: BufferId) -> Result<Vec<u8>> {
        let buffers = self.buffers.borrow();
        buffers
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| unknown_buffer(id))
    }

    // pod_collect_to_vec because Vec<u8> carries no alignment guarantee.
    fn read_f32(&self, id: BufferId) -> Result<Vec<f32>> {
        Ok(bytemuck::pod_collect_to_vec(&self.read_bytes(id)?))
    }

    fn read_u16(&self, id: BufferId) -> Result<Vec<u16>> {
        Ok(bytemuck::pod_collect_to_vec(&self.read_bytes(id)?))
    }

    fn write_bytes(&self, id: BufferId, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut buffers = self.buffers.borrow_mut();
        let buf = buffers
            .get_mut(id.0 as usize)
            .ok_or_else(|| unknown_buffer(id))?;
        let end = offset + bytes.len();
        if end > buf.len() {
            return Err(Error::BackendOperation {
                reason: format!(
                    "write of {} bytes at offset {offset} overruns buffer {} ({} bytes)",
                    bytes.len(),
                    id.0,
                    buf.len()
                ),
            });
        }
        buf[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn block_params(&self, id: BufferId) -> Result<BlockParams> {
        let bytes = self.read_bytes(id)?;
        pod_params(&bytes, id)
    }

    fn matmul_params(&self, id: BufferId) -> Result<MatmulParams> {
        let bytes = self.read_bytes(id)?;
        pod_params(&bytes, id)
    }

    fn dispatch(&self, kernel: Kernel, bindings: &[BufferId]) -> Result<()> {
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
        // Params are always the last binding. Inputs are copied out and the
        // full output buffer is written back, so regions beyond the valid
        // tile stay untouched.
        match kernel {
            Kernel::BlockScore => {
                let p = self.block_params(bindings[3])?;
                let q = self.read_f32(bindings[0])?;
                let k = self.read_f32(bindings[1])?;
                let mut s = self.read_f32(bindings[2])?;
                kernels::block_score(&q, &k, &mut s, &p);
                self.write_bytes(bindings[2], 0, bytemuck::cast_slice(&s))
            }
            Kernel::SoftmaxStatsUpdate => {
                let p = self.block_params(bindings[6])?;
                let s = self.read_f32(bindings[0])?;
                let m_prev = self.read_f32(bindings[1])?;
                let l_prev = self.read_f32(bindings[2])?;
                let mut t_max = self.read_f32(bindings[3])?;
                let mut m_new = self.read_f32(bindings[4])?;
                let mut l_new = self.read_f32(bindings[5])?;
                kernels::softmax_stats_update(
                    &s, &m_prev, &l_prev, &mut t_max, &mut m_new, &mut l_new, &p,
                );
                self.write_bytes(bindings[3], 0, bytemuck::cast_slice(&t_max))?;
                self.write_bytes(bindings[4], 0, bytemuck::cast_slice(&m_new))?;
                self.write_bytes(bindings[5], 0, bytemuck::cast_slice(&l_new))
            }
            Kernel::OutputAccumulate => {
                let p = self.block_params(bindings[8])?;
                let s = self.read_f32(bindings[0])?;
                let v = self.read_f32(bindings[1])?;
                let o_prev = self.read_f32(bindings[2])?;
                let m_prev = self.read_f32(bindings[3])?;
                let l_prev = self.read_f32(bindings[4])?;
                let m_new = self.read_f32(bindings[5])?;
                let l_new = self.read_f32(bindings[6])?;
                let mut o_new = self.read_f32(bindings[7])?;
                kernels::output_accumulate(
                    &s, &v, &o_prev, &m_prev, &l_prev, &m_new, &l_new, &mut o_new, &p,
                );
                self.write_bytes(bindings[7], 0, bytemuck::cast_slice(&o_new))
            }
            Kernel::MatmulF32 => {
                let p = self.matmul_params(bindings[3])?;
                let a = self.read_f32(bindings[0])?;
                let b = self.read_f32(bindings[1])?;
                let mut c = self.read_f32(bindings[2])?;
                kernels::matmul_f32(&a, &b, &mut c, &p);
                self.write_bytes(bindings[2], 0, bytemuck::cast_slice(&c))
            }
            Kernel::MatmulF16 => {
                let p = self.matmul_params(bindings[3])?;
                let a = self.read_u16(bindings[0])?;
                let b = self.read_u16(bindings[1])?;
                let mut c = self.read_u16(bindings[2])?;
                kernels::matmul_f16(&a, &b, &mut c, &p);
                self.write_bytes(bindings[2], 0, bytemuck::cast_slice(&c))
            }
        }
    }
}

fn unknown_buffer(id: BufferId) -> Error {
    Error::BackendOperation {
        reason: format!("unknown buffer handle {}", id.0),
    }
}

fn pod_params<P: bytemuck::Pod>(bytes: &[u8], id: BufferId) -> Result<P> {
    let size = std::mem::size_of::<P>();
    if bytes.len() < size {
        return Err(Error::BackendOperation {
            reason: format!(
                "params buffer {} holds {} bytes, kernel expects {size}",
                id.0,
                bytes.len()
            ),
        });
    }
    Ok(bytemuck::pod_read_unaligned(&bytes[..size]))
}

impl ComputeBackend for CpuBackend {
    fn alloc(&self, byte_size: u64, _usage: BufferUsage) -> Result<BufferId> {
        let mut buffers = self.buffers.borrow_mut();
        let id = BufferId(buffers.len() as u32);
        buffers.push(vec![0u8; byte_size as usize]);
        Ok(id)
    }

    fn write(&self, dst: BufferId, dst_offset: u64, bytes: &[u8]) -> Result<()> {
        self.write_bytes(dst, dst_offset as usize, bytes)
    }

    fn submit(&self, commands: &[Command]) -> Result<()> {
        for command in commands {
            match command {
                Command::CopyRange {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    byte_len,
                } => {
                    let data = self.read_bytes(*src)?;
                    let lo = *src_offset as usize;
                    let hi = lo + *byte_len as usize;
                    if hi > data.len() {
                        return Err(Error::BackendOperation {
                            reason: format!(
                                "copy of {byte_len} bytes at offset {src_offset} overruns buffer {}",
                                src.0
                            ),
                        });
                    }
                    self.write_bytes(*dst, *dst_offset as usize, &data[lo..hi])?;
                }
                // The workgroup grid is a GPU scheduling concern; the valid
                // region comes from the parameter block.
                Command::Dispatch {
                    kernel, bindings, ..
                } => self.dispatch(*kernel, bindings)?,
            }
        }
        Ok(())
    }

    fn read_back(&self, src: BufferId) -> Result<Vec<u8>> {
        self.read_bytes(src)
    }
}
