//! Compute backend abstraction
//!
//! The orchestrator depends only on this surface: allocate transient buffers,
//! write host bytes into them, submit ordered batches of byte-range copies
//! and named-kernel dispatches, and read a buffer back. Commands within one
//! batch execute in submission order for dependency purposes — a dispatch is
//! a full barrier against every earlier write to its bindings — and `submit`
//! returns only once the whole batch has completed. A submitted batch runs to
//! completion or fails the call; there is no cancellation.
//!
//! Buffers are transient per invocation: nothing persists across runs.

pub mod cpu;
#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use cpu::CpuBackend;
#[cfg(feature = "wgpu")]
pub use wgpu::WgpuBackend;

use crate::error::Result;

/// Opaque handle to a backend-owned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u32);

/// How a buffer is bound inside kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Read/write storage, copy source and destination
    Storage,
    /// Kernel parameter block
    Uniform,
}

/// Named compute kernels.
///
/// Each kernel has a fixed binding order, listed below with the parameter
/// block always bound last:
///
/// | Kernel                | Bindings                                              |
/// |-----------------------|-------------------------------------------------------|
/// | `BlockScore`          | Q, K, S, params                                       |
/// | `SoftmaxStatsUpdate`  | S, Mprev, Lprev, Tmax, Mnew, Lnew, params             |
/// | `OutputAccumulate`    | S, V, Oprev, Mprev, Lprev, Mnew, Lnew, Onew, params   |
/// | `MatmulF32`           | A, B, C, params                                       |
/// | `MatmulF16`           | A, B, C, params                                       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Tile score: `S[i,j] = scale * dot(Q[i,:], K[j,:])`
    BlockScore,
    /// Per-row online-softmax running max/sum update
    SoftmaxStatsUpdate,
    /// Rescale-and-add of the output accumulator
    OutputAccumulate,
    /// Naive single-shot matmul over f32 storage
    MatmulF32,
    /// Naive single-shot matmul over f16-encoded storage
    MatmulF16,
}

impl Kernel {
    /// Stable kernel name, used as the WGSL entry point and for labels.
    pub fn name(self) -> &'static str {
        match self {
            Kernel::BlockScore => "block_score",
            Kernel::SoftmaxStatsUpdate => "softmax_stats_update",
            Kernel::OutputAccumulate => "output_accumulate",
            Kernel::MatmulF32 => "matmul_f32",
            Kernel::MatmulF16 => "matmul_f16",
        }
    }

    /// Number of storage bindings (the uniform parameter block is extra).
    pub fn storage_bindings(self) -> usize {
        match self {
            Kernel::BlockScore => 3,
            Kernel::SoftmaxStatsUpdate => 6,
            Kernel::OutputAccumulate => 8,
            Kernel::MatmulF32 | Kernel::MatmulF16 => 3,
        }
    }
}

/// One command inside a submitted batch.
#[derive(Debug, Clone)]
pub enum Command {
    /// Byte-range copy between two buffers.
    CopyRange {
        /// Source buffer
        src: BufferId,
        /// Byte offset into the source
        src_offset: u64,
        /// Destination buffer
        dst: BufferId,
        /// Byte offset into the destination
        dst_offset: u64,
        /// Number of bytes to copy
        byte_len: u64,
    },
    /// Invoke a named kernel over an independent-workgroup grid.
    Dispatch {
        /// Which kernel to run
        kernel: Kernel,
        /// Buffers in the kernel's fixed binding order
        bindings: Vec<BufferId>,
        /// Workgroup grid size (x, y)
        grid: (u32, u32),
    },
}

/// Minimum capability the core requires from a parallel compute engine.
///
/// Implementations must guarantee that `submit` observes program order within
/// a batch and blocks until every command in the batch has completed, so that
/// `read_back` issued afterwards sees all writes.
pub trait ComputeBackend {
    /// Allocate a zero-initialized buffer of at least `byte_size` bytes.
    fn alloc(&self, byte_size: u64, usage: BufferUsage) -> Result<BufferId>;

    /// Write host bytes into a buffer at the given offset, before any batch
    /// submitted later.
    fn write(&self, dst: BufferId, dst_offset: u64, bytes: &[u8]) -> Result<()>;

    /// Execute a batch of commands in order and wait for completion.
    fn submit(&self, commands: &[Command]) -> Result<()>;

    /// Read a buffer's full contents back to the host.
    fn read_back(&self, src: BufferId) -> Result<Vec<u8>>;
}
