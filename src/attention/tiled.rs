//! Memory-bounded tiled attention orchestrator
//!
//! Computes `softmax(scale * Q * K^t) * V` without ever materializing the
//! `n x n` score matrix. Q/K/V are partitioned into tiles sized to a memory
//! budget, and per-row running statistics (max `M`, sum `L`) carry the online
//! softmax recurrence across key/value tiles: each tile rescales the
//! previously accumulated output by `exp(old_max - new_max)` before adding
//! its own contribution. Peak working memory is proportional to the tile
//! budget, not to `n²`.
//!
//! The outer loop walks key/value tiles, the inner loop query tiles. For a
//! given query row, `L`/`M`/`O` are read, updated, and written back exactly
//! once per key/value tile; each `(i, j)` step is submitted as one batch so
//! that read→compute→write sequence is atomic with respect to the row range.
//! Results are invariant to the order of key/value tiles (the recurrence is
//! associative over tiles), but no two in-flight steps may touch the same
//! query rows — this implementation serializes steps outright.

use tracing::debug;

use crate::backend::{BufferId, BufferUsage, Command, ComputeBackend, Kernel};
use crate::error::{Error, Result};
use crate::kernels::BlockParams;
use crate::matrix::Matrix;

use super::reference::check_shapes;

const ELEM: usize = std::mem::size_of::<f32>();

/// Workgroup side used by the 2D kernels (score, accumulate, matmul).
pub const WORKGROUP_2D: u32 = 8;
/// Workgroup width used by the 1D statistics kernel.
pub const WORKGROUP_1D: u32 = 64;

/// Orchestrator configuration.
#[derive(Debug, Clone, Copy)]
pub struct AttentionConfig {
    /// On-chip budget, in bytes, for one key/value tile
    pub memory_budget_bytes: usize,
    /// Optional score multiplier (e.g. `1/sqrt(d)`); `None` leaves the raw
    /// dot products untouched
    pub scale: Option<f32>,
}

impl AttentionConfig {
    /// Configuration with the given budget and no score scaling.
    pub fn with_budget(memory_budget_bytes: usize) -> Self {
        Self {
            memory_budget_bytes,
            scale: None,
        }
    }
}

/// Derived tile geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileShape {
    /// Query rows per tile
    pub br: usize,
    /// Key/value rows per tile
    pub bc: usize,
}

/// Derive tile sizes from a byte budget and the feature width.
///
/// `bc = floor(budget / (4 * d))`, `br = min(bc, d)`. A budget that cannot
/// fit a single row of width `d` is a configuration error, not a degenerate
/// tiling.
pub fn tile_sizes(memory_budget_bytes: usize, dim: usize) -> Result<TileShape> {
    if dim == 0 {
        return Err(Error::Config {
            reason: "feature width must be at least 1".into(),
        });
    }
    let bc = memory_budget_bytes / (ELEM * dim);
    if bc < 1 {
        return Err(Error::Config {
            reason: format!(
                "budget of {memory_budget_bytes} bytes cannot fit one row of width {dim}"
            ),
        });
    }
    Ok(TileShape {
        br: bc.min(dim),
        bc,
    })
}

/// Fixed-capacity scratch buffers reused every `(i, j)` step.
///
/// Owned by the orchestrator for the duration of one run; contents are fully
/// overwritten before use each step and never read stale.
struct PatchSet {
    q: BufferId,
    k: BufferId,
    v: BufferId,
    s: BufferId,
    o_prev: BufferId,
    o_new: BufferId,
    m_prev: BufferId,
    l_prev: BufferId,
    t_max: BufferId,
    m_new: BufferId,
    l_new: BufferId,
    params: BufferId,
}

impl PatchSet {
    fn alloc<B: ComputeBackend>(backend: &B, shape: TileShape, dim: usize) -> Result<Self> {
        let TileShape { br, bc } = shape;
        let row = |rows: usize, cols: usize| (rows * cols * ELEM) as u64;
        let vec = |rows: usize| (rows * ELEM) as u64;
        Ok(Self {
            q: backend.alloc(row(br, dim), BufferUsage::Storage)?,
            k: backend.alloc(row(bc, dim), BufferUsage::Storage)?,
            v: backend.alloc(row(bc, dim), BufferUsage::Storage)?,
            s: backend.alloc(row(br, bc), BufferUsage::Storage)?,
            o_prev: backend.alloc(row(br, dim), BufferUsage::Storage)?,
            o_new: backend.alloc(row(br, dim), BufferUsage::Storage)?,
            m_prev: backend.alloc(vec(br), BufferUsage::Storage)?,
            l_prev: backend.alloc(vec(br), BufferUsage::Storage)?,
            t_max: backend.alloc(vec(br), BufferUsage::Storage)?,
            m_new: backend.alloc(vec(br), BufferUsage::Storage)?,
            l_new: backend.alloc(vec(br), BufferUsage::Storage)?,
            params: backend.alloc(
                std::mem::size_of::<BlockParams>() as u64,
                BufferUsage::Uniform,
            )?,
        })
    }
}

/// Memory-bounded attention over a compute backend.
pub struct TiledAttention<'a, B: ComputeBackend> {
    backend: &'a B,
    config: AttentionConfig,
}

impl<'a, B: ComputeBackend> TiledAttention<'a, B> {
    /// Bind an orchestrator to a backend.
    pub fn new(backend: &'a B, config: AttentionConfig) -> Self {
        Self { backend, config }
    }

    /// Compute `softmax(scale * Q * K^t) * V`, tile by tile.
    ///
    /// Fails with [`Error::Shape`] unless Q, K, V share one `[n, d]` shape
    /// and with [`Error::Config`] when the budget cannot fit a row of width
    /// `d` (the feature width is never tiled).
    pub fn run(&self, q: &Matrix, k: &Matrix, v: &Matrix) -> Result<Matrix> {
        check_shapes(q, k, v)?;
        let n = q.rows();
        let d = q.cols();
        if n == 0 {
            return Ok(Matrix::zeros(0, d));
        }

        let shape = tile_sizes(self.config.memory_budget_bytes, d)?;
        let TileShape { br, bc } = shape;
        debug!(n, d, br, bc, "tile geometry");

        let backend = self.backend;

        // Full-size buffers persist across the whole tile iteration: the
        // staged inputs, the output accumulator, and the running statistics.
        let q_buf = backend.alloc((n * d * ELEM) as u64, BufferUsage::Storage)?;
        let k_buf = backend.alloc((n * d * ELEM) as u64, BufferUsage::Storage)?;
        let v_buf = backend.alloc((n * d * ELEM) as u64, BufferUsage::Storage)?;
        let o_buf = backend.alloc((n * d * ELEM) as u64, BufferUsage::Storage)?;
        let l_buf = backend.alloc((n * ELEM) as u64, BufferUsage::Storage)?;
        let m_buf = backend.alloc((n * ELEM) as u64, BufferUsage::Storage)?;

        backend.write(q_buf, 0, q.as_bytes())?;
        backend.write(k_buf, 0, k.as_bytes())?;
        backend.write(v_buf, 0, v.as_bytes())?;
        // O and L start at zero (buffers are zero-initialized); M starts at
        // -infinity so the first tile's max always wins.
        let neg_inf = vec![f32::NEG_INFINITY; n];
        backend.write(m_buf, 0, bytemuck::cast_slice(&neg_inf))?;

        let patch = PatchSet::alloc(backend, shape, d)?;

        let row_bytes = (d * ELEM) as u64;
        let kv_tiles = n.div_ceil(bc);
        let q_tiles = n.div_ceil(br);

        for j in 0..kv_tiles {
            let k_start = j * bc;
            let k_len = bc.min(n - k_start);

            // Stage this key/value tile once for all query tiles.
            backend.submit(&[
                copy(k_buf, k_start as u64 * row_bytes, patch.k, 0, k_len as u64 * row_bytes),
                copy(v_buf, k_start as u64 * row_bytes, patch.v, 0, k_len as u64 * row_bytes),
            ])?;

            for i in 0..q_tiles {
                let q_start = i * br;
                let q_len = br.min(n - q_start);

                let params = BlockParams {
                    q_rows: q_len as u32,
                    k_rows: k_len as u32,
                    dim: d as u32,
                    score_cols: bc as u32,
                    scale: self.config.scale.unwrap_or(1.0),
                    _pad: [0; 3],
                };
                backend.write(patch.params, 0, bytemuck::bytes_of(&params))?;

                let row_off = q_start as u64 * row_bytes;
                let vec_off = (q_start * ELEM) as u64;
                let tile_rows = q_len as u64 * row_bytes;
                let tile_vec = (q_len * ELEM) as u64;

                // One batch per (i, j) step: stage the query-row state, run
                // the three-kernel dependency chain, write the updated slice
                // back. Partial tiles copy and compute their true length only.
                backend.submit(&[
                    copy(q_buf, row_off, patch.q, 0, tile_rows),
                    copy(o_buf, row_off, patch.o_prev, 0, tile_rows),
                    copy(l_buf, vec_off, patch.l_prev, 0, tile_vec),
                    copy(m_buf, vec_off, patch.m_prev, 0, tile_vec),
                    Command::Dispatch {
                        kernel: Kernel::BlockScore,
                        bindings: vec![patch.q, patch.k, patch.s, patch.params],
                        grid: (
                            grid_1d(q_len, WORKGROUP_2D),
                            grid_1d(k_len, WORKGROUP_2D),
                        ),
                    },
                    Command::Dispatch {
                        kernel: Kernel::SoftmaxStatsUpdate,
                        bindings: vec![
                            patch.s,
                            patch.m_prev,
                            patch.l_prev,
                            patch.t_max,
                            patch.m_new,
                            patch.l_new,
                            patch.params,
                        ],
                        grid: (grid_1d(q_len, WORKGROUP_1D), 1),
                    },
                    Command::Dispatch {
                        kernel: Kernel::OutputAccumulate,
                        bindings: vec![
                            patch.s,
                            patch.v,
                            patch.o_prev,
                            patch.m_prev,
                            patch.l_prev,
                            patch.m_new,
                            patch.l_new,
                            patch.o_new,
                            patch.params,
                        ],
                        grid: (
                            grid_1d(q_len, WORKGROUP_2D),
                            grid_1d(d, WORKGROUP_2D),
                        ),
                    },
                    copy(patch.o_new, 0, o_buf, row_off, tile_rows),
                    copy(patch.l_new, 0, l_buf, vec_off, tile_vec),
                    copy(patch.m_new, 0, m_buf, vec_off, tile_vec),
                ])?;
            }
        }

        let bytes = backend.read_back(o_buf)?;
        Matrix::from_f32_bytes(n, d, &bytes)
    }
}

fn grid_1d(len: usize, workgroup: u32) -> u32 {
    (len as u32).div_ceil(workgroup)
}

fn copy(src: BufferId, src_offset: u64, dst: BufferId, dst_offset: u64, byte_len: u64) -> Command {
    Command::CopyRange {
        src,
        src_offset,
        dst,
        dst_offset,
        byte_len,
    }
}
