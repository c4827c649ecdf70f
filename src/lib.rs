//! # attnr
//!
//! **Memory-bounded attention over a pluggable compute backend.**
//!
//! attnr computes `softmax(Q·Kᵗ)·V` for inputs whose full score matrix does
//! not fit on-chip: Q/K/V are tiled to a byte budget and an online softmax
//! recurrence carries per-row running max/sum statistics across tiles, so
//! peak working memory tracks the tile budget instead of `n²`.
//!
//! ## Design
//!
//! - **[`Matrix`]**: the uniform data model — a self-describing row-major
//!   f32 buffer; a vector is a one-column matrix.
//! - **[`backend::ComputeBackend`]**: the seam to the execution engine —
//!   transient buffers, ordered command batches of byte-range copies and
//!   named-kernel dispatches, blocking readback. [`CpuBackend`] is always
//!   available; [`WgpuBackend`] (feature `wgpu`, default on) runs the same
//!   protocol on a WebGPU device.
//! - **[`TiledAttention`]**: the orchestrator driving the nested tile
//!   iteration over the backend.
//! - **[`f16`]**: a bit-exact truncating f32↔f16 transfer codec, exercised
//!   by the half-precision matmul variant.
//!
//! ## Example
//!
//! ```
//! use attnr::{AttentionConfig, CpuBackend, Matrix, TiledAttention};
//!
//! let backend = CpuBackend::new();
//! let qkv = Matrix::new(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0])?;
//! let attention = TiledAttention::new(&backend, AttentionConfig::with_budget(64));
//! let output = attention.run(&qkv, &qkv, &qkv)?;
//! assert_eq!(output.rows(), 3);
//! # Ok::<(), attnr::Error>(())
//! ```

pub mod attention;
pub mod backend;
pub mod error;
pub mod f16;
pub mod kernels;
pub mod matmul;
pub mod matrix;

pub use attention::reference::naive_attention;
pub use attention::tiled::{tile_sizes, AttentionConfig, TileShape, TiledAttention};
pub use backend::{BufferId, BufferUsage, Command, ComputeBackend, CpuBackend, Kernel};
#[cfg(feature = "wgpu")]
pub use backend::WgpuBackend;
pub use error::{Error, Result};
pub use matmul::{matmul, matmul_f16};
pub use matrix::Matrix;
