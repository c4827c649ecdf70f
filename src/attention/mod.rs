//! Attention operators
//!
//! [`tiled`] holds the memory-bounded orchestrator; [`reference`] the naive
//! quadratic-memory implementation it is checked against.

pub mod reference;
pub mod tiled;

pub use reference::naive_attention;
pub use tiled::{tile_sizes, AttentionConfig, TileShape, TiledAttention};
