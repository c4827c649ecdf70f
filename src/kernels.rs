//! Host-side kernel bodies and their parameter blocks
//!
//! Reference implementations of the named compute kernels, executed directly
//! by the CPU backend and serving as the authoritative statement of each
//! kernel's mathematical contract. The WGSL bodies under `backend/shaders/`
//! implement the same math against the same `#[repr(C)]` parameter layouts.
//!
//! Every kernel treats tile positions beyond the valid row counts as absent:
//! they contribute nothing, they are not read, and they are never zero-filled
//! into a max or a sum. Patch buffers may hold stale values past the valid
//! region; the parameter block is the single source of truth for bounds.

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

/// Parameters for the three attention block kernels.
///
/// `q_rows`/`k_rows` are the *valid* tile lengths (partial tiles carry their
/// true size here); `dim` is the feature width and the row stride of the
/// Q/V/O patches; `score_cols` is the key-tile capacity `bc`, the row stride
/// of the score patch.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockParams {
    /// Valid rows in the query patch (`qTileLen`)
    pub q_rows: u32,
    /// Valid rows in the key/value patch (`kTileLen`)
    pub k_rows: u32,
    /// Feature width `d`
    pub dim: u32,
    /// Row stride of the score patch (key-tile capacity `bc`)
    pub score_cols: u32,
    /// Multiplier applied to every raw dot product (1.0 = none)
    pub scale: f32,
    pub _pad: [u32; 3],
}

/// Parameters for the naive matmul kernels: `C[m,n] = A[m,k] * B[k,n]`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MatmulParams {
    /// Rows of A and C
    pub m: u32,
    /// Inner dimension
    pub k: u32,
    /// Columns of B and C
    pub n: u32,
    pub _pad: u32,
}

/// `BlockScore`: `S[i,j] = scale * sum_k Q[i,k] * K[j,k]` for the valid
/// `q_rows x k_rows` region of the tile.
pub fn block_score(q: &[f32], k: &[f32], s: &mut [f32], p: &BlockParams) {
    let d = p.dim as usize;
    let stride = p.score_cols as usize;
    let k_rows = p.k_rows as usize;

    s.par_chunks_mut(stride)
        .take(p.q_rows as usize)
        .enumerate()
        .for_each(|(i, s_row)| {
            let q_row = &q[i * d..(i + 1) * d];
            for (j, s_ij) in s_row.iter_mut().enumerate().take(k_rows) {
                let k_row = &k[j * d..(j + 1) * d];
                let dot: f32 = q_row.iter().zip(k_row).map(|(a, b)| a * b).sum();
                *s_ij = p.scale * dot;
            }
        });
}

/// `SoftmaxStatsUpdate`: per query row,
/// `Tmax[i] = max_j S[i,j]`, `Mnew[i] = max(Mprev[i], Tmax[i])`,
/// `Lnew[i] = Lprev[i]*exp(Mprev[i]-Mnew[i]) + sum_j exp(S[i,j]-Mnew[i])`.
#[allow(clippy::too_many_arguments)]
pub fn softmax_stats_update(
    s: &[f32],
    m_prev: &[f32],
    l_prev: &[f32],
    t_max: &mut [f32],
    m_new: &mut [f32],
    l_new: &mut [f32],
    p: &BlockParams,
) {
    let stride = p.score_cols as usize;
    let k_rows = p.k_rows as usize;

    for i in 0..p.q_rows as usize {
        let s_row = &s[i * stride..i * stride + k_rows];
        let tile_max = s_row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let row_max = m_prev[i].max(tile_max);
        // exp(-inf - row_max) = 0 covers the first tile, where m_prev is -inf
        // and l_prev is 0.
        let carried = l_prev[i] * (m_prev[i] - row_max).exp();
        let tile_sum: f32 = s_row.iter().map(|&v| (v - row_max).exp()).sum();

        t_max[i] = tile_max;
        m_new[i] = row_max;
        l_new[i] = carried + tile_sum;
    }
}

/// `OutputAccumulate`: rescale the previously accumulated output by the
/// running-max correction, add this tile's contribution, renormalize:
/// `Onew[i,:] = (Oprev[i,:]*Lprev[i]*exp(Mprev[i]-Mnew[i])
///              + sum_j exp(S[i,j]-Mnew[i])*V[j,:]) / Lnew[i]`.
#[allow(clippy::too_many_arguments)]
pub fn output_accumulate(
    s: &[f32],
    v: &[f32],
    o_prev: &[f32],
    m_prev: &[f32],
    l_prev: &[f32],
    m_new: &[f32],
    l_new: &[f32],
    o_new: &mut [f32],
    p: &BlockParams,
) {
    let d = p.dim as usize;
    let stride = p.score_cols as usize;
    let k_rows = p.k_rows as usize;

    o_new
        .par_chunks_mut(d)
        .take(p.q_rows as usize)
        .enumerate()
        .for_each(|(i, out_row)| {
            let correction = l_prev[i] * (m_prev[i] - m_new[i]).exp();
            let s_row = &s[i * stride..i * stride + k_rows];
            for dd in 0..d {
                let mut acc = o_prev[i * d + dd] * correction;
                for (j, &s_ij) in s_row.iter().enumerate() {
                    acc += (s_ij - m_new[i]).exp() * v[j * d + dd];
                }
                out_row[dd] = acc / l_new[i];
            }
        });
}

/// `MatmulF32`: naive single-shot `C = A * B`.
pub fn matmul_f32(a: &[f32], b: &[f32], c: &mut [f32], p: &MatmulParams) {
    let (k, n) = (p.k as usize, p.n as usize);

    c.par_chunks_mut(n)
        .take(p.m as usize)
        .enumerate()
        .for_each(|(i, c_row)| {
            let a_row = &a[i * k..(i + 1) * k];
            for (j, c_ij) in c_row.iter_mut().enumerate() {
                *c_ij = a_row
                    .iter()
                    .enumerate()
                    .map(|(kk, &a_ik)| a_ik * b[kk * n + j])
                    .sum();
            }
        });
}

/// `MatmulF16`: the same contract over f16-encoded storage. Operands are
/// decoded with the transfer codec, accumulated in f32, and the result is
/// encoded back, so the CPU path shares bit behavior with the codec on both
/// ends of the transfer.
pub fn matmul_f16(a: &[u16], b: &[u16], c: &mut [u16], p: &MatmulParams) {
    let (k, n) = (p.k as usize, p.n as usize);

    c.par_chunks_mut(n)
        .take(p.m as usize)
        .enumerate()
        .for_each(|(i, c_row)| {
            for (j, c_ij) in c_row.iter_mut().enumerate() {
                let acc: f32 = (0..k)
                    .map(|kk| {
                        crate::f16::decode32(a[i * k + kk]) * crate::f16::decode32(b[kk * n + j])
                    })
                    .sum();
                *c_ij = crate::f16::encode16(acc);
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(q_rows: u32, k_rows: u32, dim: u32, score_cols: u32, scale: f32) -> BlockParams {
        BlockParams {
            q_rows,
            k_rows,
            dim,
            score_cols,
            scale,
            _pad: [0; 3],
        }
    }

    #[test]
    fn test_block_score_raw_dot() {
        // Q = [[1,2],[3,4]], K = [[5,6],[7,8]]
        let q = [1.0, 2.0, 3.0, 4.0];
        let k = [5.0, 6.0, 7.0, 8.0];
        let mut s = [0.0f32; 4];
        block_score(&q, &k, &mut s, &params(2, 2, 2, 2, 1.0));
        assert_eq!(s, [17.0, 23.0, 39.0, 53.0]);
    }

    #[test]
    fn test_block_score_respects_partial_bounds() {
        let q = [1.0, 1.0, 2.0, 2.0];
        let k = [1.0, 1.0, 9.0, 9.0];
        // Capacity 2x2 but only a 1x1 region is valid; the rest must stay
        // untouched.
        let mut s = [-7.0f32; 4];
        block_score(&q, &k, &mut s, &params(1, 1, 2, 2, 1.0));
        assert_eq!(s, [2.0, -7.0, -7.0, -7.0]);
    }

    #[test]
    fn test_block_score_scale() {
        let q = [2.0, 0.0];
        let k = [3.0, 0.0];
        let mut s = [0.0f32];
        block_score(&q, &k, &mut s, &params(1, 1, 2, 1, 0.5));
        assert_eq!(s, [3.0]);
    }

    #[test]
    fn test_softmax_stats_first_tile() {
        let s = [1.0, 3.0, 2.0];
        let m_prev = [f32::NEG_INFINITY];
        let l_prev = [0.0];
        let (mut t_max, mut m_new, mut l_new) = ([0.0], [0.0], [0.0]);
        softmax_stats_update(
            &s,
            &m_prev,
            &l_prev,
            &mut t_max,
            &mut m_new,
            &mut l_new,
            &params(1, 3, 1, 3, 1.0),
        );
        assert_eq!(t_max[0], 3.0);
        assert_eq!(m_new[0], 3.0);
        let expected: f32 = (1.0f32 - 3.0).exp() + (3.0f32 - 3.0).exp() + (2.0f32 - 3.0).exp();
        assert!((l_new[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_stats_carries_previous_sum() {
        let s = [5.0];
        let m_prev = [2.0];
        let l_prev = [1.5];
        let (mut t_max, mut m_new, mut l_new) = ([0.0], [0.0], [0.0]);
        softmax_stats_update(
            &s,
            &m_prev,
            &l_prev,
            &mut t_max,
            &mut m_new,
            &mut l_new,
            &params(1, 1, 1, 1, 1.0),
        );
        assert_eq!(m_new[0], 5.0);
        let expected = 1.5 * (2.0f32 - 5.0).exp() + 1.0;
        assert!((l_new[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_two_tile_recurrence_matches_single_pass() {
        // One query row against four keys, processed as one 4-wide tile and
        // as two 2-wide tiles: O must agree.
        let q = [1.0f32, 0.5];
        let keys = [[0.2f32, 0.1], [0.9, -0.4], [-0.3, 0.8], [0.5, 0.5]];
        let vals = [[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0], [0.5, -0.5]];

        let run = |tile: usize| {
            let mut m = [f32::NEG_INFINITY];
            let mut l = [0.0f32];
            let mut o = [0.0f32; 2];
            for start in (0..4).step_by(tile) {
                let len = tile.min(4 - start);
                let k_flat: Vec<f32> = keys[start..start + len].concat();
                let v_flat: Vec<f32> = vals[start..start + len].concat();
                let p = params(1, len as u32, 2, tile as u32, 1.0);
                let mut s = vec![0.0f32; tile];
                block_score(&q, &k_flat, &mut s, &p);
                let (mut t_max, mut m_new, mut l_new) = ([0.0], [0.0], [0.0]);
                softmax_stats_update(&s, &m, &l, &mut t_max, &mut m_new, &mut l_new, &p);
                let mut o_new = [0.0f32; 2];
                output_accumulate(&s, &v_flat, &o, &m, &l, &m_new, &l_new, &mut o_new, &p);
                m = m_new;
                l = l_new;
                o = o_new;
            }
            o
        };

        let single = run(4);
        let tiled = run(2);
        for (a, b) in single.iter().zip(tiled.iter()) {
            assert!((a - b).abs() < 1e-6, "tiled {tiled:?} vs single {single:?}");
        }
    }

    #[test]
    fn test_matmul_f32() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0]; // 3x2
        let mut c = [0.0f32; 4];
        matmul_f32(
            &a,
            &b,
            &mut c,
            &MatmulParams {
                m: 2,
                k: 3,
                n: 2,
                _pad: 0,
            },
        );
        assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_f16_small_integers_exact() {
        // Small integers and their products are exactly representable in the
        // half encoding, so this variant is exact here.
        let a = crate::f16::encode_slice(&[1.0, 2.0, 3.0, 4.0]);
        let b = crate::f16::encode_slice(&[5.0, 6.0, 7.0, 8.0]);
        let mut c = [0u16; 4];
        matmul_f16(
            &a,
            &b,
            &mut c,
            &MatmulParams {
                m: 2,
                k: 2,
                n: 2,
                _pad: 0,
            },
        );
        assert_eq!(crate::f16::decode_slice(&c), vec![19.0, 22.0, 43.0, 50.0]);
    }
}
