//! Naive quadratic-memory softmax attention
//!
//! Materializes the full score matrix on the host. This is the golden
//! comparison for the tiled orchestrator, not a production path: peak memory
//! is O(n²) where the tiled path is bounded by the tile budget.

use crate::error::{Error, Result};
use crate::matrix::Matrix;

/// Full softmax attention: `O = softmax(scale * Q * K^t) * V`.
///
/// `scale` of `None` leaves the raw dot-product scores untouched, matching
/// the tiled orchestrator's default.
pub fn naive_attention(q: &Matrix, k: &Matrix, v: &Matrix, scale: Option<f32>) -> Result<Matrix> {
    check_shapes(q, k, v)?;
    let n = q.rows();
    let d = q.cols();
    let scale = scale.unwrap_or(1.0);

    let mut out = vec![0.0f32; n * d];
    for i in 0..n {
        let q_row = &q.data()[i * d..(i + 1) * d];

        // Row of scores, softmaxed with the usual max-subtraction for
        // stability.
        let mut scores = vec![0.0f32; n];
        for (j, score) in scores.iter_mut().enumerate() {
            let k_row = &k.data()[j * d..(j + 1) * d];
            *score = scale * q_row.iter().zip(k_row).map(|(a, b)| a * b).sum::<f32>();
        }
        let row_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for score in scores.iter_mut() {
            *score = (*score - row_max).exp();
            sum += *score;
        }

        for (j, &weight) in scores.iter().enumerate() {
            let v_row = &v.data()[j * d..(j + 1) * d];
            for (dd, &v_jd) in v_row.iter().enumerate() {
                out[i * d + dd] += weight / sum * v_jd;
            }
        }
    }
    Matrix::new(n, d, out)
}

pub(crate) fn check_shapes(q: &Matrix, k: &Matrix, v: &Matrix) -> Result<()> {
    let same = q.rows() == k.rows()
        && q.rows() == v.rows()
        && q.cols() == k.cols()
        && q.cols() == v.cols();
    if !same {
        return Err(Error::Shape {
            reason: format!(
                "Q {}x{}, K {}x{}, V {}x{} must share one [n,d] shape",
                q.rows(),
                q.cols(),
                k.rows(),
                k.cols(),
                v.rows(),
                v.cols()
            ),
        });
    }
    Ok(())
}
