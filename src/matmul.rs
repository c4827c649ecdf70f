//! Naive single-shot matrix multiply through the backend
//!
//! One dispatch over the full output grid — no tiling, no online recurrence.
//! The f16 variant exists to exercise the half-precision transfer codec:
//! operands travel to the device as 16-bit payloads and the result travels
//! back the same way, halving transfer bandwidth at the cost of truncation
//! precision.

use crate::backend::{BufferUsage, Command, ComputeBackend, Kernel};
use crate::error::{Error, Result};
use crate::f16;
use crate::kernels::MatmulParams;
use crate::matrix::Matrix;

/// `C[m,n] = A[m,k] * B[k,n]` over f32 storage.
pub fn matmul<B: ComputeBackend>(backend: &B, a: &Matrix, b: &Matrix) -> Result<Matrix> {
    let p = check_dims(a, b)?;

    let a_buf = backend.alloc(a.as_bytes().len() as u64, BufferUsage::Storage)?;
    let b_buf = backend.alloc(b.as_bytes().len() as u64, BufferUsage::Storage)?;
    let c_buf = backend.alloc((a.rows() * b.cols() * 4) as u64, BufferUsage::Storage)?;
    let params = backend.alloc(std::mem::size_of::<MatmulParams>() as u64, BufferUsage::Uniform)?;

    backend.write(a_buf, 0, a.as_bytes())?;
    backend.write(b_buf, 0, b.as_bytes())?;
    backend.write(params, 0, bytemuck::bytes_of(&p))?;

    backend.submit(&[Command::Dispatch {
        kernel: Kernel::MatmulF32,
        bindings: vec![a_buf, b_buf, c_buf, params],
        grid: grid_for(p),
    }])?;

    let bytes = backend.read_back(c_buf)?;
    Matrix::from_f32_bytes(a.rows(), b.cols(), &bytes)
}

/// `C[m,n] = A[m,k] * B[k,n]` over f16-encoded storage.
///
/// Operands are narrowed with [`crate::f16::encode16`] before staging and the
/// u16 result is widened with [`crate::f16::decode32`] after readback, so the
/// returned matrix carries half-precision truncation on both the inputs and
/// the output.
pub fn matmul_f16<B: ComputeBackend>(backend: &B, a: &Matrix, b: &Matrix) -> Result<Matrix> {
    let p = check_dims(a, b)?;
    let (m, n) = (a.rows(), b.cols());

    let a_half = f16::encode_slice(a.data());
    let b_half = f16::encode_slice(b.data());

    let a_buf = backend.alloc((a_half.len() * 2) as u64, BufferUsage::Storage)?;
    let b_buf = backend.alloc((b_half.len() * 2) as u64, BufferUsage::Storage)?;
    let c_buf = backend.alloc((m * n * 2) as u64, BufferUsage::Storage)?;
    let params = backend.alloc(std::mem::size_of::<MatmulParams>() as u64, BufferUsage::Uniform)?;

    backend.write(a_buf, 0, bytemuck::cast_slice(&a_half))?;
    backend.write(b_buf, 0, bytemuck::cast_slice(&b_half))?;
    backend.write(params, 0, bytemuck::bytes_of(&p))?;

    backend.submit(&[Command::Dispatch {
        kernel: Kernel::MatmulF16,
        bindings: vec![a_buf, b_buf, c_buf, params],
        grid: grid_for(p),
    }])?;

    let bytes = backend.read_back(c_buf)?;
    let needed = m * n * 2;
    if bytes.len() < needed {
        return Err(Error::BackendOperation {
            reason: format!("readback returned {} bytes, expected {needed}", bytes.len()),
        });
    }
    let halves: Vec<u16> = bytemuck::pod_collect_to_vec(&bytes[..needed]);
    Matrix::new(m, n, f16::decode_slice(&halves))
}

fn check_dims(a: &Matrix, b: &Matrix) -> Result<MatmulParams> {
    if a.cols() != b.rows() {
        return Err(Error::Shape {
            reason: format!(
                "inner dimensions disagree: {}x{} * {}x{}",
                a.rows(),
                a.cols(),
                b.rows(),
                b.cols()
            ),
        });
    }
    Ok(MatmulParams {
        m: a.rows() as u32,
        k: a.cols() as u32,
        n: b.cols() as u32,
        _pad: 0,
    })
}

fn grid_for(p: MatmulParams) -> (u32, u32) {
    let wg = crate::attention::tiled::WORKGROUP_2D;
    (p.m.div_ceil(wg), p.n.div_ceil(wg))
}
