//! Self-describing row-major matrix
//!
//! The uniform data model for every matrix and vector in the crate: a row
//! count, a column count, and a flat row-major f32 payload. A vector is a
//! matrix with one column. `Matrix` is a value type — stages either read a
//! block immutably or fully overwrite it, never share mutation.

use crate::error::{Error, Result};

/// Row-major f32 matrix with an explicit shape header.
///
/// Invariant: `data.len() == rows * cols`, enforced at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Create a matrix from a flat row-major payload.
    ///
    /// Fails with [`Error::Shape`] when the payload length does not match
    /// `rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::Shape {
                reason: format!(
                    "payload of {} values does not fill a {}x{} matrix",
                    data.len(),
                    rows,
                    cols
                ),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// All-zero matrix of the given shape.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Matrix of the given shape with every entry set to `value`.
    pub fn filled(rows: usize, cols: usize, value: f32) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Flat row-major payload.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consume the matrix, returning the payload.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Payload as bytes, for staging into backend buffers.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Rebuild a matrix from backend readback bytes.
    ///
    /// The byte buffer may be longer than the payload (backends pad
    /// allocations); extra bytes are ignored. Fails with [`Error::Shape`]
    /// when it is too short.
    pub fn from_f32_bytes(rows: usize, cols: usize, bytes: &[u8]) -> Result<Self> {
        let needed = rows * cols * std::mem::size_of::<f32>();
        if bytes.len() < needed {
            return Err(Error::Shape {
                reason: format!(
                    "{} bytes cannot fill a {}x{} f32 matrix",
                    bytes.len(),
                    rows,
                    cols
                ),
            });
        }
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[..needed]);
        Self::new(rows, cols, data)
    }

    /// Extract `row_count` rows starting at `row_start` as a new matrix.
    ///
    /// The count is clamped to the rows actually available, so a request that
    /// would overrun returns the remainder — this is how partial tiles are
    /// extracted. `row_start` past the end yields an empty matrix.
    pub fn slice_rows(&self, row_start: usize, row_count: usize) -> Matrix {
        let start = row_start.min(self.rows);
        let count = row_count.min(self.rows - start);
        let lo = start * self.cols;
        let hi = lo + count * self.cols;
        Matrix {
            rows: count,
            cols: self.cols,
            data: self.data[lo..hi].to_vec(),
        }
    }

    /// Format rows as bracketed, comma-separated text with values truncated
    /// (not rounded) to `precision` decimal places.
    pub fn to_display_string(&self, precision: usize) -> String {
        let factor = 10f64.powi(precision as i32);
        let mut out = String::new();
        for r in 0..self.rows {
            out.push('[');
            for c in 0..self.cols {
                if c > 0 {
                    out.push_str(", ");
                }
                let v = self.data[r * self.cols + c] as f64;
                let truncated = (v * factor).trunc() / factor;
                out.push_str(&format!("{truncated:.precision$}"));
            }
            out.push_str("]\n");
        }
        out
    }
}
