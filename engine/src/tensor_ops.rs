//! Dense tensor operations for the forward pass
//!
//! This module provides the numeric building blocks shared by every layer:
//! - Row-major 2D tensors with shape-checked construction and slicing
//! - Matrix multiplication (both `A @ B` and the linear-layer form `X @ W^T`)
//! - SiLU activation, RMS normalization and softmax
//! - Greedy selection over logits

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// 2D Tensor for transformer computations
///
/// Shape convention: [tokens, features]. Weights use the linear-layer
/// convention [out_features, in_features].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor2D {
    /// Row-major data storage
    pub data: Vec<f32>,
    pub rows: usize,
    pub cols: usize,
}

impl Tensor2D {
    /// Create a new tensor with given dimensions
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(EngineError::Shape(format!(
                "Data length {} doesn't match shape {}x{}={}",
                data.len(),
                rows,
                cols,
                rows * cols
            )));
        }
        Ok(Self { data, rows, cols })
    }

    /// Create a tensor filled with zeros
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    /// Get element at (row, col)
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    /// Set element at (row, col)
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.cols + col] = value;
    }

    /// Get a row as a slice
    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.cols;
        &self.data[start..start + self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [f32] {
        let start = row * self.cols;
        &mut self.data[start..start + self.cols]
    }

    /// Get total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// In-place element-wise addition (residual connections)
    pub fn add_assign(&mut self, other: &Tensor2D) -> Result<()> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(EngineError::Shape(format!(
                "Shape mismatch for add: {}x{} vs {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }

    /// Element-wise multiplication (Hadamard product)
    pub fn mul(&self, other: &Tensor2D) -> Result<Tensor2D> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(EngineError::Shape(format!(
                "Shape mismatch for mul: {}x{} vs {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }

        let data: Vec<f32> = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a * b)
            .collect();

        Ok(Tensor2D {
            data,
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Transpose the tensor
    pub fn transpose(&self) -> Tensor2D {
        let mut data = vec![0.0; self.data.len()];
        for i in 0..self.rows {
            for j in 0..self.cols {
                data[j * self.rows + i] = self.data[i * self.cols + j];
            }
        }
        Tensor2D {
            data,
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Extract a column range
    ///
    /// Used to split fused projections and to take this worker's input slice
    /// of a row-parallel weight.
    pub fn column_slice(&self, col_start: usize, col_end: usize) -> Result<Tensor2D> {
        if col_end > self.cols || col_start > col_end {
            return Err(EngineError::Shape(format!(
                "Invalid column slice {}..{} for tensor with {} cols",
                col_start, col_end, self.cols
            )));
        }

        let slice_cols = col_end - col_start;
        let mut data = Vec::with_capacity(self.rows * slice_cols);

        for row in 0..self.rows {
            let row_start = row * self.cols + col_start;
            let row_end = row * self.cols + col_end;
            data.extend_from_slice(&self.data[row_start..row_end]);
        }

        Ok(Tensor2D {
            data,
            rows: self.rows,
            cols: slice_cols,
        })
    }

    /// Extract a row range (column-parallel weight shards)
    pub fn row_slice(&self, row_start: usize, row_end: usize) -> Result<Tensor2D> {
        if row_end > self.rows || row_start > row_end {
            return Err(EngineError::Shape(format!(
                "Invalid row slice {}..{} for tensor with {} rows",
                row_start, row_end, self.rows
            )));
        }
        Ok(Tensor2D {
            data: self.data[row_start * self.cols..row_end * self.cols].to_vec(),
            rows: row_end - row_start,
            cols: self.cols,
        })
    }

    /// Gather the given rows into a new tensor
    pub fn select_rows(&self, rows: &[usize]) -> Tensor2D {
        let mut data = Vec::with_capacity(rows.len() * self.cols);
        for &r in rows {
            data.extend_from_slice(self.row(r));
        }
        Tensor2D {
            data,
            rows: rows.len(),
            cols: self.cols,
        }
    }

    /// Concatenate two tensors along the column axis
    pub fn concat_cols(&self, other: &Tensor2D) -> Result<Tensor2D> {
        if self.rows != other.rows {
            return Err(EngineError::Shape(format!(
                "Row mismatch for concat: {} vs {}",
                self.rows, other.rows
            )));
        }
        let cols = self.cols + other.cols;
        let mut data = Vec::with_capacity(self.rows * cols);
        for r in 0..self.rows {
            data.extend_from_slice(self.row(r));
            data.extend_from_slice(other.row(r));
        }
        Ok(Tensor2D {
            data,
            rows: self.rows,
            cols,
        })
    }
}

/// 1D Tensor (vector)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor1D {
    pub data: Vec<f32>,
}

impl Tensor1D {
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    pub fn filled(len: usize, value: f32) -> Self {
        Self {
            data: vec![value; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ============== Matrix Operations ==============

/// Matrix multiplication: A[m, k] @ B[k, n] -> C[m, n]
pub fn matmul(a: &Tensor2D, b: &Tensor2D) -> Result<Tensor2D> {
    if a.cols != b.rows {
        return Err(EngineError::Shape(format!(
            "Matmul shape mismatch: {}x{} @ {}x{}",
            a.rows, a.cols, b.rows, b.cols
        )));
    }

    let m = a.rows;
    let k = a.cols;
    let n = b.cols;

    let mut result = vec![0.0; m * n];

    // i-p-j order keeps the inner loop contiguous in both B and C
    for i in 0..m {
        for p in 0..k {
            let a_ip = a.data[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            for j in 0..n {
                result[i * n + j] += a_ip * b.data[p * n + j];
            }
        }
    }

    Ok(Tensor2D {
        data: result,
        rows: m,
        cols: n,
    })
}

/// Linear-layer product: X[m, k] @ W[n, k]^T -> Y[m, n]
///
/// Weights are stored [out_features, in_features] so each output element is a
/// dot product of two contiguous rows.
pub fn matmul_t(x: &Tensor2D, w: &Tensor2D) -> Result<Tensor2D> {
    if x.cols != w.cols {
        return Err(EngineError::Shape(format!(
            "Linear shape mismatch: {}x{} @ ({}x{})^T",
            x.rows, x.cols, w.rows, w.cols
        )));
    }

    let m = x.rows;
    let n = w.rows;
    let mut result = Vec::with_capacity(m * n);

    for i in 0..m {
        let xi = x.row(i);
        for j in 0..n {
            result.push(dot(xi, w.row(j)));
        }
    }

    Ok(Tensor2D {
        data: result,
        rows: m,
        cols: n,
    })
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ============== Activation Functions ==============

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// SiLU (Sigmoid Linear Unit) / Swish activation
///
/// silu(x) = x * sigmoid(x)
pub fn silu(tensor: &Tensor2D) -> Tensor2D {
    let data: Vec<f32> = tensor.data.iter().map(|&x| x * sigmoid(x)).collect();

    Tensor2D {
        data,
        rows: tensor.rows,
        cols: tensor.cols,
    }
}

// ============== Normalization ==============

/// RMS Layer Normalization
///
/// RMSNorm(x) = x / sqrt(mean(x^2) + eps) * gamma
pub fn rms_norm(tensor: &Tensor2D, gamma: &Tensor1D, eps: f32) -> Result<Tensor2D> {
    if tensor.cols != gamma.len() {
        return Err(EngineError::Shape(format!(
            "RMS norm dimension mismatch: tensor cols {} vs gamma {}",
            tensor.cols,
            gamma.len()
        )));
    }

    let mut result = Vec::with_capacity(tensor.data.len());

    for row in 0..tensor.rows {
        let row_data = tensor.row(row);

        let mean_sq: f32 = row_data.iter().map(|x| x * x).sum::<f32>() / tensor.cols as f32;
        let rms = (mean_sq + eps).sqrt();

        for (i, &x) in row_data.iter().enumerate() {
            result.push((x / rms) * gamma.data[i]);
        }
    }

    Ok(Tensor2D {
        data: result,
        rows: tensor.rows,
        cols: tensor.cols,
    })
}

// ============== Softmax ==============

/// In-place softmax over a single row
///
/// Entries equal to `-inf` (masked positions) come out as exactly zero.
pub fn softmax_in_place(row: &mut [f32]) {
    let max_val = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max_val == f32::NEG_INFINITY {
        return;
    }
    let mut exp_sum = 0.0;
    for x in row.iter_mut() {
        *x = (*x - max_val).exp();
        exp_sum += *x;
    }
    for x in row.iter_mut() {
        *x /= exp_sum;
    }
}

/// Softmax over the last dimension (columns)
pub fn softmax(tensor: &Tensor2D) -> Tensor2D {
    let mut result = tensor.clone();
    for row in 0..result.rows {
        softmax_in_place(result.row_mut(row));
    }
    result
}

// ============== Token Selection ==============

/// Greedy selection (argmax); ties resolve to the lowest index
pub fn argmax(logits: &[f32]) -> u32 {
    let mut max_idx = 0;
    let mut max_val = f32::NEG_INFINITY;

    for (i, &val) in logits.iter().enumerate() {
        if val > max_val {
            max_val = val;
            max_idx = i;
        }
    }

    max_idx as u32
}

/// Relative Frobenius error `||a - b|| / ||b||`
pub fn relative_error(a: &[f32], b: &[f32]) -> f32 {
    let diff: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    let norm: f32 = b.iter().map(|y| y * y).sum();
    if norm == 0.0 {
        return diff.sqrt();
    }
    (diff / norm).sqrt()
}
