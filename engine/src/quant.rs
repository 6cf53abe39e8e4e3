//! Block quantization codec and the linear-layer dispatch rule
//!
//! Tensors are quantized in blocks of `block_size` elements with one scale
//! per block: `scale = max(|block|) / 127` (never below `MIN_SCALE`), values
//! rounded and clamped to `[-127, 127]`. Weight matrices use square tiles of
//! `block_size x block_size` so the scale grid is
//! `[ceil(out / block_size), ceil(in / block_size)]`.
//!
//! Round-trip error is bounded per block by `max(|block|) / 254` (half a step).

use crate::device::DeviceMode;
use crate::errors::{EngineError, Result};
use crate::tensor_ops::{matmul_t, Tensor1D, Tensor2D};

/// Largest representable quantized magnitude
pub const QUANT_MAX: f32 = 127.0;

/// Scale floor for all-zero blocks
pub const MIN_SCALE: f32 = 1e-8;

/// A flat tensor quantized in contiguous blocks
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedBlocks {
    pub values: Vec<i8>,
    /// One scale per block; the last block may be partial
    pub scales: Vec<f32>,
    pub block_size: usize,
}

#[inline]
fn block_scale(block: &[f32]) -> f32 {
    let max_abs = block.iter().fold(0.0f32, |m, x| m.max(x.abs()));
    (max_abs / QUANT_MAX).max(MIN_SCALE)
}

#[inline]
fn quantize_value(x: f32, scale: f32) -> i8 {
    (x / scale).round().clamp(-QUANT_MAX, QUANT_MAX) as i8
}

/// Quantize a flat tensor block by block
pub fn quantize(data: &[f32], block_size: usize) -> Result<QuantizedBlocks> {
    if block_size == 0 {
        return Err(EngineError::Shape("block_size must be positive".to_string()));
    }

    let mut values = Vec::with_capacity(data.len());
    let mut scales = Vec::with_capacity(data.len().div_ceil(block_size));

    for block in data.chunks(block_size) {
        let scale = block_scale(block);
        values.extend(block.iter().map(|&x| quantize_value(x, scale)));
        scales.push(scale);
    }

    Ok(QuantizedBlocks {
        values,
        scales,
        block_size,
    })
}

/// Invert `quantize` by broadcasting each scale over its block
pub fn dequantize(blocks: &QuantizedBlocks) -> Vec<f32> {
    blocks
        .values
        .chunks(blocks.block_size)
        .zip(&blocks.scales)
        .flat_map(|(block, &scale)| block.iter().map(move |&q| q as f32 * scale))
        .collect()
}

/// A weight matrix quantized in square tiles
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeight {
    /// Row-major [rows, cols] quantized values
    pub values: Vec<i8>,
    /// Scale grid [ceil(rows / block_size), ceil(cols / block_size)]
    pub scale: Tensor2D,
    pub rows: usize,
    pub cols: usize,
    pub block_size: usize,
}

impl QuantizedWeight {
    pub fn new(
        values: Vec<i8>,
        scale: Tensor2D,
        rows: usize,
        cols: usize,
        block_size: usize,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(EngineError::Shape("block_size must be positive".to_string()));
        }
        if values.len() != rows * cols {
            return Err(EngineError::Shape(format!(
                "Quantized data length {} doesn't match shape {}x{}",
                values.len(),
                rows,
                cols
            )));
        }
        let grid = (rows.div_ceil(block_size), cols.div_ceil(block_size));
        if (scale.rows, scale.cols) != grid {
            return Err(EngineError::Shape(format!(
                "Scale grid {}x{} doesn't match {}x{} weight with block size {}",
                scale.rows, scale.cols, rows, cols, block_size
            )));
        }
        Ok(Self {
            values,
            scale,
            rows,
            cols,
            block_size,
        })
    }

    /// Quantize a dense weight tile by tile
    pub fn quantize(weight: &Tensor2D, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(EngineError::Shape("block_size must be positive".to_string()));
        }
        let grid_rows = weight.rows.div_ceil(block_size);
        let grid_cols = weight.cols.div_ceil(block_size);
        let mut scale = Tensor2D::zeros(grid_rows, grid_cols);
        let mut values = vec![0i8; weight.len()];

        for br in 0..grid_rows {
            let rows = br * block_size..((br + 1) * block_size).min(weight.rows);
            for bc in 0..grid_cols {
                let cols = bc * block_size..((bc + 1) * block_size).min(weight.cols);

                let mut max_abs = 0.0f32;
                for r in rows.clone() {
                    for c in cols.clone() {
                        max_abs = max_abs.max(weight.get(r, c).abs());
                    }
                }
                let s = (max_abs / QUANT_MAX).max(MIN_SCALE);
                scale.set(br, bc, s);

                for r in rows.clone() {
                    for c in cols.clone() {
                        values[r * weight.cols + c] = quantize_value(weight.get(r, c), s);
                    }
                }
            }
        }

        Ok(Self {
            values,
            scale,
            rows: weight.rows,
            cols: weight.cols,
            block_size,
        })
    }

    /// Dequantize into a dense f32 matrix
    pub fn dequantize(&self) -> Tensor2D {
        let bs = self.block_size;
        let mut data = Vec::with_capacity(self.values.len());
        for r in 0..self.rows {
            let scale_row = self.scale.row(r / bs);
            let row = &self.values[r * self.cols..(r + 1) * self.cols];
            data.extend(
                row.iter()
                    .enumerate()
                    .map(|(c, &q)| q as f32 * scale_row[c / bs]),
            );
        }
        Tensor2D {
            data,
            rows: self.rows,
            cols: self.cols,
        }
    }

    /// Take rows `start..end`; boundaries must fall on tile edges
    pub fn row_slice(&self, start: usize, end: usize) -> Result<Self> {
        let bs = self.block_size;
        if end > self.rows || start > end || start % bs != 0 || (end % bs != 0 && end != self.rows)
        {
            return Err(EngineError::Shape(format!(
                "Row slice {}..{} is not block-aligned for {} rows with block size {}",
                start, end, self.rows, bs
            )));
        }
        let scale = self.scale.row_slice(start / bs, end.div_ceil(bs))?;
        Self::new(
            self.values[start * self.cols..end * self.cols].to_vec(),
            scale,
            end - start,
            self.cols,
            bs,
        )
    }

    /// Take columns `start..end`; boundaries must fall on tile edges
    pub fn column_slice(&self, start: usize, end: usize) -> Result<Self> {
        let bs = self.block_size;
        if end > self.cols || start > end || start % bs != 0 || (end % bs != 0 && end != self.cols)
        {
            return Err(EngineError::Shape(format!(
                "Column slice {}..{} is not block-aligned for {} cols with block size {}",
                start, end, self.cols, bs
            )));
        }
        let mut values = Vec::with_capacity(self.rows * (end - start));
        for r in 0..self.rows {
            values.extend_from_slice(&self.values[r * self.cols + start..r * self.cols + end]);
        }
        let scale = self.scale.column_slice(start / bs, end.div_ceil(bs))?;
        Self::new(values, scale, self.rows, end - start, bs)
    }
}

/// A linear-layer weight, tagged once at load time
#[derive(Debug, Clone, PartialEq)]
pub enum Weight {
    Dense(Tensor2D),
    Quantized(QuantizedWeight),
}

impl Weight {
    /// Output features
    pub fn rows(&self) -> usize {
        match self {
            Weight::Dense(w) => w.rows,
            Weight::Quantized(w) => w.rows,
        }
    }

    /// Input features
    pub fn cols(&self) -> usize {
        match self {
            Weight::Dense(w) => w.cols,
            Weight::Quantized(w) => w.cols,
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Weight::Quantized(_))
    }

    /// Full-precision copy of the weight
    pub fn to_dense(&self) -> Tensor2D {
        match self {
            Weight::Dense(w) => w.clone(),
            Weight::Quantized(w) => w.dequantize(),
        }
    }

    pub fn row_slice(&self, start: usize, end: usize) -> Result<Weight> {
        match self {
            Weight::Dense(w) => Ok(Weight::Dense(w.row_slice(start, end)?)),
            Weight::Quantized(w) => Ok(Weight::Quantized(w.row_slice(start, end)?)),
        }
    }

    pub fn column_slice(&self, start: usize, end: usize) -> Result<Weight> {
        match self {
            Weight::Dense(w) => Ok(Weight::Dense(w.column_slice(start, end)?)),
            Weight::Quantized(w) => Ok(Weight::Quantized(w.column_slice(start, end)?)),
        }
    }
}

/// `y = x @ W^T (+ bias)` with the matmul chosen by the weight tag.
///
/// Dense weights use the standard product. Quantized weights use the fused
/// integer kernel in `DeviceMode::Fused`, otherwise the weight is dequantized
/// and the activation stays in full precision.
pub fn linear(
    x: &Tensor2D,
    weight: &Weight,
    bias: Option<&Tensor1D>,
    mode: DeviceMode,
) -> Result<Tensor2D> {
    let mut y = match (weight, mode) {
        (Weight::Dense(w), _) => matmul_t(x, w)?,
        (Weight::Quantized(w), DeviceMode::Fused) => fused_matmul(x, w)?,
        (Weight::Quantized(w), DeviceMode::Fallback) => matmul_t(x, &w.dequantize())?,
    };

    if let Some(bias) = bias {
        if bias.len() != y.cols {
            return Err(EngineError::Shape(format!(
                "Bias length {} doesn't match {} output features",
                bias.len(),
                y.cols
            )));
        }
        for r in 0..y.rows {
            for (v, b) in y.row_mut(r).iter_mut().zip(&bias.data) {
                *v += b;
            }
        }
    }

    Ok(y)
}

/// Integer matmul against a tile-quantized weight.
///
/// Each activation row is quantized in `block_size` blocks along the
/// reduction axis. Products accumulate in `i32` per block and are rescaled by
/// the activation block scale times the weight tile scale.
fn fused_matmul(x: &Tensor2D, w: &QuantizedWeight) -> Result<Tensor2D> {
    if x.cols != w.cols {
        return Err(EngineError::Shape(format!(
            "Linear shape mismatch: {}x{} @ ({}x{})^T",
            x.rows, x.cols, w.rows, w.cols
        )));
    }

    let bs = w.block_size;
    let mut out = Vec::with_capacity(x.rows * w.rows);

    for i in 0..x.rows {
        let xq = quantize(x.row(i), bs)?;
        for j in 0..w.rows {
            let w_row = &w.values[j * w.cols..(j + 1) * w.cols];
            let w_scales = w.scale.row(j / bs);

            let mut acc = 0.0f32;
            for (b, (x_block, w_block)) in xq.values.chunks(bs).zip(w_row.chunks(bs)).enumerate() {
                let partial: i32 = x_block
                    .iter()
                    .zip(w_block)
                    .map(|(&xa, &wb)| xa as i32 * wb as i32)
                    .sum();
                acc += partial as f32 * xq.scales[b] * w_scales[b];
            }
            out.push(acc);
        }
    }

    Tensor2D::new(out, x.rows, w.rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_ops::relative_error;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_tensor(rows: usize, cols: usize, seed: u64) -> Tensor2D {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Tensor2D::new(data, rows, cols).unwrap()
    }

    #[test]
    fn test_roundtrip_error_bound_per_block() {
        let t = random_tensor(1, 300, 7);
        let q = quantize(&t.data, 128).unwrap();
        assert_eq!(q.scales.len(), 3);

        let restored = dequantize(&q);
        for (block, restored_block) in t.data.chunks(128).zip(restored.chunks(128)) {
            let max_abs = block.iter().fold(0.0f32, |m, x| m.max(x.abs()));
            for (a, b) in block.iter().zip(restored_block) {
                assert!((a - b).abs() <= max_abs / 127.0 + 1e-7);
            }
        }
    }

    #[test]
    fn test_zero_block_uses_scale_floor() {
        let q = quantize(&[0.0; 4], 4).unwrap();
        assert_eq!(q.scales, vec![MIN_SCALE]);
        assert_eq!(q.values, vec![0; 4]);
    }

    #[test]
    fn test_extreme_value_maps_to_quant_max() {
        let q = quantize(&[-2.0, 1.0, 0.0, 2.0], 4).unwrap();
        assert_eq!(q.values[0], -127);
        assert_eq!(q.values[3], 127);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(quantize(&[1.0], 0).is_err());
    }

    #[test]
    fn test_weight_scale_grid_shape() {
        let w = random_tensor(130, 260, 3);
        let q = QuantizedWeight::quantize(&w, 128).unwrap();
        assert_eq!((q.scale.rows, q.scale.cols), (2, 3));

        let restored = q.dequantize();
        assert!(relative_error(&restored.data, &w.data) < 1e-2);
    }

    #[test]
    fn test_quantized_weight_new_checks_grid() {
        let bad = QuantizedWeight::new(vec![0; 16], Tensor2D::zeros(2, 2), 4, 4, 4);
        assert!(bad.is_err());
    }

    #[test]
    fn test_linear_dense_with_bias() {
        let x = Tensor2D::new(vec![1.0, 2.0], 1, 2).unwrap();
        let w = Weight::Dense(Tensor2D::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], 3, 2).unwrap());
        let bias = Tensor1D::new(vec![0.5, 0.5, 0.5]);

        let y = linear(&x, &w, Some(&bias), DeviceMode::Fallback).unwrap();
        assert_eq!(y.data, vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_fused_matches_fallback_within_tolerance() {
        let x = random_tensor(4, 256, 11);
        let w = Weight::Quantized(QuantizedWeight::quantize(&random_tensor(64, 256, 12), 128).unwrap());

        let fused = linear(&x, &w, None, DeviceMode::Fused).unwrap();
        let fallback = linear(&x, &w, None, DeviceMode::Fallback).unwrap();

        assert!(relative_error(&fused.data, &fallback.data) < 3e-2);
    }

    #[test]
    fn test_block_aligned_slices() {
        let w = QuantizedWeight::quantize(&random_tensor(8, 8, 5), 4).unwrap();

        let rows = w.row_slice(4, 8).unwrap();
        assert_eq!(rows.rows, 4);
        assert_eq!(rows.scale.rows, 1);
        assert_eq!(rows.dequantize(), w.dequantize().row_slice(4, 8).unwrap());

        let cols = w.column_slice(0, 4).unwrap();
        assert_eq!(cols.dequantize(), w.dequantize().column_slice(0, 4).unwrap());

        assert!(w.row_slice(2, 6).is_err());
    }
}
