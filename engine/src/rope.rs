//! Rotary positional embedding with YaRN long-context correction
//!
//! The table holds one unit rotation per (position, frequency) pair for every
//! position up to `max_seq_len`. It is built once from the configuration and
//! shared read-only by all attention layers.

use crate::config::ModelConfig;
use crate::errors::{EngineError, Result};
use std::f32::consts::PI;

/// Precomputed rotation factors, `[max_seq_len, rope_dim / 2]`
#[derive(Debug, Clone)]
pub struct RotaryTable {
    cos: Vec<f32>,
    sin: Vec<f32>,
    max_seq_len: usize,
    half_dim: usize,
    /// Per-frequency weight of the rescaled (interpolated) frequency
    interpolation: Vec<f32>,
    frequencies: Vec<f32>,
}

/// Dimension index at which a frequency completes `num_rotations` turns over `max_seq_len`
fn correction_dim(num_rotations: f32, dim: usize, base: f32, max_seq_len: usize) -> f32 {
    dim as f32 * (max_seq_len as f32 / (num_rotations * 2.0 * PI)).ln() / (2.0 * base.ln())
}

/// `[low, high]` dimension window between the fast and slow rotation thresholds
fn correction_range(
    low_rot: f32,
    high_rot: f32,
    dim: usize,
    base: f32,
    max_seq_len: usize,
) -> (f32, f32) {
    let low = correction_dim(low_rot, dim, base, max_seq_len).floor();
    let high = correction_dim(high_rot, dim, base, max_seq_len).ceil();
    (low.max(0.0), high.min(dim as f32 - 1.0))
}

/// Linear ramp from 0 at `min` to 1 at `max`, clamped
fn linear_ramp(min: f32, mut max: f32, len: usize) -> Vec<f32> {
    if min == max {
        max += 0.001;
    }
    (0..len)
        .map(|i| ((i as f32 - min) / (max - min)).clamp(0.0, 1.0))
        .collect()
}

impl RotaryTable {
    pub fn new(config: &ModelConfig) -> Self {
        let dim = config.qk_rope_head_dim;
        let half_dim = dim / 2;
        let base = config.rope_theta;

        let base_freqs: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / base.powf((2 * i) as f32 / dim as f32))
            .collect();

        let interpolation = if config.is_long_context() {
            let (low, high) = correction_range(
                config.beta_fast,
                config.beta_slow,
                dim,
                base,
                config.original_seq_len,
            );
            linear_ramp(low, high, half_dim)
        } else {
            vec![0.0; half_dim]
        };

        let frequencies: Vec<f32> = base_freqs
            .iter()
            .zip(&interpolation)
            .map(|(&f, &w)| f / config.rope_factor * w + f * (1.0 - w))
            .collect();

        let max_seq_len = config.max_seq_len;
        let mut cos = Vec::with_capacity(max_seq_len * half_dim);
        let mut sin = Vec::with_capacity(max_seq_len * half_dim);
        for pos in 0..max_seq_len {
            for &freq in &frequencies {
                let angle = pos as f32 * freq;
                cos.push(angle.cos());
                sin.push(angle.sin());
            }
        }

        Self {
            cos,
            sin,
            max_seq_len,
            half_dim,
            interpolation,
            frequencies,
        }
    }

    /// Number of positions in the table
    pub fn len(&self) -> usize {
        self.max_seq_len
    }

    pub fn is_empty(&self) -> bool {
        self.max_seq_len == 0
    }

    /// Number of complex pairs per position
    pub fn half_dim(&self) -> usize {
        self.half_dim
    }

    /// Blend weight of the rescaled frequency for each pair (0 = raw frequency)
    pub fn interpolation_weights(&self) -> &[f32] {
        &self.interpolation
    }

    pub fn frequencies(&self) -> &[f32] {
        &self.frequencies
    }

    /// `(cos, sin)` of the rotation at `position` for pair `pair`
    pub fn rotation(&self, position: usize, pair: usize) -> (f32, f32) {
        let idx = position * self.half_dim + pair;
        (self.cos[idx], self.sin[idx])
    }

    /// Rotate the rotary slice `x` in place for `position`.
    ///
    /// Adjacent elements `(x[2i], x[2i+1])` form one complex number which is
    /// multiplied by the unit rotator for pair `i`.
    pub fn apply(&self, x: &mut [f32], position: usize) -> Result<()> {
        if x.len() != 2 * self.half_dim {
            return Err(EngineError::Shape(format!(
                "Rotary slice has {} elements, expected {}",
                x.len(),
                2 * self.half_dim
            )));
        }
        if position >= self.max_seq_len {
            return Err(EngineError::Shape(format!(
                "Position {} outside rotary table of {}",
                position, self.max_seq_len
            )));
        }

        let offset = position * self.half_dim;
        let cos = &self.cos[offset..offset + self.half_dim];
        let sin = &self.sin[offset..offset + self.half_dim];
        for (i, pair) in x.chunks_exact_mut(2).enumerate() {
            let (re, im) = (pair[0], pair[1]);
            pair[0] = re * cos[i] - im * sin[i];
            pair[1] = re * sin[i] + im * cos[i];
        }
        Ok(())
    }
}
