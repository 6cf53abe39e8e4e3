//! Incremental attention caches
//!
//! Buffers are allocated once at model construction with shape
//! `[max_batch_size, max_seq_len, width]` and reused across sessions. Entries
//! are overwritten by position; the physical memory never shrinks. How much of
//! the buffer is valid is tracked by the session, not the cache.

use crate::errors::{EngineError, Result};

/// Preallocated `[max_batch, max_seq_len, width]` buffer
#[derive(Debug, Clone)]
pub struct CacheBuffer {
    data: Vec<f32>,
    max_batch: usize,
    max_seq_len: usize,
    width: usize,
}

impl CacheBuffer {
    pub fn new(max_batch: usize, max_seq_len: usize, width: usize) -> Self {
        Self {
            data: vec![0.0; max_batch * max_seq_len * width],
            max_batch,
            max_seq_len,
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    fn offset(&self, batch: usize, pos: usize) -> Result<usize> {
        if batch >= self.max_batch || pos >= self.max_seq_len {
            return Err(EngineError::Shape(format!(
                "Cache index ({}, {}) outside [{}, {}]",
                batch, pos, self.max_batch, self.max_seq_len
            )));
        }
        Ok((batch * self.max_seq_len + pos) * self.width)
    }

    /// Store one position's entry
    pub fn write(&mut self, batch: usize, pos: usize, values: &[f32]) -> Result<()> {
        if values.len() != self.width {
            return Err(EngineError::Shape(format!(
                "Cache entry has {} elements, expected {}",
                values.len(),
                self.width
            )));
        }
        let start = self.offset(batch, pos)?;
        self.data[start..start + self.width].copy_from_slice(values);
        Ok(())
    }

    /// One position's entry
    #[inline]
    pub fn entry(&self, batch: usize, pos: usize) -> &[f32] {
        let start = (batch * self.max_seq_len + pos) * self.width;
        &self.data[start..start + self.width]
    }

    /// Entries `[0, end)` of one batch slot, contiguous
    pub fn prefix(&self, batch: usize, end: usize) -> Result<&[f32]> {
        if end > self.max_seq_len {
            return Err(EngineError::Shape(format!(
                "Cache prefix {} exceeds max_seq_len {}",
                end, self.max_seq_len
            )));
        }
        let start = self.offset(batch, 0)?;
        Ok(&self.data[start..start + end * self.width])
    }

    pub fn memory_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// Raw per-head keys and values
#[derive(Debug, Clone)]
pub struct NaiveCache {
    /// `[.., local_heads * qk_head_dim]`
    pub keys: CacheBuffer,
    /// `[.., local_heads * v_head_dim]`
    pub values: CacheBuffer,
}

impl NaiveCache {
    pub fn new(
        max_batch: usize,
        max_seq_len: usize,
        local_heads: usize,
        qk_head_dim: usize,
        v_head_dim: usize,
    ) -> Self {
        Self {
            keys: CacheBuffer::new(max_batch, max_seq_len, local_heads * qk_head_dim),
            values: CacheBuffer::new(max_batch, max_seq_len, local_heads * v_head_dim),
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.keys.memory_bytes() + self.values.memory_bytes()
    }
}

/// Normalized latent plus the shared rotary key slice
#[derive(Debug, Clone)]
pub struct LatentCache {
    /// `[.., kv_lora_rank]`
    pub latent: CacheBuffer,
    /// `[.., qk_rope_head_dim]`
    pub rope: CacheBuffer,
}

impl LatentCache {
    pub fn new(max_batch: usize, max_seq_len: usize, kv_lora_rank: usize, rope_dim: usize) -> Self {
        Self {
            latent: CacheBuffer::new(max_batch, max_seq_len, kv_lora_rank),
            rope: CacheBuffer::new(max_batch, max_seq_len, rope_dim),
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.latent.memory_bytes() + self.rope.memory_bytes()
    }
}
