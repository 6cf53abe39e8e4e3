//! Multi-Head Latent Attention
//!
//! Keys and values are compressed into a shared low-rank latent
//! (`kv_lora_rank`) plus a small rotary-only key slice shared by all heads.
//! Two execution strategies are bound at construction:
//!
//! - **Naive**: expand the latent through `wkv_b` into per-head keys and
//!   values and cache those.
//! - **Absorbed**: fold the key half of `wkv_b` into each query head and the
//!   value half into the output, so scores and context are computed directly
//!   against the cached latent.
//!
//! Hidden states are `[batch * seq_len, dim]` with rows grouped by sequence.
//! Under tensor parallelism each worker owns `n_heads / world_size` heads;
//! `wo` is row-parallel and its output is all-reduced.

use crate::config::{AttnImpl, ModelConfig};
use crate::device::DeviceMode;
use crate::errors::{EngineError, Result};
use crate::kv_cache::{LatentCache, NaiveCache};
use crate::parallel::ParallelContext;
use crate::quant::{linear, Weight};
use crate::rope::RotaryTable;
use crate::tensor_ops::{dot, rms_norm, softmax_in_place, Tensor1D, Tensor2D};
use tracing::trace;

/// Query projection, optionally through a low-rank bottleneck
#[derive(Debug, Clone)]
pub enum QueryProjection {
    /// `wq: [local_heads * qk_head_dim, dim]`
    Direct { wq: Weight },
    /// `wq_a: [q_lora_rank, dim]`, `wq_b: [local_heads * qk_head_dim, q_lora_rank]`
    LowRank {
        wq_a: Weight,
        q_norm: Tensor1D,
        wq_b: Weight,
    },
}

impl QueryProjection {
    fn project(&self, x: &Tensor2D, eps: f32, mode: DeviceMode) -> Result<Tensor2D> {
        match self {
            QueryProjection::Direct { wq } => linear(x, wq, None, mode),
            QueryProjection::LowRank { wq_a, q_norm, wq_b } => {
                let compressed = rms_norm(&linear(x, wq_a, None, mode)?, q_norm, eps)?;
                linear(&compressed, wq_b, None, mode)
            }
        }
    }

    fn out_features(&self) -> usize {
        match self {
            QueryProjection::Direct { wq } => wq.rows(),
            QueryProjection::LowRank { wq_b, .. } => wq_b.rows(),
        }
    }
}

/// This worker's attention parameters
#[derive(Debug, Clone)]
pub struct AttentionWeights {
    pub query: QueryProjection,
    /// `[kv_lora_rank + qk_rope_head_dim, dim]`
    pub wkv_a: Weight,
    pub kv_norm: Tensor1D,
    /// `[local_heads * (qk_nope_head_dim + v_head_dim), kv_lora_rank]`
    pub wkv_b: Weight,
    /// `[dim, local_heads * v_head_dim]`
    pub wo: Weight,
}

#[derive(Debug, Clone)]
enum AttentionKernel {
    Naive { cache: NaiveCache },
    Absorbed {
        cache: LatentCache,
        /// Dequantized `wkv_b`, sliced per head at score time
        wkv_b: Tensor2D,
    },
}

#[derive(Debug, Clone, Copy)]
struct HeadDims {
    local_heads: usize,
    nope: usize,
    rope: usize,
    v: usize,
    kv_lora: usize,
}

impl HeadDims {
    fn qk(&self) -> usize {
        self.nope + self.rope
    }
}

/// Multi-head latent attention layer with its incremental cache
#[derive(Debug, Clone)]
pub struct LatentAttention {
    query: QueryProjection,
    wkv_a: Weight,
    kv_norm: Tensor1D,
    wkv_b: Weight,
    wo: Weight,
    kernel: AttentionKernel,
    dims: HeadDims,
    softmax_scale: f32,
    eps: f32,
    mode: DeviceMode,
    parallel: ParallelContext,
}

impl LatentAttention {
    pub fn new(
        config: &ModelConfig,
        weights: AttentionWeights,
        parallel: ParallelContext,
        mode: DeviceMode,
    ) -> Result<Self> {
        let dims = HeadDims {
            local_heads: config.n_heads / parallel.world_size,
            nope: config.qk_nope_head_dim,
            rope: config.qk_rope_head_dim,
            v: config.v_head_dim,
            kv_lora: config.kv_lora_rank,
        };

        let expect = |name: &str, weight: &Weight, rows: usize, cols: usize| -> Result<()> {
            if weight.rows() != rows || weight.cols() != cols {
                return Err(EngineError::Shape(format!(
                    "attention {} is {}x{}, expected {}x{}",
                    name,
                    weight.rows(),
                    weight.cols(),
                    rows,
                    cols
                )));
            }
            Ok(())
        };

        if weights.query.out_features() != dims.local_heads * dims.qk() {
            return Err(EngineError::Shape(format!(
                "query projection has {} outputs, expected {}",
                weights.query.out_features(),
                dims.local_heads * dims.qk()
            )));
        }
        expect("wkv_a", &weights.wkv_a, dims.kv_lora + dims.rope, config.dim)?;
        expect(
            "wkv_b",
            &weights.wkv_b,
            dims.local_heads * (dims.nope + dims.v),
            dims.kv_lora,
        )?;
        expect("wo", &weights.wo, config.dim, dims.local_heads * dims.v)?;
        if weights.kv_norm.len() != dims.kv_lora {
            return Err(EngineError::Shape(format!(
                "kv_norm has {} elements, expected {}",
                weights.kv_norm.len(),
                dims.kv_lora
            )));
        }

        let kernel = match config.attn_impl {
            AttnImpl::Naive => AttentionKernel::Naive {
                cache: NaiveCache::new(
                    config.max_batch_size,
                    config.max_seq_len,
                    dims.local_heads,
                    dims.qk(),
                    dims.v,
                ),
            },
            AttnImpl::Absorb => AttentionKernel::Absorbed {
                cache: LatentCache::new(
                    config.max_batch_size,
                    config.max_seq_len,
                    dims.kv_lora,
                    dims.rope,
                ),
                wkv_b: weights.wkv_b.to_dense(),
            },
        };

        Ok(Self {
            query: weights.query,
            wkv_a: weights.wkv_a,
            kv_norm: weights.kv_norm,
            wkv_b: weights.wkv_b,
            wo: weights.wo,
            kernel,
            dims,
            softmax_scale: config.softmax_scale(),
            eps: config.norm_eps,
            mode,
            parallel,
        })
    }

    /// Bytes held by this layer's cache
    pub fn cache_memory_bytes(&self) -> usize {
        match &self.kernel {
            AttentionKernel::Naive { cache } => cache.memory_bytes(),
            AttentionKernel::Absorbed { cache, .. } => cache.memory_bytes(),
        }
    }

    /// Attend over positions `[0, start_pos + seq_len)` for `batch` sequences.
    ///
    /// `x` is `[batch * seq_len, dim]`. New keys/values for
    /// `[start_pos, start_pos + seq_len)` are written into the cache first.
    /// Future positions are masked only when `seq_len > 1`.
    pub fn forward(
        &mut self,
        x: &Tensor2D,
        batch: usize,
        start_pos: usize,
        rotary: &RotaryTable,
    ) -> Result<Tensor2D> {
        if batch == 0 || x.rows % batch != 0 {
            return Err(EngineError::Shape(format!(
                "{} rows cannot be split into {} sequences",
                x.rows, batch
            )));
        }
        let seq_len = x.rows / batch;
        let end_pos = start_pos + seq_len;
        let dims = self.dims;

        let mut q = self.query.project(x, self.eps, self.mode)?;
        let kv = linear(x, &self.wkv_a, None, self.mode)?;
        let mut k_pe = kv.column_slice(dims.kv_lora, dims.kv_lora + dims.rope)?;
        let latent = rms_norm(&kv.column_slice(0, dims.kv_lora)?, &self.kv_norm, self.eps)?;

        for row in 0..x.rows {
            let pos = start_pos + row % seq_len;
            let q_row = q.row_mut(row);
            for h in 0..dims.local_heads {
                let base = h * dims.qk() + dims.nope;
                rotary.apply(&mut q_row[base..base + dims.rope], pos)?;
            }
            rotary.apply(k_pe.row_mut(row), pos)?;
        }

        let context = match &mut self.kernel {
            AttentionKernel::Naive { cache } => {
                let kv_b = linear(&latent, &self.wkv_b, None, self.mode)?;
                naive_attention(
                    cache,
                    &q,
                    &kv_b,
                    &k_pe,
                    dims,
                    batch,
                    start_pos,
                    self.softmax_scale,
                )?
            }
            AttentionKernel::Absorbed { cache, wkv_b } => absorbed_attention(
                cache,
                wkv_b,
                &q,
                &latent,
                &k_pe,
                dims,
                batch,
                start_pos,
                self.softmax_scale,
            )?,
        };

        trace!(batch, start_pos, end_pos, "Attention computed");

        let mut out = linear(&context, &self.wo, None, self.mode)?;
        self.parallel.all_reduce(&mut out.data)?;
        Ok(out)
    }
}

/// Whether key position `t` is hidden from query `s` of a multi-token call
#[inline]
fn is_masked(seq_len: usize, start_pos: usize, s: usize, t: usize) -> bool {
    seq_len > 1 && t > start_pos + s
}

#[allow(clippy::too_many_arguments)]
fn naive_attention(
    cache: &mut NaiveCache,
    q: &Tensor2D,
    kv_b: &Tensor2D,
    k_pe: &Tensor2D,
    dims: HeadDims,
    batch: usize,
    start_pos: usize,
    scale: f32,
) -> Result<Tensor2D> {
    let seq_len = q.rows / batch;
    let end_pos = start_pos + seq_len;
    let qk = dims.qk();
    let head_kv = dims.nope + dims.v;

    // Per-head keys are [k_nope_h, k_pe], values are v_h
    let mut key = vec![0.0; dims.local_heads * qk];
    let mut value = vec![0.0; dims.local_heads * dims.v];
    for row in 0..q.rows {
        let (b, s) = (row / seq_len, row % seq_len);
        let kv_row = kv_b.row(row);
        for h in 0..dims.local_heads {
            let src = &kv_row[h * head_kv..(h + 1) * head_kv];
            key[h * qk..h * qk + dims.nope].copy_from_slice(&src[..dims.nope]);
            key[h * qk + dims.nope..(h + 1) * qk].copy_from_slice(k_pe.row(row));
            value[h * dims.v..(h + 1) * dims.v].copy_from_slice(&src[dims.nope..]);
        }
        cache.keys.write(b, start_pos + s, &key)?;
        cache.values.write(b, start_pos + s, &value)?;
    }

    let mut out = Tensor2D::zeros(q.rows, dims.local_heads * dims.v);
    let mut scores = vec![0.0; end_pos];
    for row in 0..q.rows {
        let (b, s) = (row / seq_len, row % seq_len);
        let q_row = q.row(row);
        for h in 0..dims.local_heads {
            let q_head = &q_row[h * qk..(h + 1) * qk];
            for (t, score) in scores.iter_mut().enumerate() {
                *score = if is_masked(seq_len, start_pos, s, t) {
                    f32::NEG_INFINITY
                } else {
                    dot(q_head, &cache.keys.entry(b, t)[h * qk..(h + 1) * qk]) * scale
                };
            }
            softmax_in_place(&mut scores);

            let out_head = &mut out.row_mut(row)[h * dims.v..(h + 1) * dims.v];
            for (t, &p) in scores.iter().enumerate() {
                if p == 0.0 {
                    continue;
                }
                let v = &cache.values.entry(b, t)[h * dims.v..(h + 1) * dims.v];
                for (o, &vi) in out_head.iter_mut().zip(v) {
                    *o += p * vi;
                }
            }
        }
    }

    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn absorbed_attention(
    cache: &mut LatentCache,
    wkv_b: &Tensor2D,
    q: &Tensor2D,
    latent: &Tensor2D,
    k_pe: &Tensor2D,
    dims: HeadDims,
    batch: usize,
    start_pos: usize,
    scale: f32,
) -> Result<Tensor2D> {
    let seq_len = q.rows / batch;
    let end_pos = start_pos + seq_len;
    let qk = dims.qk();
    let head_kv = dims.nope + dims.v;
    let c = dims.kv_lora;

    for row in 0..q.rows {
        let (b, s) = (row / seq_len, row % seq_len);
        cache.latent.write(b, start_pos + s, latent.row(row))?;
        cache.rope.write(b, start_pos + s, k_pe.row(row))?;
    }

    let mut out = Tensor2D::zeros(q.rows, dims.local_heads * dims.v);
    let mut scores = vec![0.0; end_pos];
    let mut q_latent = vec![0.0; c];
    let mut ctx = vec![0.0; c];

    for row in 0..q.rows {
        let (b, s) = (row / seq_len, row % seq_len);
        let q_row = q.row(row);
        let latents = cache.latent.prefix(b, end_pos)?;
        let pes = cache.rope.prefix(b, end_pos)?;

        for h in 0..dims.local_heads {
            let q_nope = &q_row[h * qk..h * qk + dims.nope];
            let q_pe = &q_row[h * qk + dims.nope..(h + 1) * qk];

            // q_latent = q_nope @ W_k[h], W_k[h] is [nope, kv_lora]
            q_latent.iter_mut().for_each(|v| *v = 0.0);
            for (d, &qd) in q_nope.iter().enumerate() {
                let w_row = wkv_b.row(h * head_kv + d);
                for (acc, &w) in q_latent.iter_mut().zip(w_row) {
                    *acc += qd * w;
                }
            }

            for (t, score) in scores.iter_mut().enumerate() {
                *score = if is_masked(seq_len, start_pos, s, t) {
                    f32::NEG_INFINITY
                } else {
                    let lat = &latents[t * c..(t + 1) * c];
                    let pe = &pes[t * dims.rope..(t + 1) * dims.rope];
                    (dot(&q_latent, lat) + dot(q_pe, pe)) * scale
                };
            }
            softmax_in_place(&mut scores);

            ctx.iter_mut().for_each(|v| *v = 0.0);
            for (t, &p) in scores.iter().enumerate() {
                if p == 0.0 {
                    continue;
                }
                for (acc, &l) in ctx.iter_mut().zip(&latents[t * c..(t + 1) * c]) {
                    *acc += p * l;
                }
            }

            // out_h = ctx @ W_v[h]^T, W_v[h] is [v, kv_lora]
            let out_row = out.row_mut(row);
            for d in 0..dims.v {
                out_row[h * dims.v + d] = dot(&ctx, wkv_b.row(h * head_kv + dims.nope + d));
            }
        }
    }

    Ok(out)
}
