//! Transformer model
//!
//! Embedding, a stack of pre-norm blocks (latent attention followed by a dense
//! MLP for the first `n_dense_layers` and mixture-of-experts afterwards), a
//! final norm and the vocabulary head. Only the last position's logits are
//! computed.

use crate::attention::{AttentionWeights, LatentAttention, QueryProjection};
use crate::config::ModelConfig;
use crate::device::DeviceMode;
use crate::errors::{EngineError, GenerationError, Result};
use crate::moe::{ExpertPool, Gate, Mlp, MoE, SwiGlu};
use crate::parallel::ParallelContext;
use crate::quant::{linear, Weight};
use crate::rope::RotaryTable;
use crate::tensor_ops::{rms_norm, Tensor1D, Tensor2D};
use crate::weights::{Shard, WeightStore};
use std::ops::Range;
use std::time::Instant;
use tracing::{debug, info};

/// Feed-forward half of a block
#[derive(Debug, Clone)]
pub enum FeedForward {
    Dense(Mlp),
    Moe(MoE),
}

impl FeedForward {
    fn forward(&self, x: &Tensor2D) -> Result<Tensor2D> {
        match self {
            FeedForward::Dense(mlp) => mlp.forward(x),
            FeedForward::Moe(moe) => moe.forward(x),
        }
    }
}

/// Pre-norm residual block
#[derive(Debug, Clone)]
pub struct Block {
    attn_norm: Tensor1D,
    attn: LatentAttention,
    ffn_norm: Tensor1D,
    ffn: FeedForward,
    eps: f32,
}

impl Block {
    fn forward(
        &mut self,
        x: &Tensor2D,
        batch: usize,
        start_pos: usize,
        rotary: &RotaryTable,
    ) -> Result<Tensor2D> {
        let normed = rms_norm(x, &self.attn_norm, self.eps)?;
        let mut h = self.attn.forward(&normed, batch, start_pos, rotary)?;
        h.add_assign(x)?;

        let normed = rms_norm(&h, &self.ffn_norm, self.eps)?;
        let mut out = self.ffn.forward(&normed)?;
        out.add_assign(&h)?;
        Ok(out)
    }

    pub fn is_moe(&self) -> bool {
        matches!(self.ffn, FeedForward::Moe(_))
    }
}

fn load_swiglu(
    store: &WeightStore,
    prefix: &str,
    dim: usize,
    inter: usize,
    sharded: bool,
) -> Result<SwiGlu> {
    let (up, down) = if sharded {
        (Shard::Rows, Shard::Cols)
    } else {
        (Shard::Replicated, Shard::Replicated)
    };
    Ok(SwiGlu {
        w1: store.weight(&format!("{}.w1", prefix), inter, dim, up)?,
        w2: store.weight(&format!("{}.w2", prefix), dim, inter, down)?,
        w3: store.weight(&format!("{}.w3", prefix), inter, dim, up)?,
    })
}

fn load_block(
    config: &ModelConfig,
    store: &WeightStore,
    layer: usize,
    parallel: &ParallelContext,
    mode: DeviceMode,
) -> Result<Block> {
    let p = format!("layers.{}", layer);
    let c = config;
    let heads = c.n_heads;

    let query = if c.q_lora_rank == 0 {
        QueryProjection::Direct {
            wq: store.weight(
                &format!("{}.attn.wq", p),
                heads * c.qk_head_dim(),
                c.dim,
                Shard::Rows,
            )?,
        }
    } else {
        QueryProjection::LowRank {
            wq_a: store.weight(
                &format!("{}.attn.wq_a", p),
                c.q_lora_rank,
                c.dim,
                Shard::Replicated,
            )?,
            q_norm: store.vector(&format!("{}.attn.q_norm.weight", p), c.q_lora_rank)?,
            wq_b: store.weight(
                &format!("{}.attn.wq_b", p),
                heads * c.qk_head_dim(),
                c.q_lora_rank,
                Shard::Rows,
            )?,
        }
    };

    let attention_weights = AttentionWeights {
        query,
        wkv_a: store.weight(
            &format!("{}.attn.wkv_a", p),
            c.kv_lora_rank + c.qk_rope_head_dim,
            c.dim,
            Shard::Replicated,
        )?,
        kv_norm: store.vector(&format!("{}.attn.kv_norm.weight", p), c.kv_lora_rank)?,
        wkv_b: store.weight(
            &format!("{}.attn.wkv_b", p),
            heads * (c.qk_nope_head_dim + c.v_head_dim),
            c.kv_lora_rank,
            Shard::Rows,
        )?,
        wo: store.weight(
            &format!("{}.attn.wo", p),
            c.dim,
            heads * c.v_head_dim,
            Shard::Cols,
        )?,
    };
    let attn = LatentAttention::new(c, attention_weights, parallel.clone(), mode)?;

    let ffn = if layer < c.n_dense_layers {
        let ffn = load_swiglu(store, &format!("{}.ffn", p), c.dim, c.inter_dim, true)?;
        FeedForward::Dense(Mlp::new(
            &format!("{}.ffn", p),
            c.dim,
            c.inter_dim,
            ffn,
            parallel.clone(),
            mode,
        )?)
    } else {
        let bias = if c.gate_has_bias() {
            Some(store.vector(&format!("{}.ffn.gate.bias", p), c.n_routed_experts)?)
        } else {
            None
        };
        let gate_weight = store.matrix(
            &format!("{}.ffn.gate.weight", p),
            c.n_routed_experts,
            c.dim,
            Shard::Replicated,
        )?;
        let gate = Gate::new(c, gate_weight, bias)?;

        let owned = parallel.shard(c.n_routed_experts);
        let mut experts = Vec::with_capacity(owned.len());
        for e in owned {
            let prefix = format!("{}.ffn.experts.{}", p, e);
            let expert = load_swiglu(store, &prefix, c.dim, c.moe_inter_dim, false)?;
            expert.check_shape(&prefix, c.dim, c.moe_inter_dim)?;
            experts.push((e, expert));
        }

        let shared_inter = c.n_shared_experts * c.moe_inter_dim;
        let shared_prefix = format!("{}.ffn.shared_experts", p);
        let shared = Mlp::new(
            &shared_prefix,
            c.dim,
            shared_inter,
            load_swiglu(store, &shared_prefix, c.dim, shared_inter, true)?,
            parallel.clone(),
            mode,
        )?;

        FeedForward::Moe(MoE::new(
            gate,
            ExpertPool::new(experts),
            shared,
            parallel.clone(),
            mode,
        ))
    };

    Ok(Block {
        attn_norm: store.vector(&format!("{}.attn_norm.weight", p), c.dim)?,
        attn,
        ffn_norm: store.vector(&format!("{}.ffn_norm.weight", p), c.dim)?,
        ffn,
        eps: c.norm_eps,
    })
}

/// Decoder-only transformer for one worker
#[derive(Debug, Clone)]
pub struct Transformer {
    config: ModelConfig,
    parallel: ParallelContext,
    mode: DeviceMode,
    /// This worker's vocabulary rows, `[vocab_size / world_size, dim]`
    embed: Tensor2D,
    vocab_range: Range<usize>,
    layers: Vec<Block>,
    norm: Tensor1D,
    /// `[vocab_size / world_size, dim]`, column-parallel
    head: Weight,
    rotary: RotaryTable,
}

impl Transformer {
    /// Build every layer from the store. Caches are allocated here.
    pub fn load(
        config: &ModelConfig,
        store: &WeightStore,
        parallel: ParallelContext,
        mode: DeviceMode,
    ) -> Result<Self> {
        config.validate(parallel.world_size)?;
        let started = Instant::now();

        let vocab_range = parallel.shard(config.vocab_size);
        let embed = store.matrix("embed.weight", config.vocab_size, config.dim, Shard::Rows)?;

        let mut layers = Vec::with_capacity(config.n_layers);
        for layer in 0..config.n_layers {
            let block = load_block(config, store, layer, &parallel, mode)?;
            debug!(layer, moe = block.is_moe(), "Loaded block");
            layers.push(block);
        }

        let norm = store.vector("norm.weight", config.dim)?;
        let head = store.weight("head", config.vocab_size, config.dim, Shard::Rows)?;

        let model = Self {
            config: config.clone(),
            rotary: RotaryTable::new(config),
            parallel,
            mode,
            embed,
            vocab_range,
            layers,
            norm,
            head,
        };

        info!(
            layers = model.layers.len(),
            rank = model.parallel.rank,
            world_size = model.parallel.world_size,
            device_mode = %mode,
            cache_mb = model.cache_memory_bytes() as f64 / 1e6,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model loaded"
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device_mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn parallel(&self) -> &ParallelContext {
        &self.parallel
    }

    /// Bytes held by every layer's attention cache
    pub fn cache_memory_bytes(&self) -> usize {
        self.layers.iter().map(|b| b.attn.cache_memory_bytes()).sum()
    }

    /// Embedding lookup; ids outside this worker's vocabulary shard contribute zeros
    fn embed(&self, tokens: &[Vec<u32>]) -> Result<Tensor2D> {
        let seq_len = tokens.first().map_or(0, |row| row.len());
        let mut h = Tensor2D::zeros(tokens.len() * seq_len, self.config.dim);
        for (b, row) in tokens.iter().enumerate() {
            for (s, &token) in row.iter().enumerate() {
                let id = token as usize;
                if self.vocab_range.contains(&id) {
                    let local = id - self.vocab_range.start;
                    h.row_mut(b * seq_len + s).copy_from_slice(self.embed.row(local));
                }
            }
        }
        self.parallel.all_reduce(&mut h.data)?;
        Ok(h)
    }

    /// Run `tokens` (one equal-length row per sequence) at `start_pos` and
    /// return `[batch, vocab_size]` logits for each sequence's last position.
    pub fn forward(&mut self, tokens: &[Vec<u32>], start_pos: usize) -> Result<Tensor2D> {
        let batch = tokens.len();
        let seq_len = tokens.first().map_or(0, |row| row.len());
        if batch == 0 || seq_len == 0 || tokens.iter().any(|row| row.len() != seq_len) {
            return Err(GenerationError::InvalidRequest(
                "tokens must be a non-empty rectangular batch".to_string(),
            )
            .into());
        }
        if let Some(&token) = tokens
            .iter()
            .flatten()
            .find(|&&t| t as usize >= self.config.vocab_size)
        {
            return Err(GenerationError::TokenOutOfRange {
                token,
                vocab_size: self.config.vocab_size,
            }
            .into());
        }

        let mut h = self.embed(tokens)?;
        for block in &mut self.layers {
            h = block.forward(&h, batch, start_pos, &self.rotary)?;
        }

        let last_rows: Vec<usize> = (0..batch).map(|b| b * seq_len + seq_len - 1).collect();
        let last = rms_norm(&h.select_rows(&last_rows), &self.norm, self.config.norm_eps)?;
        let local_logits = linear(&last, &self.head, None, self.mode)?;

        self.gather_logits(local_logits)
    }

    /// Reassemble rank-major vocabulary shards into `[batch, vocab_size]`
    fn gather_logits(&self, local: Tensor2D) -> Result<Tensor2D> {
        if !self.parallel.is_distributed() {
            return Ok(local);
        }
        let batch = local.rows;
        let part = local.cols;
        let gathered = self.parallel.all_gather(&local.data)?;
        if gathered.len() != batch * part * self.parallel.world_size {
            return Err(EngineError::Collective(format!(
                "gathered {} logits, expected {}",
                gathered.len(),
                batch * part * self.parallel.world_size
            )));
        }

        let mut logits = Tensor2D::zeros(batch, self.config.vocab_size);
        for b in 0..batch {
            let row = logits.row_mut(b);
            for r in 0..self.parallel.world_size {
                let src = (r * batch + b) * part;
                row[r * part..(r + 1) * part].copy_from_slice(&gathered[src..src + part]);
            }
        }
        Ok(logits)
    }
}
