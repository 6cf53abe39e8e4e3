//! Model configuration
//!
//! `ModelConfig` is the immutable description of a checkpoint: vocabulary,
//! layer geometry, MoE routing, latent attention ranks, rotary scaling and
//! execution limits. It is parsed from a JSON object whose keys are the
//! snake_case field names below, and validated once before any weights load.

use crate::errors::{ConfigError, EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Fields that have no default and must appear in every configuration file.
pub const REQUIRED_FIELDS: [&str; 5] = ["vocab_size", "dim", "inter_dim", "n_layers", "n_heads"];

/// Model width that ships with a learned routing bias.
const GATE_BIAS_DIM: usize = 7168;

/// Numeric precision of the stored linear weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Full-precision dense weights
    Bf16,
    /// Block-quantized 8-bit weights with per-tile scales
    #[serde(alias = "fp8")]
    Int8,
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Bf16 => write!(f, "bf16"),
            Precision::Int8 => write!(f, "int8"),
        }
    }
}

/// Expert scoring function used by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreFunc {
    Softmax,
    Sigmoid,
}

/// Attention execution strategy, bound once at model construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttnImpl {
    /// Reconstruct per-head keys and values and cache them
    Naive,
    /// Fold the key/value up-projection into the query and cache the latent
    Absorb,
}

/// Requested compute device mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRequest {
    /// Use the fused kernel when the checkpoint supports it
    Auto,
    /// Ask for the fused kernel; still downgrades if it is unsupported
    Fused,
    /// Always use the dequantize-then-multiply path
    Fallback,
}

/// Immutable model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub max_batch_size: usize,
    pub max_seq_len: usize,
    pub dtype: Precision,
    pub vocab_size: usize,
    pub dim: usize,
    pub inter_dim: usize,
    pub moe_inter_dim: usize,
    pub n_layers: usize,
    pub n_dense_layers: usize,
    pub n_heads: usize,

    // MoE
    pub n_routed_experts: usize,
    pub n_shared_experts: usize,
    pub n_activated_experts: usize,
    pub n_expert_groups: usize,
    pub n_limited_groups: usize,
    pub score_func: ScoreFunc,
    pub route_scale: f32,

    // Latent attention
    pub q_lora_rank: usize,
    pub kv_lora_rank: usize,
    pub qk_nope_head_dim: usize,
    pub qk_rope_head_dim: usize,
    pub v_head_dim: usize,

    // Rotary / YaRN
    pub original_seq_len: usize,
    pub rope_theta: f32,
    pub rope_factor: f32,
    pub beta_fast: f32,
    pub beta_slow: f32,
    pub mscale: f32,

    // Execution
    pub attn_impl: AttnImpl,
    pub block_size: usize,
    pub device: DeviceRequest,
    pub norm_eps: f32,
    /// Overrides whether the router carries a learned bias
    pub gate_bias: Option<bool>,
    /// Default sampling seed
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 4,
            max_seq_len: 2048,
            dtype: Precision::Bf16,
            vocab_size: 102400,
            dim: 2048,
            inter_dim: 10944,
            moe_inter_dim: 1408,
            n_layers: 27,
            n_dense_layers: 1,
            n_heads: 16,
            n_routed_experts: 64,
            n_shared_experts: 2,
            n_activated_experts: 6,
            n_expert_groups: 1,
            n_limited_groups: 1,
            score_func: ScoreFunc::Softmax,
            route_scale: 1.0,
            q_lora_rank: 0,
            kv_lora_rank: 512,
            qk_nope_head_dim: 128,
            qk_rope_head_dim: 64,
            v_head_dim: 128,
            original_seq_len: 4096,
            rope_theta: 10000.0,
            rope_factor: 40.0,
            beta_fast: 32.0,
            beta_slow: 1.0,
            mscale: 1.0,
            attn_impl: AttnImpl::Absorb,
            block_size: 128,
            device: DeviceRequest::Auto,
            norm_eps: 1e-6,
            gate_bias: None,
            seed: 965,
        }
    }
}

impl ModelConfig {
    /// Parse a configuration from JSON text without validating it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let object = value
            .as_object()
            .ok_or_else(|| ConfigError::Parse("configuration must be a JSON object".to_string()))?;

        for field in REQUIRED_FIELDS {
            if !object.contains_key(field) {
                return Err(ConfigError::MissingField(field.to_string()).into());
            }
        }

        serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()).into())
    }

    /// Read, parse and validate a configuration file for a single worker
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_json_str(&text)?;
        config.validate(1)?;

        info!(
            path = %path.display(),
            vocab_size = config.vocab_size,
            dim = config.dim,
            layers = config.n_layers,
            heads = config.n_heads,
            experts = config.n_routed_experts,
            dtype = %config.dtype,
            attn_impl = ?config.attn_impl,
            "Loaded model configuration"
        );

        Ok(config)
    }

    /// Check every cross-field relationship for a given worker count
    pub fn validate(&self, world_size: usize) -> Result<()> {
        let nonzero = [
            ("world_size", world_size),
            ("max_batch_size", self.max_batch_size),
            ("max_seq_len", self.max_seq_len),
            ("vocab_size", self.vocab_size),
            ("dim", self.dim),
            ("inter_dim", self.inter_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("kv_lora_rank", self.kv_lora_rank),
            ("qk_nope_head_dim", self.qk_nope_head_dim),
            ("qk_rope_head_dim", self.qk_rope_head_dim),
            ("v_head_dim", self.v_head_dim),
            ("original_seq_len", self.original_seq_len),
            ("block_size", self.block_size),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        if self.qk_rope_head_dim % 2 != 0 {
            return Err(invalid("qk_rope_head_dim", "rotary dimension must be even"));
        }
        if self.n_dense_layers > self.n_layers {
            return Err(invalid(
                "n_dense_layers",
                format!("{} exceeds n_layers {}", self.n_dense_layers, self.n_layers),
            ));
        }

        if self.has_moe_layers() {
            self.validate_moe()?;
        }

        if !(self.rope_theta.is_finite() && self.rope_theta > 0.0) {
            return Err(invalid("rope_theta", "must be a positive number"));
        }
        if !(self.rope_factor.is_finite() && self.rope_factor > 0.0) {
            return Err(invalid("rope_factor", "must be a positive number"));
        }
        if !(self.norm_eps.is_finite() && self.norm_eps >= 0.0) {
            return Err(invalid("norm_eps", "must be a non-negative number"));
        }

        let mut divisible = vec![
            ("vocab_size", self.vocab_size),
            ("n_heads", self.n_heads),
            ("inter_dim", self.inter_dim),
        ];
        if self.has_moe_layers() {
            divisible.push(("n_routed_experts", self.n_routed_experts));
            divisible.push((
                "n_shared_experts * moe_inter_dim",
                self.n_shared_experts * self.moe_inter_dim,
            ));
        }
        for (field, value) in divisible {
            if value % world_size != 0 {
                return Err(ConfigError::NotDivisible {
                    field,
                    value,
                    divisor: world_size,
                }
                .into());
            }
        }

        debug!(world_size, "Configuration validated");
        Ok(())
    }

    fn validate_moe(&self) -> Result<()> {
        if self.n_routed_experts == 0 {
            return Err(invalid("n_routed_experts", "must be greater than zero"));
        }
        if self.moe_inter_dim == 0 {
            return Err(invalid("moe_inter_dim", "must be greater than zero"));
        }
        if self.n_shared_experts == 0 {
            return Err(invalid("n_shared_experts", "must be greater than zero"));
        }
        if self.n_expert_groups == 0 {
            return Err(invalid("n_expert_groups", "must be greater than zero"));
        }
        if self.n_routed_experts % self.n_expert_groups != 0 {
            return Err(ConfigError::NotDivisible {
                field: "n_routed_experts",
                value: self.n_routed_experts,
                divisor: self.n_expert_groups,
            }
            .into());
        }
        if self.n_limited_groups == 0 || self.n_limited_groups > self.n_expert_groups {
            return Err(invalid(
                "n_limited_groups",
                format!("must be within 1..={}", self.n_expert_groups),
            ));
        }

        let per_group = self.n_routed_experts / self.n_expert_groups;
        let reachable = per_group * self.n_limited_groups;
        if self.n_activated_experts == 0 || self.n_activated_experts > reachable {
            return Err(invalid(
                "n_activated_experts",
                format!("must be within 1..={} reachable experts", reachable),
            ));
        }
        if self.n_expert_groups > 1 && self.gate_has_bias() && per_group < 2 {
            return Err(invalid(
                "n_expert_groups",
                "biased group scoring needs at least 2 experts per group",
            ));
        }
        if !self.route_scale.is_finite() {
            return Err(invalid("route_scale", "must be finite"));
        }
        Ok(())
    }

    pub fn has_moe_layers(&self) -> bool {
        self.n_layers > self.n_dense_layers
    }

    /// Per-head query/key width (positional-free part plus rotary part)
    pub fn qk_head_dim(&self) -> usize {
        self.qk_nope_head_dim + self.qk_rope_head_dim
    }

    pub fn is_quantized(&self) -> bool {
        self.dtype == Precision::Int8
    }

    /// Whether the router has a learned additive bias
    pub fn gate_has_bias(&self) -> bool {
        self.gate_bias.unwrap_or(self.dim == GATE_BIAS_DIM)
    }

    /// Whether the rotary table is stretched beyond the trained length
    pub fn is_long_context(&self) -> bool {
        self.max_seq_len > self.original_seq_len
    }

    /// Attention softmax scale including the long-context correction
    pub fn softmax_scale(&self) -> f32 {
        let mut scale = (self.qk_head_dim() as f32).powf(-0.5);
        if self.is_long_context() {
            let mscale = 0.1 * self.mscale * self.rope_factor.ln() + 1.0;
            scale *= mscale * mscale;
        }
        scale
    }

    /// Total parameter count of the full (unsharded) model
    pub fn parameter_count(&self) -> u64 {
        let dim = self.dim as u64;
        let heads = self.n_heads as u64;
        let qk_head = self.qk_head_dim() as u64;
        let kv_lora = self.kv_lora_rank as u64;

        let query = if self.q_lora_rank == 0 {
            dim * heads * qk_head
        } else {
            let q_lora = self.q_lora_rank as u64;
            dim * q_lora + q_lora + q_lora * heads * qk_head
        };
        let attention = query
            + dim * (kv_lora + self.qk_rope_head_dim as u64)
            + kv_lora
            + kv_lora * heads * (self.qk_nope_head_dim + self.v_head_dim) as u64
            + heads * self.v_head_dim as u64 * dim;

        let dense_ffn = 3 * dim * self.inter_dim as u64;
        let moe_inter = self.moe_inter_dim as u64;
        let experts = self.n_routed_experts as u64;
        let bias = if self.gate_has_bias() { experts } else { 0 };
        let moe_ffn = experts * dim
            + bias
            + experts * 3 * dim * moe_inter
            + 3 * dim * self.n_shared_experts as u64 * moe_inter;

        let dense_layers = self.n_dense_layers as u64;
        let moe_layers = (self.n_layers - self.n_dense_layers) as u64;
        let norms = 2 * dim;

        2 * self.vocab_size as u64 * dim
            + dim
            + dense_layers * (attention + dense_ffn + norms)
            + moe_layers * (attention + moe_ffn + norms)
    }

    /// Bytes held by one worker's attention caches across all layers
    pub fn cache_bytes(&self, world_size: usize) -> u64 {
        let slots = (self.max_batch_size * self.max_seq_len) as u64;
        let per_position = match self.attn_impl {
            AttnImpl::Naive => {
                let local_heads = self.n_heads / world_size.max(1);
                local_heads * (self.qk_head_dim() + self.v_head_dim)
            }
            AttnImpl::Absorb => self.kv_lora_rank + self.qk_rope_head_dim,
        } as u64;
        self.n_layers as u64 * slots * per_position * std::mem::size_of::<f32>() as u64
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> EngineError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
    .into()
}
