//! Compute device selection
//!
//! The engine has two ways to multiply by a quantized weight. The fused
//! kernel quantizes the activation and multiplies 8-bit values directly; the
//! fallback dequantizes the weight and multiplies in full precision. The mode
//! is resolved once per model from the configuration and never re-probed on
//! the hot path.

use crate::config::{DeviceRequest, ModelConfig};
use crate::errors::DeviceError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Active compute mode for quantized linear layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Block-quantized integer matmul
    Fused,
    /// Dequantize the weight, multiply in f32
    Fallback,
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceMode::Fused => write!(f, "fused"),
            DeviceMode::Fallback => write!(f, "fallback"),
        }
    }
}

/// Outcome of device selection
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSelection {
    pub mode: DeviceMode,
    /// Why the fused kernel was not used, when it was wanted
    pub downgrade_reason: Option<DeviceError>,
}

/// Resolve the compute mode for a configuration on `world_size` workers.
///
/// `fallback` always selects the dequantized path. `auto` and `fused` select
/// the fused kernel when the weights are quantized and every quantized matmul
/// has an inner dimension that is a whole number of blocks. Anything else is
/// a downgrade: logged and recorded, never an error.
pub fn select(config: &ModelConfig, world_size: usize) -> DeviceSelection {
    if config.device == DeviceRequest::Fallback {
        info!("Fallback compute path requested");
        return DeviceSelection {
            mode: DeviceMode::Fallback,
            downgrade_reason: None,
        };
    }

    match check_fused_support(config, world_size) {
        Ok(()) => {
            info!(block_size = config.block_size, "Using fused quantized kernel");
            DeviceSelection {
                mode: DeviceMode::Fused,
                downgrade_reason: None,
            }
        }
        Err(reason) => {
            // Dense checkpoints under `auto` have nothing to fuse
            if config.device == DeviceRequest::Auto && !config.is_quantized() {
                info!(dtype = %config.dtype, "Dense checkpoint, using standard matmul");
                return DeviceSelection {
                    mode: DeviceMode::Fallback,
                    downgrade_reason: None,
                };
            }
            warn!(reason = %reason, "Fused kernel unavailable, falling back to dequantized matmul");
            DeviceSelection {
                mode: DeviceMode::Fallback,
                downgrade_reason: Some(reason),
            }
        }
    }
}

/// Inner (reduction) dimensions of every quantized matmul on one worker
pub fn quantized_inner_dims(config: &ModelConfig, world_size: usize) -> Vec<(&'static str, usize)> {
    let world = world_size.max(1);
    let mut dims = vec![
        ("dim", config.dim),
        ("kv_lora_rank", config.kv_lora_rank),
        ("n_heads * v_head_dim / world_size", config.n_heads * config.v_head_dim / world),
    ];
    if config.q_lora_rank > 0 {
        dims.push(("q_lora_rank", config.q_lora_rank));
    }
    if config.n_dense_layers > 0 {
        dims.push(("inter_dim / world_size", config.inter_dim / world));
    }
    if config.has_moe_layers() {
        dims.push(("moe_inter_dim", config.moe_inter_dim));
        dims.push((
            "n_shared_experts * moe_inter_dim / world_size",
            config.n_shared_experts * config.moe_inter_dim / world,
        ));
    }
    dims
}

fn check_fused_support(config: &ModelConfig, world_size: usize) -> Result<(), DeviceError> {
    if !config.is_quantized() {
        return Err(DeviceError::DensePrecision(config.dtype.to_string()));
    }
    for (field, value) in quantized_inner_dims(config, world_size) {
        if value % config.block_size != 0 {
            return Err(DeviceError::UnalignedDimension {
                field,
                value,
                block_size: config.block_size,
            });
        }
    }
    Ok(())
}
