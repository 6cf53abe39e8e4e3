//! Fused and fallback quantized paths on the same checkpoint

use latent_engine::device;
use latent_engine::quant::Weight;
use latent_engine::tensor_ops::relative_error;
use latent_engine::weights::Shard;
use latent_engine::{
    write_random_checkpoint, DeviceMode, DeviceRequest, ModelConfig, ParallelContext, Precision,
    Transformer, WeightStore,
};
use std::path::Path;

fn quantized_config() -> ModelConfig {
    ModelConfig {
        dtype: Precision::Int8,
        vocab_size: 64,
        dim: 32,
        inter_dim: 64,
        moe_inter_dim: 16,
        n_layers: 2,
        n_dense_layers: 1,
        n_heads: 4,
        n_routed_experts: 4,
        n_shared_experts: 1,
        n_activated_experts: 2,
        kv_lora_rank: 16,
        qk_nope_head_dim: 8,
        qk_rope_head_dim: 4,
        v_head_dim: 8,
        max_seq_len: 32,
        max_batch_size: 1,
        block_size: 16,
        ..ModelConfig::default()
    }
}

fn load(config: &ModelConfig, dir: &Path, mode: DeviceMode) -> Transformer {
    let parallel = ParallelContext::single();
    let store = WeightStore::open(dir, &parallel, config.block_size).unwrap();
    Transformer::load(config, &store, parallel, mode).unwrap()
}

#[test]
fn test_auto_selects_fused_for_aligned_quantized_model() {
    let selection = device::select(&quantized_config(), 1);
    assert_eq!(selection.mode, DeviceMode::Fused);
    assert!(selection.downgrade_reason.is_none());
}

#[test]
fn test_fused_matches_fallback_within_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let config = quantized_config();
    write_random_checkpoint(dir.path(), &config, 41).unwrap();

    let mut fused = load(&config, dir.path(), DeviceMode::Fused);
    let mut fallback = load(&config, dir.path(), DeviceMode::Fallback);
    assert_eq!(fused.device_mode(), DeviceMode::Fused);

    let prompt = vec![vec![7, 1, 33, 20, 8]];
    let a = fused.forward(&prompt, 0).unwrap();
    let b = fallback.forward(&prompt, 0).unwrap();
    let err = relative_error(&a.data, &b.data);
    assert!(err < 3e-2, "prefill relative error {}", err);

    let a = fused.forward(&[vec![12]], 5).unwrap();
    let b = fallback.forward(&[vec![12]], 5).unwrap();
    let err = relative_error(&a.data, &b.data);
    assert!(err < 3e-2, "decode relative error {}", err);
}

#[test]
fn test_fallback_request_is_not_a_downgrade() {
    let config = ModelConfig {
        device: DeviceRequest::Fallback,
        ..quantized_config()
    };
    let selection = device::select(&config, 1);
    assert_eq!(selection.mode, DeviceMode::Fallback);
    assert!(selection.downgrade_reason.is_none());
}

#[test]
fn test_quantized_linear_layers_load_as_quantized() {
    let dir = tempfile::tempdir().unwrap();
    let config = quantized_config();
    write_random_checkpoint(dir.path(), &config, 42).unwrap();

    let parallel = ParallelContext::single();
    let store = WeightStore::open(dir.path(), &parallel, config.block_size).unwrap();
    let wo = store
        .weight(
            "layers.0.attn.wo",
            config.dim,
            config.n_heads * config.v_head_dim,
            Shard::Cols,
        )
        .unwrap();
    assert!(matches!(wo, Weight::Quantized(_)));
}
