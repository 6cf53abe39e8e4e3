//! Sharded execution across an in-process ring matches a single worker

use latent_engine::tensor_ops::relative_error;
use latent_engine::{
    write_random_checkpoint, DeviceMode, InferenceStats, LocalRing, ModelConfig, ParallelContext,
    Transformer, WeightStore,
};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn config() -> ModelConfig {
    ModelConfig {
        vocab_size: 64,
        dim: 32,
        inter_dim: 64,
        moe_inter_dim: 16,
        n_layers: 3,
        n_dense_layers: 1,
        n_heads: 4,
        n_routed_experts: 4,
        n_shared_experts: 2,
        n_activated_experts: 2,
        kv_lora_rank: 16,
        qk_nope_head_dim: 8,
        qk_rope_head_dim: 4,
        v_head_dim: 8,
        max_seq_len: 32,
        max_batch_size: 2,
        block_size: 16,
        ..ModelConfig::default()
    }
}

/// Prefill then one decode step; returns both logits
fn run(model: &mut Transformer) -> (Vec<f32>, Vec<f32>) {
    let prefill = model.forward(&[vec![3, 14, 15, 9], vec![2, 6, 53, 5]], 0).unwrap();
    let decode = model.forward(&[vec![58], vec![9]], 4).unwrap();
    (prefill.data, decode.data)
}

fn run_sharded(config: &ModelConfig, dir: &Path, world_size: usize) -> Vec<(Vec<f32>, Vec<f32>)> {
    let members = LocalRing::build(world_size, Duration::from_secs(10)).unwrap();
    let contexts = ParallelContext::from_ring(members, Arc::new(InferenceStats::new()));

    thread::scope(|s| {
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|parallel| {
                s.spawn(move || {
                    let store = WeightStore::open(dir, &parallel, config.block_size).unwrap();
                    let mut model =
                        Transformer::load(config, &store, parallel, DeviceMode::Fallback).unwrap();
                    run(&mut model)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_two_workers_match_single_worker() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    write_random_checkpoint(dir.path(), &config, 31).unwrap();

    let parallel = ParallelContext::single();
    let store = WeightStore::open(dir.path(), &parallel, config.block_size).unwrap();
    let mut single = Transformer::load(&config, &store, parallel, DeviceMode::Fallback).unwrap();
    let (expected_prefill, expected_decode) = run(&mut single);

    let results = run_sharded(&config, dir.path(), 2);
    assert_eq!(results.len(), 2);
    for (rank, (prefill, decode)) in results.iter().enumerate() {
        assert_eq!(prefill.len(), 2 * config.vocab_size);
        let err = relative_error(prefill, &expected_prefill);
        assert!(err < 1e-4, "rank {} prefill relative error {}", rank, err);
        let err = relative_error(decode, &expected_decode);
        assert!(err < 1e-4, "rank {} decode relative error {}", rank, err);
    }
}

#[test]
fn test_four_workers_agree_with_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    write_random_checkpoint(dir.path(), &config, 32).unwrap();

    let results = run_sharded(&config, dir.path(), 4);
    for (prefill, decode) in &results[1..] {
        assert!(relative_error(prefill, &results[0].0) < 1e-6);
        assert!(relative_error(decode, &results[0].1) < 1e-6);
    }
}
