//! Feed-forward layers: SwiGLU MLPs, the expert router and mixture-of-experts
//!
//! Routed experts are sharded by contiguous id range across workers. A
//! worker's `ExpertPool` stores only the experts it owns in a dense arena and
//! maps global expert ids to arena slots. Tokens routed to experts owned
//! elsewhere are skipped locally and arrive through the all-reduce.

use crate::config::{ModelConfig, ScoreFunc};
use crate::device::DeviceMode;
use crate::errors::{EngineError, Result};
use crate::parallel::ParallelContext;
use crate::quant::{linear, Weight};
use crate::tensor_ops::{matmul_t, sigmoid, silu, softmax_in_place, Tensor1D, Tensor2D};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use tracing::trace;

/// `w2(silu(w1 x) * w3 x)`
#[derive(Debug, Clone)]
pub struct SwiGlu {
    /// `[inter, dim]`
    pub w1: Weight,
    /// `[dim, inter]`
    pub w2: Weight,
    /// `[inter, dim]`
    pub w3: Weight,
}

impl SwiGlu {
    pub fn check_shape(&self, name: &str, dim: usize, inter: usize) -> Result<()> {
        let shapes = [
            ("w1", &self.w1, inter, dim),
            ("w2", &self.w2, dim, inter),
            ("w3", &self.w3, inter, dim),
        ];
        for (part, weight, rows, cols) in shapes {
            if weight.rows() != rows || weight.cols() != cols {
                return Err(EngineError::Shape(format!(
                    "{}.{} is {}x{}, expected {}x{}",
                    name,
                    part,
                    weight.rows(),
                    weight.cols(),
                    rows,
                    cols
                )));
            }
        }
        Ok(())
    }

    pub fn forward(&self, x: &Tensor2D, mode: DeviceMode) -> Result<Tensor2D> {
        let gate = silu(&linear(x, &self.w1, None, mode)?);
        let up = linear(x, &self.w3, None, mode)?;
        linear(&gate.mul(&up)?, &self.w2, None, mode)
    }
}

/// Tensor-parallel MLP: column-parallel `w1`/`w3`, row-parallel `w2` with all-reduce
#[derive(Debug, Clone)]
pub struct Mlp {
    ffn: SwiGlu,
    mode: DeviceMode,
    parallel: ParallelContext,
}

impl Mlp {
    /// `inter_dim` is the full hidden width; this worker holds `inter_dim / world_size`
    pub fn new(
        name: &str,
        dim: usize,
        inter_dim: usize,
        ffn: SwiGlu,
        parallel: ParallelContext,
        mode: DeviceMode,
    ) -> Result<Self> {
        ffn.check_shape(name, dim, inter_dim / parallel.world_size)?;
        Ok(Self {
            ffn,
            mode,
            parallel,
        })
    }

    pub fn forward(&self, x: &Tensor2D) -> Result<Tensor2D> {
        let mut y = self.ffn.forward(x, self.mode)?;
        self.parallel.all_reduce(&mut y.data)?;
        Ok(y)
    }
}

/// Selected experts and their weights, `top_k` per token
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub indices: Vec<usize>,
    pub weights: Vec<f32>,
    pub top_k: usize,
}

impl RoutingDecision {
    pub fn num_tokens(&self) -> usize {
        self.indices.len() / self.top_k.max(1)
    }

    pub fn experts(&self, token: usize) -> &[usize] {
        &self.indices[token * self.top_k..(token + 1) * self.top_k]
    }

    pub fn weights(&self, token: usize) -> &[f32] {
        &self.weights[token * self.top_k..(token + 1) * self.top_k]
    }
}

/// Indices of the `k` largest values; ties go to the lower index
fn top_k_indices(values: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    order.truncate(k);
    order
}

/// Per-token expert router
#[derive(Debug, Clone)]
pub struct Gate {
    /// `[n_routed_experts, dim]`
    weight: Tensor2D,
    bias: Option<Tensor1D>,
    top_k: usize,
    n_groups: usize,
    topk_groups: usize,
    score_func: ScoreFunc,
    route_scale: f32,
}

impl Gate {
    pub fn new(config: &ModelConfig, weight: Tensor2D, bias: Option<Tensor1D>) -> Result<Self> {
        if weight.rows != config.n_routed_experts || weight.cols != config.dim {
            return Err(EngineError::Shape(format!(
                "gate weight is {}x{}, expected {}x{}",
                weight.rows, weight.cols, config.n_routed_experts, config.dim
            )));
        }
        if let Some(b) = &bias {
            if b.len() != config.n_routed_experts {
                return Err(EngineError::Shape(format!(
                    "gate bias has {} elements, expected {}",
                    b.len(),
                    config.n_routed_experts
                )));
            }
        }
        Ok(Self {
            weight,
            bias,
            top_k: config.n_activated_experts,
            n_groups: config.n_expert_groups,
            topk_groups: config.n_limited_groups,
            score_func: config.score_func,
            route_scale: config.route_scale,
        })
    }

    /// Score every token against all routed experts and pick `top_k`.
    ///
    /// The bias shifts selection only; weights are gathered from the unbiased
    /// scores. With groups, only experts inside the best `n_limited_groups`
    /// groups are eligible.
    pub fn route(&self, x: &Tensor2D) -> Result<RoutingDecision> {
        let logits = matmul_t(x, &self.weight)?;
        let n_experts = self.weight.rows;
        let per_group = n_experts / self.n_groups;

        let mut indices = Vec::with_capacity(x.rows * self.top_k);
        let mut weights = Vec::with_capacity(x.rows * self.top_k);

        for token in 0..x.rows {
            let mut original = logits.row(token).to_vec();
            match self.score_func {
                ScoreFunc::Softmax => softmax_in_place(&mut original),
                ScoreFunc::Sigmoid => original.iter_mut().for_each(|s| *s = sigmoid(*s)),
            }

            let mut scores = original.clone();
            if let Some(bias) = &self.bias {
                for (s, b) in scores.iter_mut().zip(&bias.data) {
                    *s += b;
                }
            }

            if self.n_groups > 1 {
                let group_scores: Vec<f32> = scores
                    .chunks(per_group)
                    .map(|group| match self.bias {
                        None => group.iter().cloned().fold(f32::NEG_INFINITY, f32::max),
                        Some(_) => top_k_indices(group, 2).iter().map(|&i| group[i]).sum(),
                    })
                    .collect();
                let kept = top_k_indices(&group_scores, self.topk_groups);
                for (g, group) in scores.chunks_mut(per_group).enumerate() {
                    if !kept.contains(&g) {
                        group.iter_mut().for_each(|s| *s = f32::NEG_INFINITY);
                    }
                }
            }

            let selected = top_k_indices(&scores, self.top_k);
            let mut selected_weights: Vec<f32> = selected.iter().map(|&e| original[e]).collect();
            if self.score_func == ScoreFunc::Sigmoid {
                let sum: f32 = selected_weights.iter().sum();
                if sum > 0.0 {
                    selected_weights.iter_mut().for_each(|w| *w /= sum);
                }
            }
            selected_weights
                .iter_mut()
                .for_each(|w| *w *= self.route_scale);

            indices.extend(selected);
            weights.extend(selected_weights);
        }

        Ok(RoutingDecision {
            indices,
            weights,
            top_k: self.top_k,
        })
    }
}

/// Locally owned experts stored densely, addressed by global id
#[derive(Debug, Clone, Default)]
pub struct ExpertPool {
    experts: Vec<SwiGlu>,
    slots: FxHashMap<usize, usize>,
}

impl ExpertPool {
    pub fn new(owned: Vec<(usize, SwiGlu)>) -> Self {
        let mut pool = Self::default();
        for (global_id, expert) in owned {
            pool.slots.insert(global_id, pool.experts.len());
            pool.experts.push(expert);
        }
        pool
    }

    /// Arena slot of a global expert id, if owned here
    pub fn slot(&self, global_id: usize) -> Option<usize> {
        self.slots.get(&global_id).copied()
    }

    pub fn get(&self, global_id: usize) -> Option<&SwiGlu> {
        self.slot(global_id).map(|slot| &self.experts[slot])
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }
}

/// Sparse routed experts plus always-on shared experts
#[derive(Debug, Clone)]
pub struct MoE {
    gate: Gate,
    pool: ExpertPool,
    shared: Mlp,
    mode: DeviceMode,
    parallel: ParallelContext,
}

impl MoE {
    pub fn new(
        gate: Gate,
        pool: ExpertPool,
        shared: Mlp,
        parallel: ParallelContext,
        mode: DeviceMode,
    ) -> Self {
        Self {
            gate,
            pool,
            shared,
            mode,
            parallel,
        }
    }

    pub fn pool(&self) -> &ExpertPool {
        &self.pool
    }

    pub fn forward(&self, x: &Tensor2D) -> Result<Tensor2D> {
        let decision = self.gate.route(x)?;

        // (token, weight) pairs for each local arena slot
        let mut assigned: Vec<Vec<(usize, f32)>> = vec![Vec::new(); self.pool.len()];
        for token in 0..decision.num_tokens() {
            for (&expert, &weight) in decision.experts(token).iter().zip(decision.weights(token)) {
                if let Some(slot) = self.pool.slot(expert) {
                    assigned[slot].push((token, weight));
                }
            }
        }

        let mut y = Tensor2D::zeros(x.rows, x.cols);
        for (slot, tokens) in assigned.iter().enumerate() {
            if tokens.is_empty() {
                continue;
            }
            let rows: Vec<usize> = tokens.iter().map(|&(t, _)| t).collect();
            let out = self.pool.experts[slot].forward(&x.select_rows(&rows), self.mode)?;
            for (i, &(token, weight)) in tokens.iter().enumerate() {
                for (acc, &v) in y.row_mut(token).iter_mut().zip(out.row(i)) {
                    *acc += weight * v;
                }
            }
        }
        trace!(
            tokens = x.rows,
            local_experts = self.pool.len(),
            "Routed experts evaluated"
        );

        let z = self.shared.forward(x)?;
        self.parallel.all_reduce(&mut y.data)?;
        y.add_assign(&z)?;
        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::xavier_tensor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gate_config(n_groups: usize, limited: usize, score_func: ScoreFunc) -> ModelConfig {
        ModelConfig {
            dim: 8,
            n_routed_experts: 8,
            n_activated_experts: 2,
            n_expert_groups: n_groups,
            n_limited_groups: limited,
            score_func,
            route_scale: 1.0,
            ..ModelConfig::default()
        }
    }

    fn random_gate(config: &ModelConfig, bias: Option<Tensor1D>) -> Gate {
        let mut rng = StdRng::seed_from_u64(9);
        Gate::new(config, xavier_tensor(8, 8, &mut rng), bias).unwrap()
    }

    fn tokens(rows: usize, seed: u64) -> Tensor2D {
        let mut rng = StdRng::seed_from_u64(seed);
        xavier_tensor(rows, 8, &mut rng)
    }

    fn random_ffn(dim: usize, inter: usize, rng: &mut StdRng) -> SwiGlu {
        SwiGlu {
            w1: Weight::Dense(xavier_tensor(inter, dim, rng)),
            w2: Weight::Dense(xavier_tensor(dim, inter, rng)),
            w3: Weight::Dense(xavier_tensor(inter, dim, rng)),
        }
    }

    #[test]
    fn test_top_k_stable_ties() {
        assert_eq!(top_k_indices(&[1.0, 3.0, 3.0, 2.0], 2), vec![1, 2]);
        assert_eq!(top_k_indices(&[f32::NEG_INFINITY, 0.5], 1), vec![1]);
    }

    #[test]
    fn test_gate_selects_exactly_top_k() {
        let config = gate_config(1, 1, ScoreFunc::Softmax);
        let decision = random_gate(&config, None).route(&tokens(5, 1)).unwrap();

        assert_eq!(decision.num_tokens(), 5);
        for t in 0..5 {
            let experts = decision.experts(t);
            assert_eq!(experts.len(), 2);
            assert_ne!(experts[0], experts[1]);
            assert!(decision.weights(t)[0] >= decision.weights(t)[1]);
        }
    }

    #[test]
    fn test_group_limited_selection() {
        let config = gate_config(4, 1, ScoreFunc::Softmax);
        let decision = random_gate(&config, None).route(&tokens(6, 2)).unwrap();

        // One group of 2 experts survives, so both picks share a group
        for t in 0..6 {
            let experts = decision.experts(t);
            assert_eq!(experts[0] / 2, experts[1] / 2);
        }
    }

    #[test]
    fn test_sigmoid_weights_sum_to_route_scale() {
        let config = ModelConfig {
            route_scale: 2.5,
            ..gate_config(1, 1, ScoreFunc::Sigmoid)
        };
        let decision = random_gate(&config, None).route(&tokens(4, 3)).unwrap();

        for t in 0..4 {
            let sum: f32 = decision.weights(t).iter().sum();
            assert!((sum - 2.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_bias_steers_selection_not_weights() {
        let config = gate_config(1, 1, ScoreFunc::Softmax);
        let mut bias = vec![0.0; 8];
        bias[6] = 100.0;
        bias[7] = 50.0;

        let x = tokens(1, 4);
        let unbiased = random_gate(&config, None).route(&x).unwrap();
        let biased = random_gate(&config, Some(Tensor1D::new(bias))).route(&x).unwrap();

        assert_eq!(biased.experts(0), &[6, 7]);

        // Weights are the original softmax probabilities of the chosen experts
        let gate = random_gate(&config, None);
        let mut probs = matmul_t(&x, &gate.weight).unwrap().row(0).to_vec();
        softmax_in_place(&mut probs);
        assert!((biased.weights(0)[0] - probs[6]).abs() < 1e-6);
        assert!((biased.weights(0)[1] - probs[7]).abs() < 1e-6);
        assert_ne!(unbiased.experts(0), biased.experts(0));
    }

    #[test]
    fn test_biased_groups_ranked_by_top_two_sum() {
        let config = ModelConfig {
            n_expert_groups: 2,
            n_limited_groups: 1,
            ..gate_config(1, 1, ScoreFunc::Sigmoid)
        };
        // Token [1, 0, ..] reads column 0 of the gate weight as its logits.
        // Group 0 holds the single best expert, group 1 the best pair.
        let logits = [3.0, -2.0, -2.0, -2.0, 1.4, 1.4, -2.0, -2.0];
        let mut weight = Tensor2D::zeros(8, 8);
        for (e, &l) in logits.iter().enumerate() {
            weight.row_mut(e)[0] = l;
        }
        let mut x = Tensor2D::zeros(1, 8);
        x.row_mut(0)[0] = 1.0;

        let unbiased = Gate::new(&config, weight.clone(), None).unwrap();
        assert_eq!(unbiased.route(&x).unwrap().experts(0), &[0, 1]);

        let biased = Gate::new(&config, weight, Some(Tensor1D::new(vec![0.0; 8]))).unwrap();
        let decision = biased.route(&x).unwrap();
        assert_eq!(decision.experts(0), &[4, 5]);
        assert!((decision.weights(0)[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_expert_pool_maps_global_ids() {
        let mut rng = StdRng::seed_from_u64(5);
        let pool = ExpertPool::new(vec![
            (4, random_ffn(8, 4, &mut rng)),
            (5, random_ffn(8, 4, &mut rng)),
        ]);

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.slot(4), Some(0));
        assert_eq!(pool.slot(5), Some(1));
        assert!(pool.get(0).is_none());
    }

    #[test]
    fn test_moe_matches_manual_combination() {
        let config = gate_config(1, 1, ScoreFunc::Softmax);
        let mut rng = StdRng::seed_from_u64(6);
        let experts: Vec<(usize, SwiGlu)> =
            (0..8).map(|e| (e, random_ffn(8, 4, &mut rng))).collect();
        let shared_ffn = random_ffn(8, 8, &mut rng);

        let parallel = ParallelContext::single();
        let shared = Mlp::new(
            "shared",
            8,
            8,
            shared_ffn.clone(),
            parallel.clone(),
            DeviceMode::Fallback,
        )
        .unwrap();
        let gate = random_gate(&config, None);
        let moe = MoE::new(
            gate.clone(),
            ExpertPool::new(experts.clone()),
            shared,
            parallel,
            DeviceMode::Fallback,
        );

        let x = tokens(3, 7);
        let y = moe.forward(&x).unwrap();

        let decision = gate.route(&x).unwrap();
        let z = shared_ffn.forward(&x, DeviceMode::Fallback).unwrap();
        for t in 0..3 {
            let row = x.select_rows(&[t]);
            let mut expected = z.row(t).to_vec();
            for (&e, &w) in decision.experts(t).iter().zip(decision.weights(t)) {
                let out = experts[e].1.forward(&row, DeviceMode::Fallback).unwrap();
                for (acc, v) in expected.iter_mut().zip(out.row(0)) {
                    *acc += w * v;
                }
            }
            for (a, b) in y.row(t).iter().zip(&expected) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_moe_skips_experts_owned_elsewhere() {
        let config = gate_config(1, 1, ScoreFunc::Softmax);
        let zero_shared = SwiGlu {
            w1: Weight::Dense(Tensor2D::zeros(8, 8)),
            w2: Weight::Dense(Tensor2D::zeros(8, 8)),
            w3: Weight::Dense(Tensor2D::zeros(8, 8)),
        };
        let parallel = ParallelContext::single();
        let shared = Mlp::new("shared", 8, 8, zero_shared, parallel.clone(), DeviceMode::Fallback)
            .unwrap();

        // No experts owned locally: routed contribution is zero
        let moe = MoE::new(
            random_gate(&config, None),
            ExpertPool::new(Vec::new()),
            shared,
            parallel,
            DeviceMode::Fallback,
        );
        let y = moe.forward(&tokens(2, 1)).unwrap();
        assert!(y.data.iter().all(|&v| v == 0.0));
    }
}
