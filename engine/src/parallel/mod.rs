//! Tensor/expert parallel context
//!
//! A `ParallelContext` is built once per worker and handed to every component
//! constructor that shards weights or synchronizes activations. There is no
//! process-wide rank or world size.
//!
//! Each worker owns a contiguous shard of the vocabulary, the attention heads,
//! the routed experts and the dense MLP hidden dimension. The only cross-worker
//! synchronization points are blocking collectives:
//! - embedding all-reduce (out-of-shard ids contribute zeros)
//! - attention output all-reduce (row-parallel `wo`)
//! - MoE routed-expert all-reduce and row-parallel MLP `w2`
//! - final logits all-gather (column-parallel head)

pub mod ring;

pub use ring::{LocalRing, RingMember};

use crate::errors::Result;
use crate::stats::InferenceStats;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Blocking collective operations over all workers of one model
pub trait Collective: Send + Sync {
    /// Element-wise sum across workers, written back into `data` on every worker
    fn all_reduce(&self, data: &mut [f32]) -> Result<()>;

    /// Concatenate every worker's `data` in rank order
    fn all_gather(&self, data: &[f32]) -> Result<Vec<f32>>;

    /// Wait until every worker reaches this point
    fn barrier(&self) -> Result<()>;
}

/// The single-worker collective: every operation is the identity
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleWorker;

impl Collective for SingleWorker {
    fn all_reduce(&self, _data: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, data: &[f32]) -> Result<Vec<f32>> {
        Ok(data.to_vec())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Contiguous range of `total` items owned by `rank` of `world_size`.
///
/// `total` must be divisible by `world_size`; configuration validation
/// enforces this for every sharded dimension.
pub fn shard_range(total: usize, world_size: usize, rank: usize) -> Range<usize> {
    let part = total / world_size;
    rank * part..(rank + 1) * part
}

/// This worker's position and its collective
#[derive(Clone)]
pub struct ParallelContext {
    pub world_size: usize,
    pub rank: usize,
    collective: Arc<dyn Collective>,
    stats: Arc<InferenceStats>,
}

impl std::fmt::Debug for ParallelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelContext")
            .field("world_size", &self.world_size)
            .field("rank", &self.rank)
            .finish()
    }
}

impl ParallelContext {
    /// Context for a model running on one worker
    pub fn single() -> Self {
        Self::new(1, 0, Arc::new(SingleWorker), Arc::new(InferenceStats::new()))
    }

    pub fn new(
        world_size: usize,
        rank: usize,
        collective: Arc<dyn Collective>,
        stats: Arc<InferenceStats>,
    ) -> Self {
        Self {
            world_size,
            rank,
            collective,
            stats,
        }
    }

    /// One context per ring member, all sharing `stats`
    pub fn from_ring(members: Vec<RingMember>, stats: Arc<InferenceStats>) -> Vec<Self> {
        let world_size = members.len();
        members
            .into_iter()
            .enumerate()
            .map(|(rank, member)| Self::new(world_size, rank, Arc::new(member), stats.clone()))
            .collect()
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn stats(&self) -> &Arc<InferenceStats> {
        &self.stats
    }

    /// This worker's range of `total` sharded items
    pub fn shard(&self, total: usize) -> Range<usize> {
        shard_range(total, self.world_size, self.rank)
    }

    pub fn all_reduce(&self, data: &mut [f32]) -> Result<()> {
        if !self.is_distributed() {
            return Ok(());
        }
        let started = Instant::now();
        let result = self.collective.all_reduce(data);
        self.finish("all_reduce", started, &result);
        result
    }

    pub fn all_gather(&self, data: &[f32]) -> Result<Vec<f32>> {
        if !self.is_distributed() {
            return Ok(data.to_vec());
        }
        let started = Instant::now();
        let result = self.collective.all_gather(data);
        self.finish("all_gather", started, &result);
        result
    }

    pub fn barrier(&self) -> Result<()> {
        if !self.is_distributed() {
            return Ok(());
        }
        let started = Instant::now();
        let result = self.collective.barrier();
        self.finish("barrier", started, &result);
        result
    }

    fn finish<T>(&self, op: &'static str, started: Instant, result: &Result<T>) {
        self.stats.record_collective(started.elapsed());
        if let Err(e) = result {
            error!(
                rank = self.rank,
                world_size = self.world_size,
                op,
                error = %e,
                "Collective failed"
            );
        }
    }
}
