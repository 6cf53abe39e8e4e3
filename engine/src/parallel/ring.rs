//! In-process ring collectives
//!
//! Workers are arranged in a ring; each one sends to its right neighbour and
//! receives from its left neighbour over a channel. All-reduce is the
//! bandwidth-optimal ring algorithm:
//! 1. **Reduce-Scatter**: `n-1` steps after which worker `i` holds the full
//!    sum of chunk `(i+1) % n`
//! 2. **All-Gather**: `n-1` steps circulating the reduced chunks
//!
//! Every receive is bounded by the ring timeout. A timeout, a disconnected
//! neighbour or an out-of-order message fails the collective.

use super::Collective;
use crate::errors::{EngineError, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace};

/// Phase of a ring collective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingPhase {
    ReduceScatter,
    AllGather,
    Gather,
    Barrier,
}

/// Message passed to the right neighbour
#[derive(Debug, Clone)]
pub struct RingMessage {
    pub phase: RingPhase,
    pub step: u32,
    pub data: Vec<f32>,
}

/// Builder for a set of connected in-process ring members
pub struct LocalRing;

impl LocalRing {
    /// Create `world_size` members; member `i` sends to `(i+1) % world_size`
    pub fn build(world_size: usize, timeout: Duration) -> Result<Vec<RingMember>> {
        if world_size == 0 {
            return Err(EngineError::Collective(
                "ring needs at least one worker".to_string(),
            ));
        }

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..world_size).map(|_| mpsc::channel::<RingMessage>()).unzip();

        // Channel i carries messages into worker i
        let mut receivers: Vec<Option<Receiver<RingMessage>>> =
            receivers.into_iter().map(Some).collect();

        let mut members = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let right = (rank + 1) % world_size;
            let from_left = receivers[rank].take().ok_or_else(|| {
                EngineError::Collective(format!("receiver for rank {} already taken", rank))
            })?;
            members.push(RingMember {
                rank,
                world_size,
                to_right: senders[right].clone(),
                from_left: Mutex::new(from_left),
                timeout,
            });
        }

        debug!(world_size, ?timeout, "Built local ring");
        Ok(members)
    }
}

/// One worker's endpoint in the ring
pub struct RingMember {
    rank: usize,
    world_size: usize,
    to_right: Sender<RingMessage>,
    from_left: Mutex<Receiver<RingMessage>>,
    timeout: Duration,
}

/// Bounds of chunk `index` when `len` elements are split `n` ways
fn chunk_bounds(len: usize, n: usize, index: usize) -> (usize, usize) {
    (index * len / n, (index + 1) * len / n)
}

impl RingMember {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Send to the right neighbour, then wait for the matching message from the left
    fn exchange(&self, phase: RingPhase, step: u32, data: Vec<f32>) -> Result<Vec<f32>> {
        self.to_right
            .send(RingMessage { phase, step, data })
            .map_err(|_| {
                EngineError::Collective(format!(
                    "rank {}: right neighbour disconnected during {:?}",
                    self.rank, phase
                ))
            })?;

        let receiver = self.from_left.lock().map_err(|_| {
            EngineError::Collective(format!("rank {}: receiver lock poisoned", self.rank))
        })?;

        let message = receiver.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => EngineError::Collective(format!(
                "rank {}: {:?} step {} timed out after {:?}",
                self.rank, phase, step, self.timeout
            )),
            RecvTimeoutError::Disconnected => EngineError::Collective(format!(
                "rank {}: left neighbour disconnected during {:?}",
                self.rank, phase
            )),
        })?;

        if message.phase != phase || message.step != step {
            return Err(EngineError::Collective(format!(
                "rank {}: expected {:?} step {}, received {:?} step {}",
                self.rank, phase, step, message.phase, message.step
            )));
        }

        trace!(rank = self.rank, ?phase, step, len = message.data.len(), "Ring exchange");
        Ok(message.data)
    }
}

impl Collective for RingMember {
    fn all_reduce(&self, data: &mut [f32]) -> Result<()> {
        let n = self.world_size;
        if n == 1 {
            return Ok(());
        }
        let len = data.len();
        let me = self.rank;

        // Reduce-scatter: send chunk (me - step), accumulate into chunk (me - step - 1)
        for step in 0..n - 1 {
            let send_idx = (me + n - step) % n;
            let recv_idx = (me + n - step - 1) % n;

            let (s0, s1) = chunk_bounds(len, n, send_idx);
            let received =
                self.exchange(RingPhase::ReduceScatter, step as u32, data[s0..s1].to_vec())?;

            let (r0, r1) = chunk_bounds(len, n, recv_idx);
            if received.len() != r1 - r0 {
                return Err(EngineError::Collective(format!(
                    "rank {}: reduce-scatter chunk of {} elements, expected {}",
                    me,
                    received.len(),
                    r1 - r0
                )));
            }
            for (dst, src) in data[r0..r1].iter_mut().zip(&received) {
                *dst += src;
            }
        }

        // All-gather: send chunk (me + 1 - step), replace chunk (me - step)
        for step in 0..n - 1 {
            let send_idx = (me + n + 1 - step) % n;
            let recv_idx = (me + n - step) % n;

            let (s0, s1) = chunk_bounds(len, n, send_idx);
            let received =
                self.exchange(RingPhase::AllGather, step as u32, data[s0..s1].to_vec())?;

            let (r0, r1) = chunk_bounds(len, n, recv_idx);
            if received.len() != r1 - r0 {
                return Err(EngineError::Collective(format!(
                    "rank {}: all-gather chunk of {} elements, expected {}",
                    me,
                    received.len(),
                    r1 - r0
                )));
            }
            data[r0..r1].copy_from_slice(&received);
        }

        Ok(())
    }

    fn all_gather(&self, data: &[f32]) -> Result<Vec<f32>> {
        let n = self.world_size;
        let me = self.rank;
        let mut blocks: Vec<Vec<f32>> = vec![Vec::new(); n];
        blocks[me] = data.to_vec();

        // Forward the block received last step; after n-1 steps every block has arrived
        for step in 0..n.saturating_sub(1) {
            let send_idx = (me + n - step) % n;
            let recv_idx = (me + n - step - 1) % n;
            let outgoing = blocks[send_idx].clone();
            blocks[recv_idx] = self.exchange(RingPhase::Gather, step as u32, outgoing)?;
        }

        Ok(blocks.concat())
    }

    fn barrier(&self) -> Result<()> {
        let n = self.world_size;
        for step in 0..n.saturating_sub(1) {
            self.exchange(RingPhase::Barrier, step as u32, vec![self.rank as f32])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_on_ring<T, F>(world_size: usize, f: F) -> Vec<Result<T>>
    where
        T: Send,
        F: Fn(&RingMember) -> Result<T> + Sync,
    {
        let members = LocalRing::build(world_size, Duration::from_secs(5)).unwrap();
        thread::scope(|scope| {
            let handles: Vec<_> = members
                .iter()
                .map(|member| {
                    let f = &f;
                    scope.spawn(move || f(member))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_chunk_bounds_cover_short_tensors() {
        // 2 elements over 3 workers: one empty chunk, nothing lost
        let bounds: Vec<_> = (0..3).map(|i| chunk_bounds(2, 3, i)).collect();
        assert_eq!(bounds, vec![(0, 0), (0, 1), (1, 2)]);
    }

    #[test]
    fn test_ring_allreduce_3_workers() {
        let results = run_on_ring(3, |member| {
            let mut data = vec![(member.rank() + 1) as f32; 6];
            member.all_reduce(&mut data)?;
            Ok(data)
        });

        for result in results {
            assert_eq!(result.unwrap(), vec![6.0; 6]);
        }
    }

    #[test]
    fn test_ring_allreduce_uneven_and_short() {
        for len in [1, 2, 7, 10] {
            let results = run_on_ring(4, |member| {
                let mut data: Vec<f32> =
                    (0..len).map(|i| (i * (member.rank() + 1)) as f32).collect();
                member.all_reduce(&mut data)?;
                Ok(data)
            });

            // sum over ranks of i * (r + 1) = i * 10
            let expected: Vec<f32> = (0..len).map(|i| (i * 10) as f32).collect();
            for result in results {
                assert_eq!(result.unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_ring_all_gather_rank_order() {
        let results = run_on_ring(3, |member| member.all_gather(&[member.rank() as f32; 2]));

        for result in results {
            assert_eq!(result.unwrap(), vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        }
    }

    #[test]
    fn test_ring_barrier() {
        let results = run_on_ring(5, |member| member.barrier());
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_ring_timeout_when_peer_absent() {
        let members = LocalRing::build(2, Duration::from_millis(50)).unwrap();
        let mut data = vec![1.0; 4];

        // Member 1 never participates
        let err = members[0].all_reduce(&mut data).unwrap_err();
        assert!(matches!(err, EngineError::Collective(ref msg) if msg.contains("timed out")));
    }

    #[test]
    fn test_ring_disconnected_neighbour() {
        let mut members = LocalRing::build(2, Duration::from_secs(5)).unwrap();
        let survivor = members.remove(0);
        drop(members);

        let err = survivor.barrier().unwrap_err();
        assert!(matches!(err, EngineError::Collective(ref msg) if msg.contains("disconnected")));
    }

    #[test]
    fn test_single_member_ring_is_identity() {
        let members = LocalRing::build(1, Duration::from_millis(10)).unwrap();
        let mut data = vec![3.0, 4.0];
        members[0].all_reduce(&mut data).unwrap();
        assert_eq!(data, vec![3.0, 4.0]);
        assert_eq!(members[0].all_gather(&data).unwrap(), vec![3.0, 4.0]);
    }
}
