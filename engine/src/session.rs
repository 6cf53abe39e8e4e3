//! Generation session bookkeeping
//!
//! The attention caches never shrink; a `Session` records how much of them is
//! valid and which batch slots are in use. A slot touched by a failed call is
//! left `Aborted` and refuses new sessions until `reset()`.

use crate::config::ModelConfig;
use crate::errors::{GenerationError, Result};
use crate::model::Transformer;
use crate::tensor_ops::Tensor2D;
use serde::Serialize;
use tracing::{debug, warn};

/// Lifecycle of the model instance within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Weights loaded, no session running
    Loaded,
    Prefilling,
    Decoding,
    Finished,
    /// The last call failed; slots must be reset
    Aborted,
}

/// State of one cache batch slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Free,
    Active,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct Session {
    phase: Phase,
    /// Positions `[0, cached_len)` of every active slot are valid
    cached_len: usize,
    slots: Vec<SlotState>,
    active: usize,
    max_seq_len: usize,
    vocab_size: usize,
}

impl Session {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            phase: Phase::Loaded,
            cached_len: 0,
            slots: vec![SlotState::Free; config.max_batch_size],
            active: 0,
            max_seq_len: config.max_seq_len,
            vocab_size: config.vocab_size,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cached_len(&self) -> usize {
        self.cached_len
    }

    pub fn slot(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).copied()
    }

    /// Claim slots `[0, batch)` and start from an empty cache
    pub fn begin(&mut self, batch: usize) -> Result<()> {
        if batch == 0 {
            return Err(GenerationError::InvalidRequest("batch is empty".to_string()).into());
        }
        if batch > self.slots.len() {
            return Err(GenerationError::BatchTooLarge {
                requested: batch,
                max_batch_size: self.slots.len(),
            }
            .into());
        }
        if let Some(slot) = self.slots[..batch]
            .iter()
            .position(|&s| s == SlotState::Aborted)
        {
            return Err(GenerationError::SlotNotReset(slot).into());
        }

        for slot in &mut self.slots[..batch] {
            *slot = SlotState::Active;
        }
        self.active = batch;
        self.cached_len = 0;
        self.phase = Phase::Prefilling;
        debug!(batch, "Session started");
        Ok(())
    }

    fn check(&self, tokens: &[Vec<u32>], start_pos: usize) -> Result<()> {
        if !matches!(self.phase, Phase::Prefilling | Phase::Decoding) {
            return Err(GenerationError::InvalidRequest(format!(
                "no active session (phase {:?})",
                self.phase
            ))
            .into());
        }
        if tokens.len() != self.active {
            return Err(GenerationError::InvalidRequest(format!(
                "{} sequences passed to a session of {}",
                tokens.len(),
                self.active
            ))
            .into());
        }
        let len = tokens[0].len();
        if len == 0 || tokens.iter().any(|row| row.len() != len) {
            return Err(GenerationError::InvalidRequest(
                "rows must be non-empty and of equal length".to_string(),
            )
            .into());
        }
        if start_pos > self.cached_len {
            return Err(GenerationError::CacheGap {
                start_pos,
                cached: self.cached_len,
            }
            .into());
        }
        if start_pos + len > self.max_seq_len {
            return Err(GenerationError::SequenceTooLong {
                requested: start_pos + len,
                max_seq_len: self.max_seq_len,
            }
            .into());
        }
        if let Some(&token) = tokens.iter().flatten().find(|&&t| t as usize >= self.vocab_size) {
            return Err(GenerationError::TokenOutOfRange {
                token,
                vocab_size: self.vocab_size,
            }
            .into());
        }
        Ok(())
    }

    /// Validate and run one forward call; any failure aborts the active slots
    pub fn forward(
        &mut self,
        model: &mut Transformer,
        tokens: &[Vec<u32>],
        start_pos: usize,
    ) -> Result<Tensor2D> {
        let result = self
            .check(tokens, start_pos)
            .and_then(|_| model.forward(tokens, start_pos));

        match result {
            Ok(logits) => {
                self.cached_len = start_pos + tokens[0].len();
                self.phase = Phase::Decoding;
                Ok(logits)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Close a successful session; cache contents stay in place
    pub fn finish(&mut self) {
        for slot in &mut self.slots[..self.active] {
            *slot = SlotState::Free;
        }
        self.active = 0;
        self.phase = Phase::Finished;
    }

    /// Mark the active slots unusable until `reset()`
    pub fn abort(&mut self) {
        if self.active == 0 {
            return;
        }
        for slot in &mut self.slots[..self.active] {
            *slot = SlotState::Aborted;
        }
        warn!(slots = self.active, cached_len = self.cached_len, "Session aborted");
        self.active = 0;
        self.phase = Phase::Aborted;
    }

    /// Forget all position bookkeeping and free every slot
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = SlotState::Free);
        self.active = 0;
        self.cached_len = 0;
        self.phase = Phase::Loaded;
        debug!("Session reset");
    }
}
