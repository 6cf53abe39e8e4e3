//! Batched generation driver
//!
//! Prompts may differ in length. The token buffer is seeded with every prompt,
//! decoding starts at the shortest prompt length, and positions still inside a
//! longer prompt keep the prompt token instead of the sample. Each row stops
//! independently on its EOS id or token budget.

use crate::errors::{GenerationError, Result};
use crate::model::Transformer;
use crate::session::Session;
use crate::tensor_ops::argmax;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, error, info, info_span};
use uuid::Uuid;

/// Per-call generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate per sequence
    pub max_new_tokens: usize,

    /// 0.0 selects the argmax; larger values flatten the distribution
    pub temperature: f32,

    /// Generation of a sequence stops at this id; it is not returned
    pub eos_id: Option<u32>,

    /// Sampling seed, defaults to the model configuration's seed
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 0.2,
            eos_id: None,
            seed: None,
        }
    }
}

/// Completed generation call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub session_id: Uuid,

    /// One completion per prompt, EOS excluded
    pub completions: Vec<Vec<u32>>,

    pub prompt_tokens: usize,

    pub completion_tokens: usize,

    pub execution_time_ms: u64,
}

/// Next-token selection
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(temperature: f32, seed: u64) -> Result<Self> {
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(GenerationError::InvalidSampling(format!(
                "temperature must be a finite non-negative number, got {}",
                temperature
            ))
            .into());
        }
        Ok(Self {
            temperature,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Greedy at temperature 0, otherwise a draw from `softmax(logits / temperature)`
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if self.temperature == 0.0 {
            return Ok(argmax(logits));
        }

        let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let weights: Vec<f32> = logits
            .iter()
            .map(|&l| ((l - max) / self.temperature).exp())
            .collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| GenerationError::InvalidSampling(format!("logits not samplable: {}", e)))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}

fn validate(model: &Transformer, prompts: &[Vec<u32>], config: &GenerationConfig) -> Result<()> {
    let limits = model.config();
    if prompts.is_empty() {
        return Err(GenerationError::InvalidRequest("no prompts given".to_string()).into());
    }
    if let Some(i) = prompts.iter().position(|p| p.is_empty()) {
        return Err(GenerationError::InvalidRequest(format!("prompt {} is empty", i)).into());
    }
    if config.max_new_tokens == 0 {
        return Err(
            GenerationError::InvalidRequest("max_new_tokens must be positive".to_string()).into(),
        );
    }
    if prompts.len() > limits.max_batch_size {
        return Err(GenerationError::BatchTooLarge {
            requested: prompts.len(),
            max_batch_size: limits.max_batch_size,
        }
        .into());
    }
    let longest = prompts.iter().map(Vec::len).max().unwrap_or(0);
    if longest + config.max_new_tokens > limits.max_seq_len {
        return Err(GenerationError::SequenceTooLong {
            requested: longest + config.max_new_tokens,
            max_seq_len: limits.max_seq_len,
        }
        .into());
    }
    if let Some(&token) = prompts
        .iter()
        .flatten()
        .find(|&&t| t as usize >= limits.vocab_size)
    {
        return Err(GenerationError::TokenOutOfRange {
            token,
            vocab_size: limits.vocab_size,
        }
        .into());
    }
    Ok(())
}

/// Generate completions for a batch of prompts.
///
/// On error the session is left aborted and must be reset before reuse.
pub fn generate(
    model: &mut Transformer,
    session: &mut Session,
    prompts: &[Vec<u32>],
    config: &GenerationConfig,
) -> Result<GenerationResult> {
    validate(model, prompts, config)?;
    let mut sampler = Sampler::new(config.temperature, config.seed.unwrap_or(model.config().seed))?;

    let session_id = Uuid::new_v4();
    let span = info_span!("session", %session_id);
    let _enter = span.enter();

    let stats = model.parallel().stats().clone();
    let prompt_tokens: usize = prompts.iter().map(Vec::len).sum();
    let started = Instant::now();

    info!(
        batch = prompts.len(),
        prompt_tokens,
        max_new_tokens = config.max_new_tokens,
        temperature = config.temperature,
        "Starting generation"
    );

    match run(model, session, prompts, config, &mut sampler) {
        Ok(completions) => {
            session.finish();
            let completion_tokens: usize = completions.iter().map(Vec::len).sum();
            let execution_time_ms = started.elapsed().as_millis() as u64;
            stats.record_success(prompt_tokens as u64, completion_tokens as u64);
            info!(completion_tokens, execution_time_ms, "Generation completed");
            Ok(GenerationResult {
                session_id,
                completions,
                prompt_tokens,
                completion_tokens,
                execution_time_ms,
            })
        }
        Err(e) => {
            session.abort();
            stats.record_failure();
            error!(error = %e, "Generation failed");
            Err(e)
        }
    }
}

fn run(
    model: &mut Transformer,
    session: &mut Session,
    prompts: &[Vec<u32>],
    config: &GenerationConfig,
    sampler: &mut Sampler,
) -> Result<Vec<Vec<u32>>> {
    let batch = prompts.len();
    let prompt_lens: Vec<usize> = prompts.iter().map(Vec::len).collect();
    let shortest = prompt_lens.iter().copied().min().unwrap_or(0);
    let longest = prompt_lens.iter().copied().max().unwrap_or(0);
    let total_len = longest + config.max_new_tokens;
    let stats = model.parallel().stats().clone();

    // Rows grow in lockstep so every forward window is rectangular
    let mut tokens: Vec<Vec<u32>> = prompts.to_vec();
    let mut completions: Vec<Vec<u32>> = vec![Vec::new(); batch];
    let mut finished = vec![false; batch];

    session.begin(batch)?;

    let mut prev_pos = 0;
    for cur_pos in shortest..total_len {
        let window: Vec<Vec<u32>> = tokens
            .iter()
            .map(|row| row[prev_pos..cur_pos].to_vec())
            .collect();

        let step_started = Instant::now();
        let logits = session.forward(model, &window, prev_pos)?;
        if prev_pos == 0 {
            stats.record_prefill(step_started.elapsed());
        } else {
            stats.record_decode(step_started.elapsed());
        }

        for b in 0..batch {
            if cur_pos < prompt_lens[b] {
                continue;
            }
            if finished[b] {
                let filler = tokens[b][cur_pos - 1];
                tokens[b].push(filler);
                continue;
            }

            let next = sampler.sample(logits.row(b))?;
            tokens[b].push(next);
            if config.eos_id == Some(next) {
                finished[b] = true;
                debug!(row = b, position = cur_pos, "Sequence reached EOS");
                continue;
            }
            completions[b].push(next);
            if completions[b].len() == config.max_new_tokens {
                finished[b] = true;
            }
        }

        prev_pos = cur_pos;
        if finished.iter().all(|&f| f) {
            break;
        }
    }

    Ok(completions)
}
