//! Inference statistics tracking
//!
//! Counters shared between the model, its collectives and the runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Statistics for inference sessions
#[derive(Debug)]
pub struct InferenceStats {
    /// Generation sessions that produced a completion
    pub sessions_completed: AtomicU64,

    /// Generation sessions aborted by an error
    pub sessions_failed: AtomicU64,

    pub total_tokens_generated: AtomicU64,

    pub total_prompt_tokens: AtomicU64,

    /// Time spent in prefill forward calls, microseconds
    pub prefill_time_us: AtomicU64,

    /// Time spent in single-token decode calls, microseconds
    pub decode_time_us: AtomicU64,

    pub decode_steps: AtomicU64,

    /// Number of all-reduce / all-gather / barrier calls issued
    pub collective_operations: AtomicU64,

    pub collective_time_us: AtomicU64,

    /// Start time for uptime tracking
    pub start_time: Instant,
}

impl Default for InferenceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceStats {
    pub fn new() -> Self {
        Self {
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            total_tokens_generated: AtomicU64::new(0),
            total_prompt_tokens: AtomicU64::new(0),
            prefill_time_us: AtomicU64::new(0),
            decode_time_us: AtomicU64::new(0),
            decode_steps: AtomicU64::new(0),
            collective_operations: AtomicU64::new(0),
            collective_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a finished generation session
    pub fn record_success(&self, prompt_tokens: u64, completion_tokens: u64) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        self.total_prompt_tokens
            .fetch_add(prompt_tokens, Ordering::Relaxed);
        self.total_tokens_generated
            .fetch_add(completion_tokens, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefill(&self, elapsed: Duration) {
        self.prefill_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_decode(&self, elapsed: Duration) {
        self.decode_steps.fetch_add(1, Ordering::Relaxed);
        self.decode_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_collective(&self, elapsed: Duration) {
        self.collective_operations.fetch_add(1, Ordering::Relaxed);
        self.collective_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get total sessions (completed + failed)
    pub fn total_sessions(&self) -> u64 {
        self.sessions_completed.load(Ordering::Relaxed)
            + self.sessions_failed.load(Ordering::Relaxed)
    }

    /// Get success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.total_sessions();
        if total == 0 {
            return 0.0;
        }
        self.sessions_completed.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Decode throughput in tokens per second
    pub fn decode_tokens_per_second(&self) -> f64 {
        let seconds = self.decode_time_us.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        if seconds == 0.0 {
            return 0.0;
        }
        self.decode_steps.load(Ordering::Relaxed) as f64 / seconds
    }

    pub fn avg_collective_latency_us(&self) -> f64 {
        let ops = self.collective_operations.load(Ordering::Relaxed);
        if ops == 0 {
            return 0.0;
        }
        self.collective_time_us.load(Ordering::Relaxed) as f64 / ops as f64
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Log a statistics summary
    pub fn print_summary(&self) {
        info!(
            sessions_completed = self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed = self.sessions_failed.load(Ordering::Relaxed),
            prompt_tokens = self.total_prompt_tokens.load(Ordering::Relaxed),
            generated_tokens = self.total_tokens_generated.load(Ordering::Relaxed),
            success_rate = format!("{:.1}%", self.success_rate() * 100.0),
            decode_tokens_per_second = format!("{:.2}", self.decode_tokens_per_second()),
            collective_operations = self.collective_operations.load(Ordering::Relaxed),
            avg_collective_latency_us = format!("{:.1}", self.avg_collective_latency_us()),
            uptime_s = self.uptime_seconds(),
            "Inference statistics"
        );
    }

    /// Display formatted metrics (for CLI)
    pub fn display(&self) {
        use colored::Colorize;

        println!("\n{}", "Inference Metrics".bold().cyan());
        println!("{}", "=================".cyan());

        println!(
            "  Sessions:            {} ok / {} failed",
            self.sessions_completed
                .load(Ordering::Relaxed)
                .to_string()
                .green(),
            self.sessions_failed.load(Ordering::Relaxed).to_string().red()
        );
        println!(
            "  Prompt Tokens:       {}",
            self.total_prompt_tokens.load(Ordering::Relaxed)
        );
        println!(
            "  Tokens Generated:    {}",
            self.total_tokens_generated.load(Ordering::Relaxed)
        );
        println!(
            "  Prefill Time:        {:.2}ms",
            self.prefill_time_us.load(Ordering::Relaxed) as f64 / 1000.0
        );
        println!(
            "  Decode Tokens/sec:   {:.2}",
            self.decode_tokens_per_second()
        );
        println!(
            "  Collective Ops:      {}",
            self.collective_operations.load(Ordering::Relaxed)
        );
        println!();
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "sessions_completed": self.sessions_completed.load(Ordering::Relaxed),
            "sessions_failed": self.sessions_failed.load(Ordering::Relaxed),
            "total_tokens_generated": self.total_tokens_generated.load(Ordering::Relaxed),
            "total_prompt_tokens": self.total_prompt_tokens.load(Ordering::Relaxed),
            "prefill_time_us": self.prefill_time_us.load(Ordering::Relaxed),
            "decode_time_us": self.decode_time_us.load(Ordering::Relaxed),
            "decode_steps": self.decode_steps.load(Ordering::Relaxed),
            "collective_operations": self.collective_operations.load(Ordering::Relaxed),
            "success_rate": self.success_rate(),
            "uptime_s": self.uptime_seconds(),
        })
    }
}
