//! Latent Engine - Command Line Interface
//!
//! Runs batched text generation over token ids with a decoder-only
//! transformer using multi-head latent attention and mixture-of-experts
//! feed-forward layers.
//!
//! ## Commands
//! - `generate` - Load a model and generate completions for token prompts
//! - `inspect` - Validate a configuration and show its size and device plan
//! - `random-checkpoint` - Write a randomly initialized checkpoint for a configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use latent_engine::{
    device, init_production_logging, init_simple_logging, write_random_checkpoint, Engine,
    GenerationConfig, ModelConfig,
};
use std::path::PathBuf;
use tracing::info;

/// Latent Engine - MLA/MoE transformer inference
#[derive(Parser, Debug)]
#[command(name = "latent-engine")]
#[command(about = "Decoder-only transformer inference engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate completions for one or more token prompts
    Generate {
        /// Model configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Directory holding the safetensors archives
        #[arg(short, long)]
        weights: PathBuf,

        /// Comma-separated prompt token ids; repeat for a batch
        #[arg(long = "tokens", required = true)]
        prompts: Vec<String>,

        /// Max tokens to generate per prompt
        #[arg(short = 'n', long, default_value = "100")]
        max_new_tokens: usize,

        /// Sampling temperature (0 for greedy)
        #[arg(short, long, default_value = "0.2")]
        temperature: f32,

        /// End-of-sequence token id
        #[arg(long)]
        eos_id: Option<u32>,

        /// Sampling seed (defaults to the configuration seed)
        #[arg(long)]
        seed: Option<u64>,

        /// Show inference statistics after generation
        #[arg(long)]
        stats: bool,

        /// Log directory (default ~/.latent-engine/logs)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Validate a configuration and show its size and device plan
    Inspect {
        /// Model configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Number of tensor-parallel workers to plan for
        #[arg(short, long, default_value = "1")]
        world_size: usize,
    },

    /// Write a randomly initialized checkpoint for a configuration
    RandomCheckpoint {
        /// Model configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Initialization seed
        #[arg(long, default_value = "965")]
        seed: u64,

        /// Log level
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            config,
            weights,
            prompts,
            max_new_tokens,
            temperature,
            eos_id,
            seed,
            stats,
            log_dir,
            log_level,
        } => {
            init_production_logging(&log_level, log_dir)?;
            let prompts = prompts
                .iter()
                .map(|p| parse_tokens(p))
                .collect::<Result<Vec<_>>>()?;
            let generation = GenerationConfig {
                max_new_tokens,
                temperature,
                eos_id,
                seed,
            };
            cmd_generate(config, weights, prompts, generation, stats).await?;
        }

        Commands::Inspect { config, world_size } => {
            // No logging for inspect (pure display)
            cmd_inspect(config, world_size)?;
        }

        Commands::RandomCheckpoint {
            config,
            out,
            seed,
            log_level,
        } => {
            init_simple_logging(&log_level)?;
            cmd_random_checkpoint(config, out, seed)?;
        }
    }

    Ok(())
}

/// Parse "1, 2,3" into token ids
fn parse_tokens(input: &str) -> Result<Vec<u32>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .with_context(|| format!("Invalid token id '{}'", s))
        })
        .collect()
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.1} KB", bytes as f64 / 1_000.0)
    } else {
        format!("{} bytes", bytes)
    }
}

async fn cmd_generate(
    config_path: PathBuf,
    weights: PathBuf,
    prompts: Vec<Vec<u32>>,
    generation: GenerationConfig,
    show_stats: bool,
) -> Result<()> {
    let engine = Engine::new();
    let handle = engine
        .initialize(&config_path, &weights)
        .await
        .with_context(|| format!("Failed to load model from {}", weights.display()))?;

    let status = handle.status();
    if let Some(reason) = &status.downgrade_reason {
        eprintln!("{} {}", "Fused kernel unavailable:".yellow(), reason);
    }

    let result = handle
        .generate(prompts, generation)
        .await
        .context("Generation failed")?;

    info!(
        session_id = %result.session_id,
        completion_tokens = result.completion_tokens,
        execution_time_ms = result.execution_time_ms,
        "Generation finished"
    );

    for completion in &result.completions {
        let line: Vec<String> = completion.iter().map(u32::to_string).collect();
        println!("{}", line.join(","));
    }

    if show_stats {
        handle.stats().print_summary();
        handle.stats().display();
    }
    Ok(())
}

fn cmd_inspect(config_path: PathBuf, world_size: usize) -> Result<()> {
    let config = ModelConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    config
        .validate(world_size)
        .with_context(|| format!("Configuration does not fit {} workers", world_size))?;
    let selection = device::select(&config, world_size);

    println!("\n{}", "Model Configuration".bold().cyan());
    println!("{}", "===================".cyan());

    println!("\n{}", "Shape:".bold());
    println!("  Vocabulary:      {}", config.vocab_size);
    println!("  Width:           {}", config.dim);
    println!(
        "  Layers:          {} ({} dense, {} MoE)",
        config.n_layers,
        config.n_dense_layers,
        config.n_layers - config.n_dense_layers
    );
    println!("  Heads:           {}", config.n_heads);
    println!("  KV latent rank:  {}", config.kv_lora_rank);
    if config.has_moe_layers() {
        println!(
            "  Experts:         {} routed ({} active), {} shared",
            config.n_routed_experts, config.n_activated_experts, config.n_shared_experts
        );
    }
    println!("  Attention:       {:?}", config.attn_impl);
    println!("  Precision:       {}", config.dtype);

    println!("\n{}", "Footprint:".bold());
    println!("  Parameters:      {}", config.parameter_count());
    println!(
        "  Cache per worker: {}",
        format_bytes(config.cache_bytes(world_size))
    );

    println!("\n{}", "Device:".bold());
    println!("  Mode:            {}", selection.mode.to_string().green());
    if let Some(reason) = selection.downgrade_reason {
        println!("  Downgrade:       {}", reason.to_string().yellow());
    }
    println!();
    Ok(())
}

fn cmd_random_checkpoint(config_path: PathBuf, out: PathBuf, seed: u64) -> Result<()> {
    let config = ModelConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    std::fs::create_dir_all(&out)
        .with_context(|| format!("Failed to create {}", out.display()))?;

    let archive = write_random_checkpoint(&out, &config, seed)
        .context("Failed to write checkpoint")?;
    let config_copy = out.join("config.json");
    if !config_copy.exists() || !same_file(&config_path, &config_copy) {
        std::fs::copy(&config_path, &config_copy).context("Failed to copy config")?;
    }

    println!(
        "{} {}",
        "Checkpoint written:".green().bold(),
        archive.display()
    );
    Ok(())
}

fn same_file(a: &std::path::Path, b: &std::path::Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens() {
        assert_eq!(parse_tokens("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_tokens("7,").unwrap(), vec![7]);
        assert!(parse_tokens("1,x").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2_500_000), "2.5 MB");
    }
}
