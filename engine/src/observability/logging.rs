use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE: &str = "engine.log";

/// Default log location: ~/.latent-engine/logs
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".latent-engine")
        .join("logs")
}

/// Initialize logging with daily file rotation
///
/// Log records go to `engine.log` in `log_dir` (default ~/.latent-engine/logs)
/// and to stderr, so generated tokens on stdout stay machine-readable.
/// RUST_LOG overrides `level`.
pub fn init_production_logging(level: &str, log_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_line_number(false),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %level,
        "Logging initialized"
    );

    Ok(())
}

/// Initialize stderr-only logging for short CLI commands
pub fn init_simple_logging(level: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_line_number(false),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
