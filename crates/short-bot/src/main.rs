//! short-bot: automated short-side trade lifecycle agent for Binance USD-M
//! futures.
//!
//! Usage:
//!   short-bot [--config <FILE>]
//!
//! Reads trading signals from a CSV produced by an external selector, opens
//! maker shorts with a chase loop, protects them with server-side TP/SL
//! orders, and manages each position to a terminal outcome. State survives
//! restarts via a local SQLite store plus startup reconciliation against
//! the exchange.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use short_bot::config::BotConfig;
use short_bot::supervisor;

#[derive(Parser, Debug)]
#[command(name = "short-bot")]
#[command(about = "Binance USD-M futures short trade lifecycle engine")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // .env is optional; only complain about real load failures
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    let args = Args::parse();

    let mut config = BotConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {:?}", args.config))?;
    config.apply_env_overrides();
    config.validate().context("configuration validation failed")?;

    let log_level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;

    info!(config = %args.config.display(), "configuration loaded");
    supervisor::run(config).await
}
