//! faasd - lightweight FaaS control-plane daemon.
//!
//! Manages process- and container-sandboxed function instances: dispatch,
//! pooling, autoscaling, and reaping, fronted by a thin HTTP facade.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "faasd")]
#[command(about = "Lightweight FaaS control-plane daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("faasd={log_level}").into()),
        )
        .init();

    info!("Starting faasd v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run(&cli.config).await?;
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("daemon error: {e}");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
