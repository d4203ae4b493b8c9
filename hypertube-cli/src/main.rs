//! Hypertube CLI - Command-line interface
//!
//! Runs the download API or performs a one-shot download of a local
//! `.torrent` file.

mod commands;

use clap::Parser;
use hypertube_core::HypertubeConfig;
use hypertube_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "hypertube")]
#[command(about = "BitTorrent download engine of the Hypertube streaming service")]
struct Cli {
    /// Log level, defaults to LOG_LEVEL or info
    #[arg(long, global = true, value_enum)]
    log_level: Option<CliLogLevel>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = HypertubeConfig::from_env();

    let level = cli.log_level.unwrap_or(config.server.log_level);
    init_tracing(
        level.as_tracing_level(),
        cli.json_logs || config.server.json_logs,
    )
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command, config).await?;
    Ok(())
}
