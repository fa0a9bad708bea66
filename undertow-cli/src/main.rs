//! Undertow CLI - Command-line interface
//!
//! Drives a download session from the terminal. Each invocation opens the
//! persisted session, runs one command and shuts the session down cleanly.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "A torrent download session manager")]
struct Cli {
    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Warn)]
    log_level: CliLogLevel,

    /// Directory holding the persisted session
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = undertow_core::UndertowConfig::for_development();
    if let Some(state_dir) = cli.state_dir {
        config.storage.state_dir = state_dir;
    }

    let logs_dir = config.storage.state_dir.join("logs");
    init_tracing(cli.log_level.as_tracing_level(), Some(&logs_dir))
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("Failed to initialize logging")?;
    tracing::debug!("Using session state in {}", config.storage.state_dir.display());

    if let Err(e) = commands::handle_command(config, cli.command).await {
        if e.is_user_error() {
            anyhow::bail!(e.user_message());
        }
        return Err(e).context("Command failed");
    }

    Ok(())
}
