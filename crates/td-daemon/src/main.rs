//! tourdesk server: loads config, opens the database and serves the API.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use td_core::config::Config;
use td_daemon::daemon::Daemon;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "tourdesk", version, about = "Travel agency back office and public API")]
struct Cli {
    /// Config file (defaults to $TOURDESK_CONFIG or ~/.tourdesk/config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Validate the config, print it and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    if cli.check_config {
        print!("{}", config.to_toml().context("failed to render config")?);
        return Ok(());
    }

    td_telemetry::logging::init("tourdesk", &config.logging.level, config.logging.json);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "tourdesk starting");

    let daemon = Daemon::new(config).await?;
    daemon.shutdown_handle().listen_for_os_signals();
    daemon.run().await
}
