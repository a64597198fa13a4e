mod cli;
mod commands;
mod config;
mod daemon;
mod engine;
mod errors;
mod ipc;
mod logging;
mod metrics;
mod ports;
mod registry;
mod server;
mod storage;
mod supervisor;
mod ui;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, DaemonCommand};
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command {
        Commands::Daemon {
            command: DaemonCommand::Run,
        } => daemon::run_foreground(config).await,
        command => commands::run(command, &config).await,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
