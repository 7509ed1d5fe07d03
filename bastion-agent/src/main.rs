#![forbid(unsafe_code)]

use anyhow::Context;
use bastion_agent::Agent;
use bastion_lib::{config, logging};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "bastion-agent")]
#[command(about = "Bastion endpoint management agent")]
#[command(version)]
struct Cli {
    /// Additional configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // --help and --version exit here
    let cli = Cli::parse();

    // Test mode: exit before touching the filesystem (set BASTION_AGENT_TEST_MODE=1)
    if std::env::var("BASTION_AGENT_TEST_MODE")
        .map(|v| v == "1")
        .unwrap_or(false)
    {
        #[allow(clippy::print_stdout)]
        {
            println!("bastion-agent started successfully");
        }
        return Ok(());
    }

    let mut loader = config::ConfigLoader::new("bastion-agent");
    if let Some(path) = cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    logging::init(&config.logging)?;

    let agent = Agent::start(&config).await?;
    info!(endpoint = %agent.endpoint(), "bastion-agent started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    agent.shutdown().await;
    info!("bastion-agent shutdown complete");
    Ok(())
}
