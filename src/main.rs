//! Flotilla CLI entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use flotilla::adapters::{
    ChannelAgentMonitor, InMemoryClusterManager, InMemoryJobStore, InMemoryOfferSource,
};
use flotilla::daemon::Daemon;
use flotilla::domain::ports::SystemClock;
use flotilla::infrastructure::{init_logging, ConfigLoader, FacadeMetrics};

#[derive(Parser)]
#[command(name = "flotilla", version, about = "Container-job scheduling core")]
struct Cli {
    /// Path to a configuration file (defaults to ./flotilla.yaml + env).
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling and reconciliation loops with in-memory
    /// collaborators (single-node mode).
    Run,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };

    match cli.command {
        Commands::CheckConfig => {
            println!("configuration ok");
            Ok(())
        }
        Commands::Run => {
            let _guard = init_logging(&config.logging, None)
                .context("Failed to initialize logging")?;

            let store = InMemoryJobStore::new();
            let offer_source = InMemoryOfferSource::new();
            let cluster = InMemoryClusterManager::new();
            let monitor = ChannelAgentMonitor::new();

            let mut daemon = Daemon::build(
                &config,
                store,
                offer_source,
                cluster.clone(),
                Arc::new(SystemClock),
                &FacadeMetrics,
            )
            .context("Failed to assemble daemon")?;
            daemon.start(monitor.as_ref(), cluster.as_ref());

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl-c")?;
            daemon.shutdown(Duration::from_secs(10)).await;
            Ok(())
        }
    }
}
