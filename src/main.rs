//! Dawn daemon/satellite entry point

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use dawn::config::{self, Config};
use dawn::satellite::SatelliteService;

#[derive(Parser)]
#[command(name = "dawnd", version, about = "Distributed voice-assistant fabric")]
struct Cli {
    /// Use an explicit config file instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the central daemon
    Daemon {
        /// Override the bind port from the config file
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a satellite connected to a daemon
    Satellite {
        /// Override the daemon WebSocket URL
        #[arg(long)]
        url: Option<String>,
    },
    /// Print the resolved configuration
    Config,
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // INFO by default; RUST_LOG overrides
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Daemon { port } => {
            let mut config = load_config(&cli.config)?;
            if let Some(port) = port {
                config.daemon.port = port;
            }
            dawn::server::start(config).await
        }
        Command::Satellite { url } => {
            let mut config = load_config(&cli.config)?;
            if let Some(url) = url {
                config.satellite.daemon_url = url;
            }
            SatelliteService::new(config).run().await
        }
        Command::Config => config::show_config(),
    }
}
