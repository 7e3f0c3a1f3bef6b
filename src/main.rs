//! Warren CLI - TLS-tunneled layer-3 VPN.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use warren::config::{self, Config};
use warren::error::Result;
use warren::server::Service;

#[derive(Parser)]
#[command(name = "warren", version, about = "TLS-tunneled layer-3 VPN")]
struct Cli {
    /// Configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the VPN server.
    Serve,
    /// Connect to a VPN server.
    Connect,
    /// Write a default configuration file.
    Config {
        /// Where to write it.
        #[arg(default_value = "warren.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let mut logging = config.logging.clone();
    if let Some(level) = cli.log_level.clone() {
        logging.level = level;
    }
    config::init_logging(&logging)?;

    match cli.command {
        Commands::Serve => run_server(config).await?,
        Commands::Connect => run_client(config).await?,
        Commands::Config { path } => {
            Config::default().save(&path)?;
            println!("wrote {}", path.display());
        }
    }

    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    Service::new(config)?.run(shutdown).await
}

async fn run_client(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    warren::client::run(&config, shutdown).await
}

/// Cancel the token on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!("failed to register SIGTERM handler: {e}");
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("shutdown signal received");
        shutdown.cancel();
    });
}
