//! kedged: the kedge gateway daemon.
//!
//! # Usage
//!
//! ```text
//! kedged serve --config /etc/kedge/kedge.toml
//! kedged validate --config kedge.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use kedge_config::Config;

#[derive(Parser)]
#[command(name = "kedged", about = "kedge HTTP/gRPC gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "kedge.toml")]
        config: PathBuf,
    },
    /// Load and check a configuration file, then exit.
    Validate {
        #[arg(long, default_value = "kedge.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kedged=debug,kedge_proxy=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Validate { config } => validate(config),
    }
}

fn load(path: &Path) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

async fn serve(path: PathBuf) -> anyhow::Result<()> {
    let config = load(&path)?;
    info!(config = %path.display(), "kedge gateway starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
        }
        let _ = shutdown_tx.send(true);
    });

    kedged::run(config, shutdown_rx).await?;

    info!("kedge gateway stopped");
    Ok(())
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let config = load(&path)?;
    kedged::check_routes(&config)?;
    println!(
        "{}: ok ({} http backends, {} http routes, {} adhoc rules, {} grpc backends, {} grpc routes)",
        path.display(),
        config.http.backends.len(),
        config.http.routes.len(),
        config.http.adhoc.len(),
        config.grpc.backends.len(),
        config.grpc.routes.len(),
    );
    Ok(())
}
