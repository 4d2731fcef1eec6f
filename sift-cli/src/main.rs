//! Sift DNS forwarder CLI
//!
//! Loads the TOML configuration, starts the resolver and its UDP/TCP
//! listeners, and shuts down cleanly on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sift_dns::{Config, DnsServer, Resolver};

/// Sift - a filtering DNS forwarder
#[derive(Parser)]
#[command(name = "sift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sift.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace); overrides the config's
    /// debug flag
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the resolver (the default when no subcommand is given)
    Run,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "sift.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cli.config, cli.log_level).await,
        Commands::GenConfig { output } => generate_config(output),
    }
}

async fn run(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {:?}", config_path))?;

    let default_level = log_level.unwrap_or_else(|| {
        if config.debug {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    });
    init_logging(&default_level);

    info!(config = ?config_path, "starting sift");

    let (shutdown_tx, _) = broadcast::channel(1);

    let resolver = Resolver::new(&config, &shutdown_tx)
        .await
        .context("failed to build resolver")?;

    let server = DnsServer::new(config.listen, Arc::new(resolver), shutdown_tx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "DNS server error");
        }
    });

    wait_for_shutdown().await;
    info!("shutting down");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), server_handle).await;

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("failed to write configuration to {:?}", output))?;

    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the nameservers and block lists, then start with: sift -c {:?}", output);

    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C");
    }
}
