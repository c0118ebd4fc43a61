//! Beckon relay broker
//!
//! Public-facing broker that parks incoming connections and beckons
//! private-side agents to dial back out and carry them.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beckon_broker::{Broker, BrokerConfig};

/// Reverse-tunnel relay broker
#[derive(Parser, Debug)]
#[command(name = "beckon")]
#[command(about = "Run a reverse-tunnel relay broker", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, env = "BECKON_CONFIG", default_value = "beckon.json")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    info!("🚀 Starting beckon broker");

    let config = BrokerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;
    info!("Notify address: {}", config.notify_address);
    info!("Back address: {}", config.back_address);
    info!("{} front listener(s) configured", config.listeners.len());

    let handle = Broker::new(config)
        .start()
        .await
        .context("Broker startup failed")?;

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping broker...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    handle.shutdown();
    info!("✅ Beckon broker stopped");

    Ok(())
}
