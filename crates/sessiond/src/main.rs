//! Termgate Session Host
//!
//! Daemon that owns persistent terminal sessions and serves them to the
//! gateway over a single multiplexed WebSocket.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sessiond::bridge::PtyBridgeFactory;
use sessiond::config::Config;
use sessiond::registry::SessionRegistry;
use sessiond::uplink::Uplink;
use tokio_util::sync::CancellationToken;

/// Termgate session host - persistent terminal sessions behind a gateway.
#[derive(Parser, Debug)]
#[command(name = "termgate-sessiond")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// WebSocket URL of the gateway's upstream listener
    #[arg(long, value_name = "URL")]
    gateway_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides, then CLI flags on top
    config.apply_env_overrides();
    if let Some(url) = cli.gateway_url {
        config.gateway.url = url;
    }
    config.validate()?;

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        profile = ?config.profile,
        gateway = %config.gateway.url,
        "Termgate session host starting"
    );

    let registry = Arc::new(SessionRegistry::new(
        Arc::new(PtyBridgeFactory),
        config.registry_config(),
    ));

    let cancel = CancellationToken::new();

    registry.start_sweeper(
        config.sweep_interval(),
        config.detached_timeout(),
        cancel.clone(),
    );

    let uplink = Uplink::new(Arc::clone(&registry), &config.gateway);
    let uplink_cancel = cancel.clone();
    let uplink_task = tokio::spawn(async move { uplink.run(uplink_cancel).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    cancel.cancel();

    let _ = uplink_task.await;

    // Kill every remaining session so no orphaned shells survive us.
    for info in registry.list() {
        registry.destroy(&info.id).await;
    }

    tracing::info!("Session host stopped");
    Ok(())
}
