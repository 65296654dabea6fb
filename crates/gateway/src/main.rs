//! Termgate Gateway
//!
//! Broker that connects end-user WebSocket clients to persistent terminal
//! sessions served by a session host.

use std::path::PathBuf;

use clap::Parser;
use gateway::config::Config;
use gateway::server::Gateway;
use tokio_util::sync::CancellationToken;

/// Termgate gateway - brokers client WebSockets onto session hosts.
#[derive(Parser, Debug)]
#[command(name = "termgate-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address for end-user client connections
    #[arg(long, value_name = "ADDR")]
    client_addr: Option<String>,

    /// Address for session host connections
    #[arg(long, value_name = "ADDR")]
    upstream_addr: Option<String>,

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
    if let Some(addr) = cli.client_addr {
        config.listen.client_addr = addr;
    }
    if let Some(addr) = cli.upstream_addr {
        config.listen.upstream_addr = addr;
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
        client_addr = %config.listen.client_addr,
        upstream_addr = %config.listen.upstream_addr,
        "Termgate gateway starting"
    );

    let gateway = Gateway::bind(config).await?;
    tracing::info!(
        client_addr = %gateway.client_addr()?,
        upstream_addr = %gateway.upstream_addr()?,
        "Listeners bound"
    );

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let server = tokio::spawn(async move { gateway.run(run_cancel).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    cancel.cancel();

    let _ = server.await;
    tracing::info!("Gateway stopped");
    Ok(())
}
