//! Portgate Gateway
//!
//! The rendezvous point for proxy-clients and proxy-servers. Listens on one
//! or more sockets (optionally TLS), authenticates peers into statically
//! provisioned sessions and pumps frames between the paired slots.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use portgate::config::Config;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Portgate Gateway - pairing point for reverse TCP tunnels
#[derive(Parser, Debug)]
#[command(name = "portgate-gateway")]
#[command(about = "Portgate Gateway - pairing point for reverse TCP tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "portgate.toml")]
    config: String,

    /// Write an example configuration file and exit
    #[arg(long)]
    write_example_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.write_example_config {
        portgate::config::generate_example_config()
            .save(&args.config)
            .context("Failed to write example config")?;
        println!("Example configuration written to {}", args.config);
        return Ok(());
    }

    let config = match Config::load(&args.config).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let log_level = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let gateway_config = config
        .gateway
        .clone()
        .ok_or_else(|| anyhow!("No [gateway] section in config file"))?;

    info!("Portgate Gateway v{}", portgate::VERSION);

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let gateway = tokio::spawn(async move {
        portgate::gateway::run(gateway_config, run_cancel).await
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    cancel.cancel();

    gateway.await?.context("gateway failed")?;
    Ok(())
}
