//! Portgate Proxy
//!
//! Runs every proxy-client and proxy-server instance defined in the config
//! file, each supervised independently. Exit codes: 0 normal, 1 invalid
//! configuration, 2 when every role ended in terminal auth failure.

use anyhow::{Context, Result};
use clap::Parser;
use portgate::config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

/// Portgate Proxy - expose services through a gateway-paired tunnel
#[derive(Parser, Debug)]
#[command(name = "portgate-proxy")]
#[command(about = "Portgate Proxy - expose services through a gateway-paired tunnel")]
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

    if config.proxy_client.is_empty() && config.proxy_server.is_empty() {
        eprintln!("Configuration error: no proxy_client or proxy_server sections");
        std::process::exit(1);
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    info!("Portgate Proxy v{}", portgate::VERSION);

    let cancel = CancellationToken::new();
    let mut roles = Vec::new();
    let mut instance = 0usize;

    for client_config in config.proxy_client.clone() {
        let span = tracing::info_span!("role", instance, kind = "proxy-client");
        let cancel = cancel.clone();
        roles.push(tokio::spawn(
            portgate::proxy::run_proxy_client(client_config, cancel).instrument(span),
        ));
        instance += 1;
    }
    for server_config in config.proxy_server.clone() {
        let span = tracing::info_span!("role", instance, kind = "proxy-server");
        let cancel = cancel.clone();
        roles.push(tokio::spawn(
            portgate::proxy::run_proxy_server(server_config, cancel).instrument(span),
        ));
        instance += 1;
    }

    info!(instances = roles.len(), "all roles started");

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            signal_cancel.cancel();
        }
    });

    let mut auth_failures = 0usize;
    let total = roles.len();
    for role in roles {
        match role.await {
            Ok(Ok(())) => {}
            Ok(Err(portgate::Error::AuthenticationFailed)) => auth_failures += 1,
            Ok(Err(e)) => error!(error = %e, "role failed"),
            Err(e) => error!(error = %e, "role task panicked"),
        }
    }

    if auth_failures == total {
        error!("every role ended in terminal auth failure");
        std::process::exit(2);
    }
    Ok(())
}
