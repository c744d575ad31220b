//! Symi gateway daemon - Main entry point
//!
//! Keeps a link to one Symi mesh gateway, tracks its devices and serves them
//! over REST and WebSocket.

mod api;
mod config;
mod gateway;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use symi_discovery::LanScanner;
use symi_transport::list_serial_ports;

#[derive(Parser, Debug)]
#[command(name = "symi-gateway")]
#[command(about = "Symi mesh gateway bridge daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "symi-gateway.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Scan the local networks for gateways and exit
    #[arg(long)]
    discover: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Symi gateway v{}", env!("CARGO_PKG_VERSION"));

    if args.list_ports {
        let ports = list_serial_ports();
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => println!(
                    "{}  {:04x}:{:04x}  {}",
                    port.name,
                    vid,
                    pid,
                    port.product.as_deref().unwrap_or("")
                ),
                _ => println!("{}", port.name),
            }
        }
        return Ok(());
    }

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    // Override bind address if specified
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    if args.discover {
        let scanner = LanScanner::new(config.discovery.to_scan_config());
        let mut scan = scanner.scan_local()?;
        let mut found = 0;
        while let Some(candidate) = scan.next().await {
            found += 1;
            println!(
                "{}  {}  ({} ms)",
                candidate.address, candidate.gateway_id, candidate.metadata.latency_ms
            );
        }
        info!(found, "Gateway discovery complete");
        return Ok(());
    }

    info!(
        transport = %config.transport.to_transport_config(),
        storage = %config.storage.path.display(),
        "Configuration loaded"
    );

    // Create application state
    let state = state::AppState::new(config.clone()).await?;

    // Run web server and gateway engine
    server::run(state, &config.daemon.bind).await
}
