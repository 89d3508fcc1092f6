//! DuraMQ Server Binary
//!
//! Networked message broker with durable queues.

use clap::Parser;
use duramq::config::BrokerConfig;
use duramq::server::Broker;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "duramq-server")]
#[command(about = "Networked message broker with durable queues")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/broker.toml")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind to
    #[arg(short, long)]
    bind: Option<String>,

    /// Queue storage directory
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let default_filter = if args.verbose {
        "duramq=debug,info"
    } else {
        "duramq=info,warn"
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("Starting DuraMQ Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration: defaults, then file, then DURAMQ__* environment
    if !args.config.exists() {
        info!("Config file not found, using defaults");
    }
    let mut config = BrokerConfig::load(Some(args.config.as_path()))?;

    // Override config with CLI arguments
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(storage) = args.storage {
        config.storage.directory = storage;
    }

    info!("Listen address: {}", config.listen_address());
    info!("Storage directory: {}", config.storage.directory.display());
    info!("Sync on write: {}", config.storage.sync_on_write);

    let broker = Broker::new(config)?;
    if let Err(e) = broker.start().await {
        error!("Failed to start broker: {}", e);
        std::process::exit(1);
    }

    let listener_failed = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.expect("Failed to install CTRL+C signal handler");
            info!("Shutdown signal received");
            false
        }
        e = broker.wait_for_failure() => {
            error!("Listener stopped: {}", e);
            true
        }
    };

    if let Err(e) = broker.stop().await {
        error!("Broker error: {}", e);
        std::process::exit(1);
    }
    if listener_failed {
        std::process::exit(1);
    }

    info!("DuraMQ Server stopped");
    Ok(())
}
