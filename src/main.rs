//! Arkadiko bridge - main entry point

use arkadiko::api;
use arkadiko::config::BridgeConfig;
use arkadiko::observability::init_default_logging;
use arkadiko::{AppContext, BridgeService};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// HTTP to MQTT bridge
#[derive(Parser)]
#[command(name = "arkadiko")]
#[command(about = "Republishes JSON payloads posted over HTTP as MQTT messages")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "ARKADIKO_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Start {
        /// Address to bind
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Port to listen on
        #[arg(short, long, default_value_t = 8890)]
        port: u16,

        /// Debug logging
        #[arg(short, long)]
        debug: bool,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let force_debug = cli.verbose > 0 || matches!(cli.command, Commands::Start { debug: true, .. });
    init_default_logging(force_debug);

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Start { bind, port, .. } => run_bridge(config, SocketAddr::new(bind, port)).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    explicit: Option<&std::path::Path>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let path = BridgeConfig::locate(explicit)?;
    info!("Loading configuration from: {}", path.display());
    Ok(BridgeConfig::load_from_file(&path)?)
}

async fn run_bridge(
    config: BridgeConfig,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting arkadiko v{} with {:?} transport",
        env!("CARGO_PKG_VERSION"),
        config.publish.transport
    );

    let context = Arc::new(AppContext::new(config));

    // Nothing can be served without a transport
    if let Err(e) = context.publisher().await {
        error!("Failed to initialize publisher: {}", e);
        process::exit(1);
    }

    api::serve(BridgeService::new(Arc::clone(&context)), addr, shutdown_signal()).await;

    info!("Application shutdown initiated");
    context.shutdown().await;
    info!("Application shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
