//! imserver Daemon
//!
//! Accepts WebSocket connections on `/imserver/{userId}`, keeps one live
//! connection per user id and relays text messages between them. Server-side
//! callers reach the same delivery path through the push endpoint and the
//! management API.

mod config;
mod connection_registry;
mod handler;
mod management;
mod metrics;
mod router;

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::DaemonConfig;
use connection_registry::ConnectionRegistry;
use handler::HandlerState;
use imserver_transport::WssServer;
use router::MessageRouter;

/// imserver Daemon - WebSocket message relay
#[derive(Parser, Debug)]
#[command(name = "imserverd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file; repeat to layer overrides
    #[arg(short, long, default_value = "imserver.toml")]
    config: Vec<String>,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("imserver Daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(load_config(&args.config).await?);

    // Start metrics server
    let metrics_handle = metrics::start_server(&config.monitoring);

    let registry = ConnectionRegistry::with_gauge(
        config.registry.count_replacements,
        metrics::METRICS.online_users.clone(),
    );
    let router = MessageRouter::new(registry, config.server.welcome_text.clone());

    let management_handle = config.management.enabled.then(|| {
        let bind = config.management.bind;
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = management::start_server(bind, router).await {
                warn!("Management API stopped: {}", e);
            }
        })
    });

    let server = WssServer::bind(config.server.bind).await?;
    info!(
        "Relay endpoint {}/{{userId}}, push endpoint {}",
        config.server.endpoint_prefix,
        if config.push.enabled {
            config.push.path.as_str()
        } else {
            "disabled"
        }
    );

    tokio::select! {
        result = handler::run_handler(server, HandlerState::new(config.clone(), router)) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    // Cleanup
    metrics_handle.abort();
    if let Some(handle) = management_handle {
        handle.abort();
    }

    Ok(())
}

/// Load the first config file, then merge the rest on top
async fn load_config(paths: &[String]) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::default();

    for (i, path) in paths.iter().enumerate() {
        if !Path::new(path).exists() {
            warn!("Config file {} not found, skipping", path);
            continue;
        }

        if i == 0 {
            config = DaemonConfig::load(path).await?;
        } else {
            config.load_merge(path).await?;
        }
        info!("Loaded configuration from {}", path);
    }

    Ok(config)
}
