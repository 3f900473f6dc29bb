//! # Relay Server
//!
//! Realtime chat message relay gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (Redis on localhost)
//! relay
//!
//! # Run a single instance without Redis
//! RELAY__BROKER__KIND=memory relay
//!
//! # Override any setting from the environment
//! RELAY__PORT=9000 RELAY__BROKER__URL=redis://redis:6379 relay
//!
//! # Read one TOML file instead of the layered sources
//! RELAY_CONFIG=/srv/relay.toml relay
//! ```

mod broker;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::var_os("RELAY_CONFIG") {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!(
        "Starting Relay server on {}:{} ({:?} broker)",
        config.host,
        config.port,
        config.broker.kind
    );

    // Initialize metrics
    metrics::init_metrics();

    handlers::run_server(config).await
}
