//! # Chorus Server
//!
//! Realtime messaging and notification server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! chorus
//!
//! # Run with custom config
//! chorus --config /path/to/chorus.toml
//!
//! # Run with environment variables
//! CHORUS__PORT=8080 CHORUS__HOST=0.0.0.0 chorus
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut args = std::env::args().skip(1);
    let config = match (args.next().as_deref(), args.next()) {
        (None, _) => config::Config::load()?,
        (Some("--config"), Some(path)) => config::Config::from_file(path)?,
        (Some(other), _) => bail!("Unrecognized argument {other:?}; usage: chorus [--config <path>]"),
    };

    tracing::info!("Starting Chorus server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
