//! Gantry Engine
//!
//! The middleware daemon. Builds every configured site, opens the
//! provenance store, reconciles persisted state and then runs until asked
//! to stop, chaining submissions as triggers fire.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry_engine::config::EngineConfig;
use gantry_engine::service::Gantry;
use gantry_site::config::SitesFile;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_engine=info,gantry_site=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gantry Engine");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: database_url={}, poll_interval={:?}",
        config.database_url, config.poll_interval
    );

    let sites = SitesFile::from_env().context("Failed to load the sites file")?;
    info!("Loaded {} site definition(s)", sites.sites.len());

    let gantry = Gantry::start(&config, &sites)
        .await
        .context("Failed to start the engine")?;
    info!("Engine initialized successfully");

    // Run until interrupted
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    gantry.shutdown().await;

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<EngineConfig> {
    match EngineConfig::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(_) => {
            info!("Failed to load config from environment, using defaults");
            let config = EngineConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}
