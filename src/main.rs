//! Beacon indexer binary.
//!
//! Configuration comes from the environment (see
//! `BeaconIndexerConfig::from_env`); Ctrl-C requests a graceful shutdown.

use beacon_indexer::telemetry::{TelemetryConfig, init_telemetry};
use beacon_indexer::utils::logging;
use beacon_indexer::{BeaconIndexer, BeaconIndexerConfig, Result};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _telemetry = init_telemetry(TelemetryConfig::default());

    let config = BeaconIndexerConfig::from_env()?;
    logging::log_startup(&config.node.url, &config.database_url, &config.enabled_modes());

    let indexer = Arc::new(BeaconIndexer::new(config).await?);
    logging::log(logging::LogLevel::Success, "Database schema initialized");

    let signals = indexer.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signals.shutdown();
        }
    });

    indexer.run().await
}
