use std::sync::Arc;

use banter_directory::Directory;
use banter_server::ServerConfig;
use banter_telemetry::TelemetryConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    banter_telemetry::init_telemetry(&TelemetryConfig::default());

    tracing::info!("starting banter server");

    let directory = Arc::new(Directory::new());
    let config = ServerConfig::default();

    let handle = banter_server::start(config, directory).await?;
    tracing::info!(addr = %handle.addr, "banter server ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    Ok(())
}
