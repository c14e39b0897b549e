//! Enigma Uplink - HTTP Server Entry Point
//!
//! Starts the HTTP server that the chat transport talks to.

use std::time::Duration;

use enigma_uplink::{api, config::Config};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "enigma_uplink=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: worker={} env={} shadow_mode={}",
        config.worker.program, config.worker.env_name, config.worker.shadow_mode
    );
    if config.authorized_chat_id.is_none() {
        warn!("AUTHORIZED_CHAT_ID is not set; mission telemetry will not be delivered");
    }

    tokio::spawn(async {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            debug!("Heartbeat: runtime alive");
        }
    });

    api::serve(config).await?;

    info!("Shutdown complete");
    Ok(())
}
