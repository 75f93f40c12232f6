//! relaybus broker binary.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use relaybus_broker::{Broker, BrokerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting relaybus broker"
    );

    let config = BrokerConfig::from_env().context("Failed to load configuration")?;
    let endpoint = config.endpoint();

    let binding = relaybus_transport::zmq::bind(&endpoint)
        .await
        .context("Failed to bind broker endpoint")?;
    tracing::info!(%endpoint, "listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broker = tokio::spawn(Broker::new(config).run(binding, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    broker.await.context("Broker task failed")?;

    Ok(())
}
