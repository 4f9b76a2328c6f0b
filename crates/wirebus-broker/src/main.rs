//! WireBus broker entry point.
//!
//! Loads the TOML configuration, initialises structured logging, starts the
//! broker, and runs until a shutdown signal arrives.

use tracing::info;
use tracing_subscriber::EnvFilter;

use wirebus_broker::{load_config, EventBroker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // Structured logging; `RUST_LOG` overrides the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone())),
        )
        .init();

    info!("WireBus broker starting");

    let broker = EventBroker::new();
    broker
        .start(&config.listener.bind_address, config.listener.port)
        .await?;

    info!(
        "WireBus broker ready on {}:{}. Press Ctrl-C to exit.",
        config.listener.bind_address, config.listener.port
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    broker.stop();

    info!("WireBus broker stopped");
    Ok(())
}
