//! lightpathd: per-tenant SDN controller for IP-over-WDM networks.
//!
//! Binary entry point: loads configuration from the environment, opens
//! the resource store, wires the controller, and runs until a shutdown
//! signal arrives. Provisioning requests reach the controller through
//! the tenant's northbound surface, which lives outside this process.

use std::sync::Arc;

use anyhow::Result;
use lightpathd::{Controller, ControllerConfig, InProcessBroker, SqliteResourceStore};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lightpathd=info".parse()?),
        )
        .init();

    let config = ControllerConfig::from_env()?;
    info!(
        vop = %config.virtual_operator,
        broker = %config.broker_address,
        store = %config.store_url,
        "starting controller"
    );

    let store = Arc::new(SqliteResourceStore::connect(&config.store_url, config.store_timeout).await?);

    // Deployments wire a broker-backed transport here; the in-process
    // broker serves single-host and lab runs.
    let transport = Arc::new(InProcessBroker::new());

    let controller = Controller::start(config, store.clone(), transport).await?;
    info!("controller ready to accept connections");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    controller.shutdown().await;
    store.close().await;
    Ok(())
}
