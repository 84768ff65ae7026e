//! Network Manager
//!
//! Watches game-server pods carrying a `game.kruise.io/network-type`
//! annotation and runs the matching network plugin for each of them:
//! - Kubernetes-HostPort / Kubernetes-NodePort
//! - AlibabaCloud-SLB (when enabled in the config)
//!
//! Allocations and the network status are written back as pod annotations.

mod backoff;
mod controller;
mod error;
mod handler;
mod settings;
mod watcher;

use anyhow::Context;
use controller::Controller;
use settings::Settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Network Manager");

    let settings = Settings::from_env().context("reading settings from the environment")?;
    info!("Configuration:");
    info!("  Config file: {}", settings.config_path.display());
    info!("  Namespace: {}", settings.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Plugin timeout: {:?}", settings.plugin_timeout);
    info!("  Resync interval: {:?}", settings.resync_interval);

    let controller = Controller::new(settings)
        .await
        .context("initializing the network manager")?;
    controller.run().await.context("network manager stopped")?;

    Ok(())
}
