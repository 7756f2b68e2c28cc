//! Provisioning Controller
//!
//! Turns declarative cluster requests into installed, policy-compliant
//! clusters:
//! - ClusterTemplate: validated once, then immutable
//! - ProvisioningRequest: rendered, backed by allocated hardware, installed
//!   and tracked for configuration compliance
//!
//! Hardware plugins report allocation progress through the callback server.

mod backoff;
mod callback;
mod config;
mod controller;
mod error;
mod queue;
mod reconciler;
mod store;
#[cfg(test)]
mod test_utils;
mod watcher;


use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Provisioning Controller");

    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Hardware plugin: {} ({})", config.plugin.name, config.plugin.base_url);
    info!("  Plugin namespace: {}", config.plugin_namespace);
    info!(
        "  Namespace: {}",
        config.watch_namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Callback address: {}", config.callback_addr);
    info!("  Workers: {}", config.worker_count);
    info!("  Call timeout: {:?}", config.call_timeout);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
