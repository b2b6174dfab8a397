//! Grove daemon entry point.
//!
//! Owns one sandbox manager for the lifetime of the process: keeps the pool
//! warm, sweeps unhealthy sandboxes, logs stats periodically and tears
//! every VM down on Ctrl-C.

mod config;
mod daemon;

use config::DaemonConfig;
use daemon::Daemon;
use grove_core::MicroVmFactory;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("grove_daemon=info".parse()?)
                .add_directive("grove_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting grove daemon");

    let config = DaemonConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // warn-only to support development environments
    config.validate_warn();

    let daemon = Daemon::new(config, Arc::new(MicroVmFactory::new()))?;
    daemon.start().await;
    tracing::info!("Daemon ready");

    daemon
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
}
