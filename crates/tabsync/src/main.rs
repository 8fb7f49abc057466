//! Tabsync daemon
//!
//! Usage:
//!   tabsync --config /etc/tabsync.yaml
//!   tabsync --config tabsync.yaml --check

use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tabsync::config::TabsyncConfig;
use tabsync::db::Database;
use tabsync::mqtt::MqttTrigger;
use tabsync::{Cli, SyncService};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TabsyncConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.check {
        tracing::info!(
            sources = config.sources.len(),
            "configuration {} is valid",
            cli.config.display()
        );
        return Ok(());
    }

    let db = Database::connect_postgres(&config.database)
        .await
        .context("connecting to database")?;
    let service = SyncService::from_config(&config, db)?;
    service.start();

    let cancel = CancellationToken::new();
    let mqtt_handle = config.mqtt.clone().map(|settings| {
        let trigger = MqttTrigger::new(settings, service.topic_router(), cancel.child_token());
        tokio::spawn(trigger.run())
    });

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received, initiating graceful shutdown...");
    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(cli.shutdown_timeout_secs);

    // Messages already handed to routing tasks are stored before the pool closes.
    if let Some(handle) = mqtt_handle {
        match tokio::time::timeout(shutdown_timeout, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!("MQTT trigger error: {}", e),
            Ok(Err(e)) => tracing::error!("MQTT trigger task panicked: {}", e),
            Err(_) => tracing::warn!("MQTT routing did not drain within {:?}", shutdown_timeout),
        }
    }
    match tokio::time::timeout(shutdown_timeout, service.shutdown()).await {
        Ok(Ok(())) => tracing::info!("Shut down gracefully"),
        Ok(Err(e)) => tracing::error!("Error during shutdown: {}", e),
        Err(_) => tracing::warn!("Shutdown timed out after {:?}, forcing exit", shutdown_timeout),
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
