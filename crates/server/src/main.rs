use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use mesa_core::config::{AppConfig, LoadOptions, LoggingConfig};
use mesa_server::{bootstrap, purge, router};

fn init_logging(config: &LoggingConfig) {
    use mesa_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    match config.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config.logging);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let server = &app.config.server;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let purge_task = purge::spawn(
        app.state.reservations.clone(),
        Duration::from_secs(server.purge_interval_secs),
        shutdown_rx,
    );

    let address = format!("{}:{}", server.bind_address, server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        environment = server.environment.as_str(),
        "mesa-server listening"
    );

    axum::serve(listener, router(app.state.clone()))
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "mesa-server stopping"
    );
    let _ = shutdown_tx.send(true);
    if let Some(task) = purge_task {
        let grace = Duration::from_secs(server.graceful_shutdown_secs);
        if tokio::time::timeout(grace, task).await.is_err() {
            tracing::warn!(
                event_name = "system.server.purge_timeout",
                correlation_id = "shutdown",
                "purge task did not stop within the grace period"
            );
        }
    }

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "could not listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
