use std::sync::Arc;

use mesa_core::clock::{Clock, SystemClock};
use mesa_core::config::{AppConfig, ConfigError, LoadOptions};
use mesa_db::{open_store, StorageError};
use thiserror::Error;
use tracing::info;

use crate::routes::AppState;

pub struct Application {
    pub config: AppConfig,
    pub state: AppState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("storage could not be opened: {0}")]
    Storage(#[from] StorageError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Opens (and migrates) the store and wires the intake pipeline.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        environment = config.server.environment.as_str(),
        "starting application bootstrap"
    );

    let store = open_store(&config.database).await?;
    info!(
        event_name = "system.bootstrap.store_opened",
        correlation_id = "bootstrap",
        in_memory = config.database.url.trim() == mesa_db::store::MEMORY_URL,
        "reservation store ready"
    );

    if config.agent.has_api_key() {
        info!(
            event_name = "system.bootstrap.agent",
            correlation_id = "bootstrap",
            "agent api key configured; serving with the bundled command agent"
        );
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(config.clone(), store, clock);
    Ok(Application { config, state })
}
