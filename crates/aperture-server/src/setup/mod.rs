//! Application setup and initialization

pub mod database;
pub mod services;
pub mod storage;

use anyhow::{Context, Result};
use aperture_core::Config;

pub use services::AppState;

/// Validate configuration, install tracing and bring up every service.
pub async fn initialize_app(config: Config) -> Result<AppState> {
    config.validate().context("Configuration validation failed")?;

    aperture_infra::init_telemetry(config.log_format, &config.environment)?;
    tracing::info!("Configuration loaded and validated successfully");

    let repo = database::setup_repository(&config).await?;
    let storage = storage::setup_storage(&config).await?;

    services::initialize_services(&config, repo, storage).await
}
