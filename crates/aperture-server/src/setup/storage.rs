//! Storage setup and initialization

use anyhow::{Context, Result};
use aperture_core::Config;
use aperture_storage::{create_storage, Storage};
use std::sync::Arc;

pub async fn setup_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    tracing::info!("Initializing storage...");
    let storage = create_storage(&config.storage)
        .await
        .context("Failed to initialize storage backend")?;
    tracing::info!(
        backend = ?storage.backend_type(),
        presigned_urls = storage.supports_presigned_urls(),
        "Storage initialized successfully"
    );
    Ok(storage)
}
