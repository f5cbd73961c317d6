#[cfg(feature = "storage-local")]
use crate::LocalStorage;
#[cfg(feature = "storage-rclone")]
use crate::RcloneStorage;
#[cfg(feature = "storage-s3")]
use crate::S3Storage;
use crate::{Storage, StorageError, StorageResult};
use aperture_core::StorageSettings;
use std::sync::Arc;

/// Create a storage backend based on configuration
pub async fn create_storage(settings: &StorageSettings) -> StorageResult<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match settings {
        #[cfg(feature = "storage-s3")]
        StorageSettings::S3(s3) => {
            if s3.bucket.is_empty() {
                return Err(StorageError::ConfigError("S3_BUCKET not configured".to_string()));
            }
            Arc::new(S3Storage::new(s3)?)
        }

        #[cfg(not(feature = "storage-s3"))]
        StorageSettings::S3(_) => {
            return Err(StorageError::ConfigError(
                "S3 storage backend not available (storage-s3 feature not enabled)".to_string(),
            ))
        }

        #[cfg(feature = "storage-local")]
        StorageSettings::Local(local) => Arc::new(LocalStorage::new(local).await?),

        #[cfg(not(feature = "storage-local"))]
        StorageSettings::Local(_) => {
            return Err(StorageError::ConfigError(
                "Local storage backend not available (storage-local feature not enabled)"
                    .to_string(),
            ))
        }

        #[cfg(feature = "storage-rclone")]
        StorageSettings::Rclone(rclone) => Arc::new(RcloneStorage::new(rclone)?),

        #[cfg(not(feature = "storage-rclone"))]
        StorageSettings::Rclone(_) => {
            return Err(StorageError::ConfigError(
                "Rclone storage backend not available (storage-rclone feature not enabled)"
                    .to_string(),
            ))
        }
    };

    tracing::info!(backend = %storage.backend_type(), "Storage backend initialized");
    Ok(storage)
}
