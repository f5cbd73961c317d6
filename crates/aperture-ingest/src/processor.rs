//! Background processing of a received asset
//!
//! Runs once per asset in PROCESSING: spool the original while hashing, verify its
//! integrity, extract metadata, generate thumbnails and move the asset to ACTIVE.
//! Metadata and thumbnails are optional steps; their failures are logged and the
//! asset still becomes ACTIVE. An unreadable original fails the asset.

use aperture_core::models::{Asset, AssetStatus, Thumbnail};
use aperture_core::{AppError, TaskError};
use aperture_db::AssetRepository;
use aperture_processing::{MetadataExtractor, ThumbnailGenerator};
use aperture_storage::{keys, Storage};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::spool::{spool, stream_reader, suffix_for};

/// What a processing run did, stored as the task result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingSummary {
    pub asset_id: Uuid,
    pub status: Option<AssetStatus>,
    pub checksum: Option<String>,
    pub size_bytes: Option<u64>,
    pub metadata_extracted: bool,
    pub thumbnails_generated: usize,
    pub thumbnails_failed: usize,
    /// Set when the asset was not in PROCESSING and nothing was done
    pub skipped: bool,
}

#[derive(Clone)]
pub struct AssetProcessor {
    repo: Arc<dyn AssetRepository>,
    storage: Arc<dyn Storage>,
    metadata: MetadataExtractor,
    thumbnails: ThumbnailGenerator,
}

impl AssetProcessor {
    pub fn new(
        repo: Arc<dyn AssetRepository>,
        storage: Arc<dyn Storage>,
        metadata: MetadataExtractor,
        thumbnails: ThumbnailGenerator,
    ) -> Self {
        Self {
            repo,
            storage,
            metadata,
            thumbnails,
        }
    }

    /// Process `asset_id`.
    ///
    /// Errors wrapped as unrecoverable [`TaskError`]s have already failed the asset.
    /// Other errors are retryable; when `final_attempt` is set the asset is failed
    /// before the error is returned, so it never stays in PROCESSING.
    #[tracing::instrument(skip(self), fields(asset_id = %asset_id))]
    pub async fn process(&self, asset_id: Uuid, final_attempt: bool) -> Result<ProcessingSummary> {
        let asset = self
            .repo
            .get(asset_id)
            .await
            .context("Failed to load asset")?
            .ok_or_else(|| TaskError::unrecoverable(anyhow!("Asset {} not found", asset_id)))?;

        if asset.status != AssetStatus::Processing {
            tracing::info!(status = %asset.status, "Asset not in processing, skipping");
            return Ok(ProcessingSummary {
                asset_id,
                status: Some(asset.status),
                skipped: true,
                ..Default::default()
            });
        }

        let start = std::time::Instant::now();
        match self.run(&asset).await {
            Ok(summary) => {
                tracing::info!(
                    thumbnails = summary.thumbnails_generated,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Asset processed"
                );
                Ok(summary)
            }
            Err(e) => {
                if TaskError::is_unrecoverable(&e) || final_attempt {
                    self.fail_asset(asset_id, &e).await;
                }
                Err(e)
            }
        }
    }

    async fn run(&self, asset: &Asset) -> Result<ProcessingSummary> {
        let stream = match self.storage.download(&asset.storage_path).await {
            Ok(stream) => stream,
            Err(e) if e.is_not_found() => {
                return Err(TaskError::unrecoverable(anyhow!(
                    "Original {} is missing from storage",
                    asset.storage_path
                ))
                .into());
            }
            Err(e) => return Err(anyhow!(e).context("Failed to download original")),
        };

        let original = spool(stream_reader(stream), None, &suffix_for(&asset.storage_path))
            .await
            .context("Failed to read original")?;

        // Proxied uploads recorded the checksum at completion; direct uploads only
        // carry what the client declared.
        if let Some(expected) = asset.checksum.or(asset.declared_checksum) {
            if expected != original.checksum {
                return Err(TaskError::unrecoverable(anyhow!(
                    "Checksum mismatch: expected {}, computed {}",
                    expected,
                    original.checksum
                ))
                .into());
            }
        }

        let size_bytes = i64::try_from(original.size)
            .map_err(|_| TaskError::unrecoverable(anyhow!("Original too large to record")))?;

        let metadata_extracted = self.extract_metadata(asset, original.path()).await;
        let (thumbnails_generated, thumbnails_failed) =
            self.generate_thumbnails(asset, original.path()).await;

        self.repo
            .set_integrity(asset.id, original.checksum, size_bytes)
            .await
            .context("Failed to record checksum")?;

        let updated = self
            .repo
            .transition(asset.id, AssetStatus::Processing, AssetStatus::Active)
            .await
            .map_err(|e| TaskError::unrecoverable(anyhow!(e).context("Failed to activate asset")))?;

        Ok(ProcessingSummary {
            asset_id: asset.id,
            status: Some(updated.status),
            checksum: Some(original.checksum.to_hex()),
            size_bytes: Some(original.size),
            metadata_extracted,
            thumbnails_generated,
            thumbnails_failed,
            skipped: false,
        })
    }

    /// Returns whether any field was stored.
    async fn extract_metadata(&self, asset: &Asset, path: &Path) -> bool {
        let mut metadata = self.metadata.extract(path, asset.asset_type).await;
        if metadata.is_empty() {
            return false;
        }
        metadata.merge_missing(asset.metadata.clone());

        match self.repo.update_metadata(asset.id, &metadata).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to store extracted metadata");
                false
            }
        }
    }

    /// Returns `(stored, failed)` thumbnail counts.
    async fn generate_thumbnails(&self, asset: &Asset, path: &Path) -> (usize, usize) {
        if !self.thumbnails.can_generate_thumbnail(&asset.content_type) {
            tracing::debug!(content_type = %asset.content_type, "No thumbnails for content type");
            return (0, 0);
        }

        let outcomes = match self.thumbnails.generate_from_path(path).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode original for thumbnails");
                return (0, self.thumbnails.specs().len());
            }
        };

        let mut stored = 0;
        let mut failed = 0;
        for outcome in outcomes {
            let kind = outcome.kind;
            let thumb = match outcome.result {
                Ok(thumb) => thumb,
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "Thumbnail generation failed");
                    failed += 1;
                    continue;
                }
            };

            let thumb_path = keys::thumbnail_path(&asset.storage_path, kind.as_str(), thumb.extension);
            let size_bytes = thumb.data.len() as i64;
            if let Err(e) = self
                .storage
                .upload_bytes(&thumb_path, thumb.data, thumb.content_type)
                .await
            {
                tracing::warn!(kind = %kind, key = %thumb_path, error = %e, "Thumbnail upload failed");
                failed += 1;
                continue;
            }

            let record = Thumbnail {
                id: Uuid::new_v4(),
                asset_id: asset.id,
                kind,
                storage_path: thumb_path,
                content_type: thumb.content_type.to_string(),
                width: thumb.width.min(i32::MAX as u32) as i32,
                height: thumb.height.min(i32::MAX as u32) as i32,
                size_bytes,
                created_at: Utc::now(),
            };
            match self.repo.upsert_thumbnail(&record).await {
                Ok(_) => stored += 1,
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "Failed to record thumbnail");
                    failed += 1;
                }
            }
        }
        (stored, failed)
    }

    async fn fail_asset(&self, asset_id: Uuid, cause: &anyhow::Error) {
        match self
            .repo
            .transition(asset_id, AssetStatus::Processing, AssetStatus::Failed)
            .await
        {
            Ok(_) => tracing::error!(error = %cause, "Asset processing failed"),
            Err(e) => tracing::error!(
                error = %e,
                cause = %cause,
                "Failed to mark asset as failed"
            ),
        }
    }

    /// Fail an asset whose processing task gave up without reaching a verdict, e.g.
    /// because its last attempt timed out. No-op unless the asset is still PROCESSING.
    #[tracing::instrument(skip(self), fields(asset_id = %asset_id))]
    pub async fn abandon(&self, asset_id: Uuid, reason: &str) {
        match self
            .repo
            .transition(asset_id, AssetStatus::Processing, AssetStatus::Failed)
            .await
        {
            Ok(_) => tracing::error!(reason = %reason, "Asset processing abandoned"),
            Err(AppError::Conflict(_)) | Err(AppError::NotFound(_)) => {
                tracing::debug!("Asset already left processing")
            }
            Err(e) => tracing::error!(
                error = %e,
                reason = %reason,
                "Failed to mark abandoned asset as failed"
            ),
        }
    }
}
