//! Upload initiation and completion, and the user-facing lifecycle operations.
//!
//! ```text
//! UPLOADING -> PROCESSING -> ACTIVE | FAILED
//! ACTIVE <-> TRASHED
//! ACTIVE | TRASHED | FAILED | UPLOADING -> DELETED
//! ```
//!
//! Every status change is a compare-and-set through the repository. Ownership is
//! checked on every call; an asset owned by someone else is reported as not found.

use aperture_core::models::{
    Asset, AssetStatus, AssetType, Checksum, Priority, ProcessAssetPayload,
    PurgeTrashedAssetPayload, SweepOrphansPayload, Thumbnail, ThumbnailKind,
};
use aperture_core::{AppError, Config};
use aperture_db::AssetRepository;
use aperture_processing::{sanitize_filename, MediaValidator, ValidationError};
use aperture_storage::{keys, ByteReader, ByteStream, PresignedUpload, Storage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use aperture_worker::WorkQueue;

use crate::lifecycle::{remove_asset, CleanupReport};
use crate::spool::spool;

/// Queue carrying per-asset processing.
pub const MEDIA_QUEUE: &str = "media";
/// Queue carrying purges and orphan sweeps.
pub const MAINTENANCE_QUEUE: &str = "maintenance";

pub const THUMBNAIL_CACHE_CONTROL: &str = "public, max-age=86400";
pub const ORIGINAL_CACHE_CONTROL: &str = "private, max-age=3600";

const GENERIC_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Offer presigned uploads when the backend supports them
    pub direct_upload: bool,
    pub presign_ttl: Duration,
    /// Delay between a soft delete and the physical purge
    pub trash_retention: chrono::Duration,
    /// Age after which an asset still in UPLOADING is reaped
    pub stale_upload_after: chrono::Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            direct_upload: config.storage.direct_upload_enabled(),
            presign_ttl: Duration::from_secs(config.storage.presign_ttl_secs()),
            trash_retention: chrono::Duration::days(config.trash_retention_days.max(0)),
            stale_upload_after: chrono::Duration::hours(config.stale_upload_hours.max(1)),
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            direct_upload: true,
            presign_ttl: Duration::from_secs(3600),
            trash_retention: chrono::Duration::days(30),
            stale_upload_after: chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitiateUpload {
    pub owner_id: Uuid,
    pub filename: String,
    pub content_type: String,
    /// Declared byte size, if the client knows it
    pub size: Option<u64>,
    /// Declared checksum as lowercase hex
    pub checksum: Option<String>,
}

/// Reply to [`IngestionCoordinator::initiate_upload`].
#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    pub asset_id: Uuid,
    pub storage_path: String,
    /// When true the client uploads to `upload` and then calls
    /// [`IngestionCoordinator::mark_upload_complete`]; otherwise it streams the bytes
    /// through [`IngestionCoordinator::complete_upload`].
    pub direct_upload: bool,
    pub upload: Option<PresignedUpload>,
}

/// How a download is served.
pub enum AssetDownload {
    Redirect {
        url: String,
        expires_at: DateTime<Utc>,
        content_type: String,
        cache_control: &'static str,
    },
    Stream {
        stream: ByteStream,
        content_type: String,
        size: Option<u64>,
        cache_control: &'static str,
    },
}

impl AssetDownload {
    pub fn cache_control(&self) -> &'static str {
        match self {
            AssetDownload::Redirect { cache_control, .. }
            | AssetDownload::Stream { cache_control, .. } => cache_control,
        }
    }

    pub fn content_type(&self) -> &str {
        match self {
            AssetDownload::Redirect { content_type, .. }
            | AssetDownload::Stream { content_type, .. } => content_type,
        }
    }
}

/// Work re-established by [`IngestionCoordinator::recover`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub processing_requeued: usize,
    pub purges_scheduled: usize,
    pub uploads_reaped: usize,
    pub errors: usize,
}

/// Content type served for an original: the recorded one unless it is missing or
/// generic, then the storage key's extension, then the asset type's default.
fn original_content_type(asset: &Asset) -> String {
    let recorded = asset.content_type.trim();
    if !recorded.is_empty() && !recorded.eq_ignore_ascii_case(GENERIC_CONTENT_TYPE) {
        return recorded.to_string();
    }
    match keys::content_type_for_key(&asset.storage_path) {
        GENERIC_CONTENT_TYPE => asset.asset_type.default_content_type().to_string(),
        guessed => guessed.to_string(),
    }
}

/// Marks an asset as being completed; released on drop.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<Uuid>>>,
    asset_id: Uuid,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<Uuid>>>, asset_id: Uuid) -> Result<Self, AppError> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(asset_id);
        if !inserted {
            return Err(AppError::Conflict(format!(
                "upload of asset {} is already being completed",
                asset_id
            )));
        }
        Ok(Self {
            set: set.clone(),
            asset_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.asset_id);
    }
}

pub struct IngestionCoordinator {
    repo: Arc<dyn AssetRepository>,
    storage: Arc<dyn Storage>,
    queue: WorkQueue,
    validator: MediaValidator,
    settings: IngestSettings,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl IngestionCoordinator {
    pub fn new(
        repo: Arc<dyn AssetRepository>,
        storage: Arc<dyn Storage>,
        queue: WorkQueue,
        validator: MediaValidator,
        settings: IngestSettings,
    ) -> Self {
        Self {
            repo,
            storage,
            queue,
            validator,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Direct uploads need both the setting and a presign-capable backend.
    pub fn direct_upload_available(&self) -> bool {
        self.settings.direct_upload && self.storage.supports_presigned_urls()
    }

    /// Validate the request and create the asset in UPLOADING.
    #[tracing::instrument(skip(self, request), fields(owner_id = %request.owner_id, filename = %request.filename))]
    pub async fn initiate_upload(&self, request: InitiateUpload) -> Result<UploadTicket, AppError> {
        self.validator
            .validate_all(&request.filename, &request.content_type, request.size)?;

        let declared_checksum = request
            .checksum
            .as_deref()
            .map(Checksum::from_hex)
            .transpose()?;
        let declared_size = request
            .size
            .map(|s| {
                i64::try_from(s)
                    .map_err(|_| AppError::from(ValidationError::FileTooLarge {
                        size: s,
                        max: self.validator.max_file_size(),
                    }))
            })
            .transpose()?;

        let asset_id = Uuid::new_v4();
        let filename = sanitize_filename(&request.filename);
        let storage_path = keys::asset_path(request.owner_id, asset_id, &filename, Utc::now());
        let asset = Asset::new_uploading(
            asset_id,
            request.owner_id,
            AssetType::classify(&request.content_type, &request.filename),
            storage_path.clone(),
            request.filename.clone(),
            request.content_type.clone(),
            declared_size,
            declared_checksum,
        );
        self.repo.create(&asset).await?;

        let upload = if self.direct_upload_available() {
            let presigned = self
                .storage
                .presigned_upload_url(&storage_path, &request.content_type, self.settings.presign_ttl)
                .await?;
            Some(presigned)
        } else {
            None
        };

        tracing::info!(
            asset_id = %asset_id,
            asset_type = %asset.asset_type,
            direct_upload = upload.is_some(),
            "Upload initiated"
        );

        Ok(UploadTicket {
            asset_id,
            storage_path,
            direct_upload: upload.is_some(),
            upload,
        })
    }

    /// Receive the bytes of a proxied upload, then hand the asset to background processing.
    ///
    /// The stream is capped at the configured maximum and checked against the declared
    /// size and checksum before anything reaches storage. A rejected stream leaves the
    /// asset in UPLOADING so the client can retry. A second call while one is running, or
    /// after the asset has left UPLOADING, is a `Conflict`.
    #[tracing::instrument(skip(self, reader), fields(asset_id = %asset_id))]
    pub async fn complete_upload(
        &self,
        asset_id: Uuid,
        owner_id: Uuid,
        reader: ByteReader,
    ) -> Result<Asset, AppError> {
        let _guard = InFlightGuard::acquire(&self.in_flight, asset_id)?;

        let asset = self.owned_asset(asset_id, owner_id).await?;
        Self::ensure_uploading(&asset)?;

        let start = std::time::Instant::now();
        let max = self.validator.max_file_size();
        let spooled = spool(reader, Some(max), "").await?;

        if spooled.size > max {
            return Err(ValidationError::FileTooLarge {
                size: spooled.size,
                max,
            }
            .into());
        }
        self.validator.validate_file_size(spooled.size)?;

        if let Some(declared) = asset.size_bytes {
            if declared != spooled.size as i64 {
                return Err(AppError::InvalidInput(format!(
                    "received {} bytes, declared {}",
                    spooled.size, declared
                )));
            }
        }
        if let Some(declared) = asset.declared_checksum {
            if declared != spooled.checksum {
                return Err(AppError::InvalidInput(format!(
                    "checksum mismatch: declared {}, computed {}",
                    declared, spooled.checksum
                )));
            }
        }

        let file = spooled.open().await?;
        let written = self
            .storage
            .upload(
                &asset.storage_path,
                Box::pin(file),
                Some(spooled.size),
                &asset.content_type,
            )
            .await?;

        self.repo
            .set_integrity(asset_id, spooled.checksum, written as i64)
            .await?;

        tracing::info!(
            size_bytes = written,
            checksum = %spooled.checksum,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Upload received"
        );

        self.begin_processing(asset_id).await
    }

    /// Completion signal for a direct upload. The object must already be in storage.
    #[tracing::instrument(skip(self), fields(asset_id = %asset_id))]
    pub async fn mark_upload_complete(&self, asset_id: Uuid, owner_id: Uuid) -> Result<Asset, AppError> {
        let _guard = InFlightGuard::acquire(&self.in_flight, asset_id)?;

        let asset = self.owned_asset(asset_id, owner_id).await?;
        Self::ensure_uploading(&asset)?;

        let object = self.storage.metadata(&asset.storage_path).await?;
        let max = self.validator.max_file_size();
        if object.size > max {
            if let Err(e) = self.storage.delete(&asset.storage_path).await {
                tracing::warn!(error = %e, "Failed to remove oversized upload");
            }
            return Err(ValidationError::FileTooLarge {
                size: object.size,
                max,
            }
            .into());
        }
        self.validator.validate_file_size(object.size)?;

        self.begin_processing(asset_id).await
    }

    /// UPLOADING -> PROCESSING, then enqueue. A failed enqueue fails the asset rather
    /// than leaving it in PROCESSING with nothing scheduled.
    async fn begin_processing(&self, asset_id: Uuid) -> Result<Asset, AppError> {
        let asset = self
            .repo
            .transition(asset_id, AssetStatus::Uploading, AssetStatus::Processing)
            .await?;

        if let Err(e) = self
            .queue
            .enqueue_with_priority(MEDIA_QUEUE, &ProcessAssetPayload { asset_id }, Priority::High)
            .await
        {
            tracing::error!(error = %e, "Failed to enqueue asset processing");
            if let Err(te) = self
                .repo
                .transition(asset_id, AssetStatus::Processing, AssetStatus::Failed)
                .await
            {
                tracing::error!(error = %te, "Failed to mark asset as failed");
            }
            return Err(AppError::InternalWithSource {
                message: "Failed to enqueue asset processing".to_string(),
                source: e,
            });
        }

        tracing::info!(asset_id = %asset_id, "Asset queued for processing");
        Ok(asset)
    }

    pub async fn get_asset(&self, asset_id: Uuid, owner_id: Uuid) -> Result<Asset, AppError> {
        self.owned_asset(asset_id, owner_id).await
    }

    pub async fn list_thumbnails(
        &self,
        asset_id: Uuid,
        owner_id: Uuid,
    ) -> Result<Vec<Thumbnail>, AppError> {
        self.owned_asset(asset_id, owner_id).await?;
        self.repo.list_thumbnails(asset_id).await
    }

    /// Soft delete: ACTIVE -> TRASHED and schedule the purge after the retention period.
    ///
    /// A failure to schedule the purge is logged; [`IngestionCoordinator::recover`]
    /// schedules it again on the next start.
    #[tracing::instrument(skip(self), fields(asset_id = %asset_id))]
    pub async fn delete(&self, asset_id: Uuid, owner_id: Uuid) -> Result<Asset, AppError> {
        let asset = self.owned_asset(asset_id, owner_id).await?;
        let trashed = self
            .repo
            .transition(asset_id, asset.status, AssetStatus::Trashed)
            .await?;

        let purge_at = Utc::now() + self.settings.trash_retention;
        match self.schedule_purge(asset_id, purge_at).await {
            Ok(task_id) => {
                tracing::info!(task_id = %task_id, purge_at = %purge_at, "Asset trashed")
            }
            Err(e) => tracing::warn!(error = %e, "Failed to schedule purge of trashed asset"),
        }

        Ok(trashed)
    }

    /// TRASHED -> ACTIVE. A purge scheduled earlier finds the asset active and skips it.
    #[tracing::instrument(skip(self), fields(asset_id = %asset_id))]
    pub async fn restore(&self, asset_id: Uuid, owner_id: Uuid) -> Result<Asset, AppError> {
        self.owned_asset(asset_id, owner_id).await?;
        let restored = self
            .repo
            .transition(asset_id, AssetStatus::Trashed, AssetStatus::Active)
            .await?;
        tracing::info!("Asset restored");
        Ok(restored)
    }

    /// Remove the asset record and its objects now.
    ///
    /// Object cleanup is best-effort and reported; the record is removed regardless.
    /// Rejected while the asset is PROCESSING or its upload is being completed.
    #[tracing::instrument(skip(self), fields(asset_id = %asset_id))]
    pub async fn hard_delete(&self, asset_id: Uuid, owner_id: Uuid) -> Result<CleanupReport, AppError> {
        let _guard = InFlightGuard::acquire(&self.in_flight, asset_id)?;

        let asset = self.owned_asset(asset_id, owner_id).await?;
        if asset.status == AssetStatus::Processing {
            return Err(AppError::Conflict(format!(
                "asset {} is still processing",
                asset_id
            )));
        }

        let cleanup = remove_asset(self.repo.as_ref(), self.storage.as_ref(), &asset).await?;

        if cleanup.is_clean() {
            tracing::info!(removed = cleanup.removed, "Asset hard-deleted");
        } else {
            tracing::warn!(
                removed = cleanup.removed,
                failed = cleanup.failed.len(),
                "Asset hard-deleted with leftover objects"
            );
        }
        Ok(cleanup)
    }

    /// Serve an original or one of its thumbnails.
    ///
    /// Presign-capable backends get a redirect; the others stream through this process.
    /// A thumbnail kind that was never generated is `NotFound`.
    #[tracing::instrument(skip(self), fields(asset_id = %asset_id))]
    pub async fn download_asset(
        &self,
        asset_id: Uuid,
        owner_id: Uuid,
        kind: Option<ThumbnailKind>,
    ) -> Result<AssetDownload, AppError> {
        let asset = self.owned_asset(asset_id, owner_id).await?;
        if asset.status == AssetStatus::Uploading {
            return Err(AppError::Conflict(format!(
                "asset {} has not finished uploading",
                asset_id
            )));
        }

        let (path, content_type, cache_control) = match kind {
            Some(kind) => {
                let thumbnail = self
                    .repo
                    .get_thumbnail(asset_id, kind)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("{} thumbnail of asset {}", kind, asset_id))
                    })?;
                (
                    thumbnail.storage_path,
                    thumbnail.content_type,
                    THUMBNAIL_CACHE_CONTROL,
                )
            }
            None => (
                asset.storage_path.clone(),
                original_content_type(&asset),
                ORIGINAL_CACHE_CONTROL,
            ),
        };

        if self.storage.supports_presigned_urls() {
            let presigned = self
                .storage
                .presigned_download_url(&path, self.settings.presign_ttl)
                .await?;
            return Ok(AssetDownload::Redirect {
                url: presigned.url,
                expires_at: presigned.expires_at,
                content_type,
                cache_control,
            });
        }

        let size = self.storage.size(&path).await.ok();
        let stream = self.storage.download(&path).await?;
        Ok(AssetDownload::Stream {
            stream,
            content_type,
            size,
            cache_control,
        })
    }

    /// Queue a reconciliation of the owner's storage prefix against their records.
    pub async fn schedule_orphan_sweep(&self, owner_id: Uuid) -> Result<Uuid, AppError> {
        self.queue
            .enqueue_with_priority(
                MAINTENANCE_QUEUE,
                &SweepOrphansPayload { owner_id },
                Priority::Low,
            )
            .await
            .map_err(AppError::from)
    }

    /// Rebuild the queue work lost with the previous process.
    ///
    /// The work queue lives in memory, so a restart drops pending processing tasks and
    /// every scheduled purge. This requeues PROCESSING assets, schedules a purge for each
    /// TRASHED asset at the end of its retention (immediately if already past) and reaps
    /// stale uploads. Run once after the queue has started.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, AppError> {
        let mut report = RecoveryReport::default();

        for asset in self.repo.list_by_status(AssetStatus::Processing).await? {
            match self
                .queue
                .enqueue_with_priority(
                    MEDIA_QUEUE,
                    &ProcessAssetPayload { asset_id: asset.id },
                    Priority::High,
                )
                .await
            {
                Ok(_) => report.processing_requeued += 1,
                Err(e) => {
                    tracing::error!(asset_id = %asset.id, error = %e, "Failed to requeue asset processing");
                    report.errors += 1;
                }
            }
        }

        let now = Utc::now();
        for asset in self.repo.list_by_status(AssetStatus::Trashed).await? {
            let trashed_at = asset.deleted_at.unwrap_or(asset.updated_at);
            let purge_at = (trashed_at + self.settings.trash_retention).max(now);
            match self.schedule_purge(asset.id, purge_at).await {
                Ok(_) => report.purges_scheduled += 1,
                Err(e) => {
                    tracing::error!(asset_id = %asset.id, error = %e, "Failed to reschedule purge");
                    report.errors += 1;
                }
            }
        }

        report.uploads_reaped = self.reap_stale_uploads().await?;

        tracing::info!(
            processing_requeued = report.processing_requeued,
            purges_scheduled = report.purges_scheduled,
            uploads_reaped = report.uploads_reaped,
            errors = report.errors,
            "Recovery pass finished"
        );
        Ok(report)
    }

    /// Remove assets left in UPLOADING longer than the stale-upload age, along with any
    /// bytes a direct upload already wrote. Uploads being completed right now are skipped.
    pub async fn reap_stale_uploads(&self) -> Result<usize, AppError> {
        let cutoff = Utc::now() - self.settings.stale_upload_after;
        let mut reaped = 0;
        for asset in self.repo.list_by_status(AssetStatus::Uploading).await? {
            if asset.created_at > cutoff {
                continue;
            }
            let Ok(_guard) = InFlightGuard::acquire(&self.in_flight, asset.id) else {
                continue;
            };
            match remove_asset(self.repo.as_ref(), self.storage.as_ref(), &asset).await {
                Ok(cleanup) => {
                    tracing::info!(asset_id = %asset.id, removed = cleanup.removed, "Stale upload reaped");
                    reaped += 1;
                }
                Err(e) => tracing::warn!(asset_id = %asset.id, error = %e, "Failed to reap stale upload"),
            }
        }
        Ok(reaped)
    }

    /// Reap stale uploads every `period` until the returned handle is aborted.
    pub fn start_upload_reaper(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut reap_interval = tokio::time::interval(period);
            // The first tick fires immediately and `recover` has just reaped.
            reap_interval.tick().await;

            loop {
                reap_interval.tick().await;
                match self.reap_stale_uploads().await {
                    Ok(reaped) => tracing::debug!(reaped, "Stale upload reap finished"),
                    Err(e) => tracing::error!(error = %e, "Stale upload reap failed"),
                }
            }
        })
    }

    async fn schedule_purge(&self, asset_id: Uuid, purge_at: DateTime<Utc>) -> anyhow::Result<Uuid> {
        self.queue
            .schedule(
                MAINTENANCE_QUEUE,
                &PurgeTrashedAssetPayload { asset_id },
                Priority::Low,
                purge_at,
            )
            .await
    }

    async fn owned_asset(&self, asset_id: Uuid, owner_id: Uuid) -> Result<Asset, AppError> {
        match self.repo.get(asset_id).await? {
            Some(asset) if asset.is_owned_by(owner_id) => Ok(asset),
            _ => Err(AppError::NotFound(format!("asset {}", asset_id))),
        }
    }

    fn ensure_uploading(asset: &Asset) -> Result<(), AppError> {
        if asset.status != AssetStatus::Uploading {
            return Err(AppError::Conflict(format!(
                "asset {} is {}, upload already completed",
                asset.id, asset.status
            )));
        }
        Ok(())
    }
}
