//! Physical cleanup of asset objects
//!
//! Cleanup is best-effort everywhere: objects that are already gone count as removed,
//! other failures are logged and reported but never block record removal. Objects left
//! behind are recovered by [`AssetLifecycle::sweep_orphans`].

use aperture_core::models::{Asset, AssetStatus};
use aperture_core::AppError;
use aperture_db::AssetRepository;
use aperture_storage::{keys, Storage};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of removing a set of objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of an orphan sweep over one owner's prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub referenced: usize,
    /// Unreferenced but written within the grace window, left for a later sweep
    pub recent: usize,
    pub cleanup: CleanupReport,
}

/// Default age below which an unreferenced object is still considered in flight.
pub const DEFAULT_ORPHAN_GRACE_MINUTES: i64 = 60;

/// Delete every path, treating "not found" as success.
pub(crate) async fn remove_objects(storage: &dyn Storage, paths: &[String]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for path in paths {
        match storage.delete(path).await {
            Ok(()) => report.removed += 1,
            Err(e) if e.is_not_found() => {
                tracing::debug!(key = %path, "Object already absent during cleanup");
                report.removed += 1;
            }
            Err(e) => {
                tracing::warn!(key = %path, error = %e, "Failed to delete object during cleanup");
                report.failed.push(path.clone());
            }
        }
    }
    report
}

/// Storage paths an asset owns: its original and every recorded thumbnail.
pub(crate) async fn asset_object_paths(
    repo: &dyn AssetRepository,
    asset: &Asset,
) -> Result<Vec<String>, AppError> {
    let mut paths = vec![asset.storage_path.clone()];
    paths.extend(
        repo.list_thumbnails(asset.id)
            .await?
            .into_iter()
            .map(|t| t.storage_path),
    );
    Ok(paths)
}

/// Move `asset` to DELETED, remove its objects and drop the record.
///
/// The status change comes first so concurrent readers stop serving the asset before
/// its bytes disappear.
pub(crate) async fn remove_asset(
    repo: &dyn AssetRepository,
    storage: &dyn Storage,
    asset: &Asset,
) -> Result<CleanupReport, AppError> {
    let paths = asset_object_paths(repo, asset).await?;
    repo.transition(asset.id, asset.status, AssetStatus::Deleted)
        .await?;
    let cleanup = remove_objects(storage, &paths).await;
    repo.delete(asset.id).await?;
    Ok(cleanup)
}

/// Outcome of a purge attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PurgeOutcome {
    Purged { cleanup: CleanupReport },
    /// The asset was restored or removed before the purge ran
    Skipped { reason: String },
}

/// Deferred deletion and storage reconciliation.
#[derive(Clone)]
pub struct AssetLifecycle {
    repo: Arc<dyn AssetRepository>,
    storage: Arc<dyn Storage>,
    orphan_grace: chrono::Duration,
}

impl AssetLifecycle {
    pub fn new(repo: Arc<dyn AssetRepository>, storage: Arc<dyn Storage>) -> Self {
        Self {
            repo,
            storage,
            orphan_grace: chrono::Duration::minutes(DEFAULT_ORPHAN_GRACE_MINUTES),
        }
    }

    /// Objects modified less than `grace` ago survive the orphan sweep.
    pub fn with_orphan_grace(mut self, grace: chrono::Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    /// Permanently remove a trashed asset. Assets restored in the meantime are left alone.
    #[tracing::instrument(skip(self), fields(asset_id = %asset_id))]
    pub async fn purge(&self, asset_id: Uuid) -> Result<PurgeOutcome, AppError> {
        let Some(asset) = self.repo.get(asset_id).await? else {
            return Ok(PurgeOutcome::Skipped {
                reason: "asset no longer exists".to_string(),
            });
        };
        if asset.status != AssetStatus::Trashed {
            tracing::info!(status = %asset.status, "Asset not trashed, skipping purge");
            return Ok(PurgeOutcome::Skipped {
                reason: format!("asset is {}", asset.status),
            });
        }

        let cleanup = remove_asset(self.repo.as_ref(), self.storage.as_ref(), &asset).await?;

        tracing::info!(
            removed = cleanup.removed,
            failed = cleanup.failed.len(),
            "Trashed asset purged"
        );
        Ok(PurgeOutcome::Purged { cleanup })
    }

    /// Delete objects under an owner's prefix that no asset record references.
    ///
    /// References are read before the listing and objects younger than the grace window
    /// are skipped: the processor writes a thumbnail object before recording its row.
    #[tracing::instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn sweep_orphans(&self, owner_id: Uuid) -> Result<SweepReport, AppError> {
        let referenced: HashSet<String> = self
            .repo
            .referenced_paths(owner_id)
            .await?
            .into_iter()
            .collect();
        let cutoff = Utc::now() - self.orphan_grace;
        let objects = self
            .storage
            .list(&keys::owner_prefix(owner_id), true)
            .await?;

        let mut report = SweepReport {
            scanned: objects.len(),
            ..Default::default()
        };
        let mut orphans = Vec::new();
        for object in objects {
            if referenced.contains(&object.path) {
                report.referenced += 1;
            } else if object.modified_at.is_some_and(|m| m > cutoff) {
                report.recent += 1;
            } else {
                orphans.push(object.path);
            }
        }

        report.cleanup = remove_objects(self.storage.as_ref(), &orphans).await;

        tracing::info!(
            scanned = report.scanned,
            recent = report.recent,
            removed = report.cleanup.removed,
            failed = report.cleanup.failed.len(),
            "Orphan sweep finished"
        );
        Ok(report)
    }
}
