use aperture_core::models::{
    Asset, AssetMetadata, AssetStatus, Checksum, Thumbnail, ThumbnailKind,
};
use aperture_core::AppError;
use async_trait::async_trait;
use uuid::Uuid;

/// Row-level access to assets and their thumbnails.
///
/// Implementations give per-row consistency. Status changes go through
/// [`AssetRepository::transition`], a compare-and-set on the current status, so two
/// writers racing on one asset cannot both advance it.
#[async_trait]
pub trait AssetRepository: Send + Sync {
    /// Insert a new asset. Fails with `Conflict` if the id is taken.
    async fn create(&self, asset: &Asset) -> Result<(), AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<Asset>, AppError>;

    /// Replace the derived metadata.
    async fn update_metadata(&self, id: Uuid, metadata: &AssetMetadata) -> Result<(), AppError>;

    /// Record the computed checksum and byte size.
    async fn set_integrity(&self, id: Uuid, checksum: Checksum, size_bytes: i64)
        -> Result<(), AppError>;

    /// Move `id` from `from` to `to` if, and only if, it is currently in `from`.
    ///
    /// Returns the updated asset. `NotFound` if the asset is missing, `Conflict` if its
    /// status is not `from` or the transition is not allowed.
    async fn transition(
        &self,
        id: Uuid,
        from: AssetStatus,
        to: AssetStatus,
    ) -> Result<Asset, AppError>;

    /// Remove the asset row together with its thumbnail rows. Returns whether a row existed.
    async fn delete(&self, id: Uuid) -> Result<bool, AppError>;

    /// Assets of one owner, optionally restricted to one status, oldest first.
    async fn list_by_owner(
        &self,
        owner_id: Uuid,
        status: Option<AssetStatus>,
    ) -> Result<Vec<Asset>, AppError>;

    /// Assets of every owner in `status`, oldest first. Used by startup recovery.
    async fn list_by_status(&self, status: AssetStatus) -> Result<Vec<Asset>, AppError>;

    async fn find_by_checksum(
        &self,
        owner_id: Uuid,
        checksum: &Checksum,
    ) -> Result<Vec<Asset>, AppError>;

    async fn find_by_size(&self, owner_id: Uuid, size_bytes: i64) -> Result<Vec<Asset>, AppError>;

    /// Every storage path (originals and thumbnails) an owner's records point at.
    async fn referenced_paths(&self, owner_id: Uuid) -> Result<Vec<String>, AppError>;

    /// Insert or replace the thumbnail for `(asset_id, kind)`.
    async fn upsert_thumbnail(&self, thumbnail: &Thumbnail) -> Result<Thumbnail, AppError>;

    async fn list_thumbnails(&self, asset_id: Uuid) -> Result<Vec<Thumbnail>, AppError>;

    async fn get_thumbnail(
        &self,
        asset_id: Uuid,
        kind: ThumbnailKind,
    ) -> Result<Option<Thumbnail>, AppError>;
}

/// Shared outcome for a compare-and-set that matched no row.
pub(crate) fn transition_conflict(id: Uuid, actual: AssetStatus, from: AssetStatus) -> AppError {
    AppError::Conflict(format!(
        "asset {} is {}, expected {}",
        id, actual, from
    ))
}
