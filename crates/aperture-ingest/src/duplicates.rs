//! Byte-identical duplicate detection within one owner's library.

use aperture_core::models::{Asset, AssetStatus, Checksum};
use aperture_core::AppError;
use aperture_db::AssetRepository;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Active assets of one owner sharing one checksum.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    /// Lowercase hex of the shared checksum; stable across recomputation
    pub id: String,
    pub assets: Vec<Asset>,
}

#[derive(Clone)]
pub struct DuplicateIndex {
    repo: Arc<dyn AssetRepository>,
}

impl DuplicateIndex {
    pub fn new(repo: Arc<dyn AssetRepository>) -> Self {
        Self { repo }
    }

    /// Every checksum shared by at least two of the owner's ACTIVE assets, ordered by
    /// group id.
    #[tracing::instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn duplicate_groups(&self, owner_id: Uuid) -> Result<Vec<DuplicateGroup>, AppError> {
        // Scoped to the owner before grouping, so equal bytes across owners never meet
        let assets = self
            .repo
            .list_by_owner(owner_id, Some(AssetStatus::Active))
            .await?;

        let mut by_checksum: BTreeMap<Checksum, Vec<Asset>> = BTreeMap::new();
        for asset in assets {
            if let Some(checksum) = asset.checksum {
                by_checksum.entry(checksum).or_default().push(asset);
            }
        }

        let groups: Vec<DuplicateGroup> = by_checksum
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .map(|(checksum, assets)| DuplicateGroup {
                id: checksum.to_hex(),
                assets,
            })
            .collect();

        tracing::debug!(groups = groups.len(), "Duplicate groups computed");
        Ok(groups)
    }

    /// Owner's assets with the given hex checksum. Malformed hex is `InvalidInput`.
    pub async fn find_by_checksum(
        &self,
        owner_id: Uuid,
        checksum_hex: &str,
    ) -> Result<Vec<Asset>, AppError> {
        let checksum = Checksum::from_hex(checksum_hex.trim())?;
        self.repo.find_by_checksum(owner_id, &checksum).await
    }

    /// Owner's assets of exactly `size_bytes`. Equal size alone does not prove duplication.
    pub async fn find_by_size(&self, owner_id: Uuid, size_bytes: i64) -> Result<Vec<Asset>, AppError> {
        if size_bytes < 0 {
            return Err(AppError::InvalidInput(format!(
                "size must not be negative: {}",
                size_bytes
            )));
        }
        self.repo.find_by_size(owner_id, size_bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_core::models::AssetType;
    use aperture_db::MemoryAssetRepository;

    async fn active_asset(repo: &MemoryAssetRepository, owner: Uuid, checksum: Checksum) -> Asset {
        let id = Uuid::new_v4();
        let asset = Asset::new_uploading(
            id,
            owner,
            AssetType::Image,
            format!("{}/2024/05/01/{}/p.jpg", owner, id),
            "p.jpg".to_string(),
            "image/jpeg".to_string(),
            None,
            None,
        );
        repo.create(&asset).await.unwrap();
        repo.set_integrity(id, checksum, 1024).await.unwrap();
        repo.transition(id, AssetStatus::Uploading, AssetStatus::Processing)
            .await
            .unwrap();
        repo.transition(id, AssetStatus::Processing, AssetStatus::Active)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn groups_only_shared_checksums() {
        let repo = Arc::new(MemoryAssetRepository::new());
        let index = DuplicateIndex::new(repo.clone());
        let owner = Uuid::new_v4();
        let shared = Checksum::from_bytes([0xab; 32]);

        let first = active_asset(&repo, owner, shared).await;
        active_asset(&repo, owner, Checksum::from_bytes([0x01; 32])).await;
        assert!(index.duplicate_groups(owner).await.unwrap().is_empty());

        let second = active_asset(&repo, owner, shared).await;
        let groups = index.duplicate_groups(owner).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, shared.to_hex());
        let ids: Vec<Uuid> = groups[0].assets.iter().map(|a| a.id).collect();
        assert!(ids.contains(&first.id) && ids.contains(&second.id));
    }

    #[tokio::test]
    async fn never_groups_across_owners() {
        let repo = Arc::new(MemoryAssetRepository::new());
        let index = DuplicateIndex::new(repo.clone());
        let shared = Checksum::from_bytes([0xcd; 32]);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        active_asset(&repo, alice, shared).await;
        active_asset(&repo, bob, shared).await;

        assert!(index.duplicate_groups(alice).await.unwrap().is_empty());
        assert!(index.duplicate_groups(bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trashed_assets_leave_their_group() {
        let repo = Arc::new(MemoryAssetRepository::new());
        let index = DuplicateIndex::new(repo.clone());
        let owner = Uuid::new_v4();
        let shared = Checksum::from_bytes([0x42; 32]);

        active_asset(&repo, owner, shared).await;
        let second = active_asset(&repo, owner, shared).await;
        repo.transition(second.id, AssetStatus::Active, AssetStatus::Trashed)
            .await
            .unwrap();

        assert!(index.duplicate_groups(owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn point_lookups_validate_input() {
        let repo = Arc::new(MemoryAssetRepository::new());
        let index = DuplicateIndex::new(repo.clone());
        let owner = Uuid::new_v4();
        let checksum = Checksum::from_bytes([0x10; 32]);
        active_asset(&repo, owner, checksum).await;

        let found = index
            .find_by_checksum(owner, &checksum.to_hex().to_uppercase())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(index.find_by_size(owner, 1024).await.unwrap().len(), 1);

        assert!(matches!(
            index.find_by_checksum(owner, "not-hex").await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            index.find_by_checksum(owner, "abc123").await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            index.find_by_size(owner, -1).await,
            Err(AppError::InvalidInput(_))
        ));
    }
}
