use crate::repository::{transition_conflict, AssetRepository};
use aperture_core::models::{
    Asset, AssetMetadata, AssetStatus, Checksum, Thumbnail, ThumbnailKind,
};
use aperture_core::AppError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    assets: HashMap<Uuid, Asset>,
    thumbnails: HashMap<(Uuid, ThumbnailKind), Thumbnail>,
}

/// Process-local repository. Every operation holds one lock, which makes each call
/// atomic with respect to the others.
#[derive(Default)]
pub struct MemoryAssetRepository {
    tables: RwLock<Tables>,
}

impl MemoryAssetRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_oldest_first(mut assets: Vec<Asset>) -> Vec<Asset> {
    assets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    assets
}

#[async_trait]
impl AssetRepository for MemoryAssetRepository {
    async fn create(&self, asset: &Asset) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        if tables.assets.contains_key(&asset.id) {
            return Err(AppError::Conflict(format!("asset {} already exists", asset.id)));
        }
        tables.assets.insert(asset.id, asset.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Asset>, AppError> {
        Ok(self.tables.read().await.assets.get(&id).cloned())
    }

    async fn update_metadata(&self, id: Uuid, metadata: &AssetMetadata) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        let asset = tables
            .assets
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("asset {}", id)))?;
        asset.metadata = metadata.clone();
        asset.updated_at = Utc::now();
        Ok(())
    }

    async fn set_integrity(
        &self,
        id: Uuid,
        checksum: Checksum,
        size_bytes: i64,
    ) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        let asset = tables
            .assets
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("asset {}", id)))?;
        asset.checksum = Some(checksum);
        asset.size_bytes = Some(size_bytes);
        asset.updated_at = Utc::now();
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: AssetStatus,
        to: AssetStatus,
    ) -> Result<Asset, AppError> {
        from.ensure_transition(to)?;

        let mut tables = self.tables.write().await;
        let asset = tables
            .assets
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("asset {}", id)))?;
        if asset.status != from {
            return Err(transition_conflict(id, asset.status, from));
        }
        asset.apply_transition(to)?;
        Ok(asset.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        tables.thumbnails.retain(|(asset_id, _), _| *asset_id != id);
        Ok(tables.assets.remove(&id).is_some())
    }

    async fn list_by_owner(
        &self,
        owner_id: Uuid,
        status: Option<AssetStatus>,
    ) -> Result<Vec<Asset>, AppError> {
        let tables = self.tables.read().await;
        let assets = tables
            .assets
            .values()
            .filter(|a| a.owner_id == owner_id)
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        Ok(sorted_oldest_first(assets))
    }

    async fn list_by_status(&self, status: AssetStatus) -> Result<Vec<Asset>, AppError> {
        let tables = self.tables.read().await;
        let assets = tables
            .assets
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect();
        Ok(sorted_oldest_first(assets))
    }

    async fn find_by_checksum(
        &self,
        owner_id: Uuid,
        checksum: &Checksum,
    ) -> Result<Vec<Asset>, AppError> {
        let tables = self.tables.read().await;
        let assets = tables
            .assets
            .values()
            .filter(|a| a.owner_id == owner_id && a.checksum.as_ref() == Some(checksum))
            .cloned()
            .collect();
        Ok(sorted_oldest_first(assets))
    }

    async fn find_by_size(&self, owner_id: Uuid, size_bytes: i64) -> Result<Vec<Asset>, AppError> {
        let tables = self.tables.read().await;
        let assets = tables
            .assets
            .values()
            .filter(|a| a.owner_id == owner_id && a.size_bytes == Some(size_bytes))
            .cloned()
            .collect();
        Ok(sorted_oldest_first(assets))
    }

    async fn referenced_paths(&self, owner_id: Uuid) -> Result<Vec<String>, AppError> {
        let tables = self.tables.read().await;
        let mut paths: Vec<String> = tables
            .assets
            .values()
            .filter(|a| a.owner_id == owner_id)
            .map(|a| a.storage_path.clone())
            .collect();
        for ((asset_id, _), thumbnail) in &tables.thumbnails {
            if tables
                .assets
                .get(asset_id)
                .is_some_and(|a| a.owner_id == owner_id)
            {
                paths.push(thumbnail.storage_path.clone());
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    async fn upsert_thumbnail(&self, thumbnail: &Thumbnail) -> Result<Thumbnail, AppError> {
        let mut tables = self.tables.write().await;
        if !tables.assets.contains_key(&thumbnail.asset_id) {
            return Err(AppError::NotFound(format!("asset {}", thumbnail.asset_id)));
        }

        let key = (thumbnail.asset_id, thumbnail.kind);
        let stored = match tables.thumbnails.get(&key) {
            // Replacing keeps the row identity
            Some(existing) => Thumbnail {
                id: existing.id,
                created_at: existing.created_at,
                ..thumbnail.clone()
            },
            None => thumbnail.clone(),
        };
        tables.thumbnails.insert(key, stored.clone());
        Ok(stored)
    }

    async fn list_thumbnails(&self, asset_id: Uuid) -> Result<Vec<Thumbnail>, AppError> {
        let tables = self.tables.read().await;
        let mut thumbnails: Vec<Thumbnail> = tables
            .thumbnails
            .iter()
            .filter(|((id, _), _)| *id == asset_id)
            .map(|(_, t)| t.clone())
            .collect();
        thumbnails.sort_by_key(|t| t.kind);
        Ok(thumbnails)
    }

    async fn get_thumbnail(
        &self,
        asset_id: Uuid,
        kind: ThumbnailKind,
    ) -> Result<Option<Thumbnail>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .thumbnails
            .get(&(asset_id, kind))
            .cloned())
    }
}
