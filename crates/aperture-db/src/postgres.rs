//! PostgreSQL repository for the `assets` and `thumbnails` tables.

use crate::repository::{transition_conflict, AssetRepository};
use aperture_core::models::{
    Asset, AssetMetadata, AssetStatus, AssetType, Checksum, Thumbnail, ThumbnailKind,
    CHECKSUM_LEN,
};
use aperture_core::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use std::str::FromStr;
use uuid::Uuid;

const ASSET_COLUMNS: &str = "id, owner_id, asset_type, status, storage_path, original_filename, \
     content_type, checksum, size_bytes, declared_checksum, metadata, created_at, updated_at, \
     deleted_at";

const THUMBNAIL_COLUMNS: &str =
    "id, asset_id, kind, storage_path, content_type, width, height, size_bytes, created_at";

#[derive(Debug, sqlx::FromRow)]
struct AssetRow {
    id: Uuid,
    owner_id: Uuid,
    asset_type: String,
    status: String,
    storage_path: String,
    original_filename: String,
    content_type: String,
    checksum: Option<Vec<u8>>,
    size_bytes: Option<i64>,
    declared_checksum: Option<Vec<u8>>,
    metadata: Json<AssetMetadata>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

fn checksum_from_column(bytes: Option<Vec<u8>>) -> Result<Option<Checksum>, AppError> {
    bytes
        .map(|b| {
            let array: [u8; CHECKSUM_LEN] = b.try_into().map_err(|b: Vec<u8>| {
                AppError::Internal(format!("stored checksum has {} bytes", b.len()))
            })?;
            Ok(Checksum::from_bytes(array))
        })
        .transpose()
}

impl AssetRow {
    fn to_asset(self) -> Result<Asset, AppError> {
        Ok(Asset {
            id: self.id,
            owner_id: self.owner_id,
            asset_type: AssetType::from_str(&self.asset_type)
                .map_err(|e| AppError::Internal(e.to_string()))?,
            status: AssetStatus::from_str(&self.status)
                .map_err(|e| AppError::Internal(e.to_string()))?,
            storage_path: self.storage_path,
            original_filename: self.original_filename,
            content_type: self.content_type,
            checksum: checksum_from_column(self.checksum)?,
            size_bytes: self.size_bytes,
            declared_checksum: checksum_from_column(self.declared_checksum)?,
            metadata: self.metadata.0,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ThumbnailRow {
    id: Uuid,
    asset_id: Uuid,
    kind: String,
    storage_path: String,
    content_type: String,
    width: i32,
    height: i32,
    size_bytes: i64,
    created_at: DateTime<Utc>,
}

impl ThumbnailRow {
    fn to_thumbnail(self) -> Result<Thumbnail, AppError> {
        Ok(Thumbnail {
            id: self.id,
            asset_id: self.asset_id,
            kind: ThumbnailKind::from_str(&self.kind)
                .map_err(|e| AppError::Internal(e.to_string()))?,
            storage_path: self.storage_path,
            content_type: self.content_type,
            width: self.width,
            height: self.height,
            size_bytes: self.size_bytes,
            created_at: self.created_at,
        })
    }
}

fn to_assets(rows: Vec<AssetRow>) -> Result<Vec<Asset>, AppError> {
    rows.into_iter().map(AssetRow::to_asset).collect()
}

#[derive(Clone)]
pub struct PgAssetRepository {
    pool: PgPool,
}

impl PgAssetRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssetRepository for PgAssetRepository {
    #[tracing::instrument(skip(self, asset), fields(db.table = "assets", db.record_id = %asset.id))]
    async fn create(&self, asset: &Asset) -> Result<(), AppError> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO assets (
                id, owner_id, asset_type, status, storage_path, original_filename,
                content_type, checksum, size_bytes, declared_checksum, metadata,
                created_at, updated_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(asset.id)
        .bind(asset.owner_id)
        .bind(asset.asset_type.to_string())
        .bind(asset.status.to_string())
        .bind(&asset.storage_path)
        .bind(&asset.original_filename)
        .bind(&asset.content_type)
        .bind(asset.checksum.map(|c| c.as_bytes().to_vec()))
        .bind(asset.size_bytes)
        .bind(asset.declared_checksum.map(|c| c.as_bytes().to_vec()))
        .bind(Json(&asset.metadata))
        .bind(asset.created_at)
        .bind(asset.updated_at)
        .bind(asset.deleted_at)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(_) => Ok(()),
            None => Err(AppError::Conflict(format!("asset {} already exists", asset.id))),
        }
    }

    #[tracing::instrument(skip(self), fields(db.table = "assets", db.record_id = %id))]
    async fn get(&self, id: Uuid) -> Result<Option<Asset>, AppError> {
        let row: Option<AssetRow> = sqlx::query_as::<Postgres, AssetRow>(&format!(
            "SELECT {} FROM assets WHERE id = $1",
            ASSET_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AssetRow::to_asset).transpose()
    }

    #[tracing::instrument(skip(self, metadata), fields(db.table = "assets", db.record_id = %id))]
    async fn update_metadata(&self, id: Uuid, metadata: &AssetMetadata) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE assets SET metadata = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(Json(metadata))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("asset {}", id)));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, checksum), fields(db.table = "assets", db.record_id = %id))]
    async fn set_integrity(
        &self,
        id: Uuid,
        checksum: Checksum,
        size_bytes: i64,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE assets SET checksum = $2, size_bytes = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(checksum.as_bytes().to_vec())
        .bind(size_bytes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("asset {}", id)));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "assets", db.record_id = %id, from = %from, to = %to))]
    async fn transition(
        &self,
        id: Uuid,
        from: AssetStatus,
        to: AssetStatus,
    ) -> Result<Asset, AppError> {
        from.ensure_transition(to)?;

        let row: Option<AssetRow> = sqlx::query_as::<Postgres, AssetRow>(&format!(
            r#"
            UPDATE assets
            SET status = $3,
                updated_at = NOW(),
                deleted_at = CASE
                    WHEN $3 IN ('trashed', 'deleted') THEN NOW()
                    WHEN $3 = 'active' THEN NULL
                    ELSE deleted_at
                END
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            ASSET_COLUMNS
        ))
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row.to_asset();
        }

        let current: Option<(String,)> = sqlx::query_as("SELECT status FROM assets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match current {
            None => Err(AppError::NotFound(format!("asset {}", id))),
            Some((status,)) => {
                let actual = AssetStatus::from_str(&status)
                    .map_err(|e| AppError::Internal(e.to_string()))?;
                Err(transition_conflict(id, actual, from))
            }
        }
    }

    #[tracing::instrument(skip(self), fields(db.table = "assets", db.record_id = %id))]
    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM thumbnails WHERE asset_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM assets WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.table = "assets"))]
    async fn list_by_owner(
        &self,
        owner_id: Uuid,
        status: Option<AssetStatus>,
    ) -> Result<Vec<Asset>, AppError> {
        let rows: Vec<AssetRow> = sqlx::query_as::<Postgres, AssetRow>(&format!(
            r#"
            SELECT {}
            FROM assets
            WHERE owner_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at ASC, id ASC
            "#,
            ASSET_COLUMNS
        ))
        .bind(owner_id)
        .bind(status.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await?;
        to_assets(rows)
    }

    #[tracing::instrument(skip(self), fields(db.table = "assets"))]
    async fn list_by_status(&self, status: AssetStatus) -> Result<Vec<Asset>, AppError> {
        let rows: Vec<AssetRow> = sqlx::query_as::<Postgres, AssetRow>(&format!(
            "SELECT {} FROM assets WHERE status = $1 ORDER BY created_at ASC, id ASC",
            ASSET_COLUMNS
        ))
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;
        to_assets(rows)
    }

    #[tracing::instrument(skip(self, checksum), fields(db.table = "assets"))]
    async fn find_by_checksum(
        &self,
        owner_id: Uuid,
        checksum: &Checksum,
    ) -> Result<Vec<Asset>, AppError> {
        let rows: Vec<AssetRow> = sqlx::query_as::<Postgres, AssetRow>(&format!(
            "SELECT {} FROM assets WHERE owner_id = $1 AND checksum = $2 ORDER BY created_at ASC, id ASC",
            ASSET_COLUMNS
        ))
        .bind(owner_id)
        .bind(checksum.as_bytes().to_vec())
        .fetch_all(&self.pool)
        .await?;
        to_assets(rows)
    }

    #[tracing::instrument(skip(self), fields(db.table = "assets"))]
    async fn find_by_size(&self, owner_id: Uuid, size_bytes: i64) -> Result<Vec<Asset>, AppError> {
        let rows: Vec<AssetRow> = sqlx::query_as::<Postgres, AssetRow>(&format!(
            "SELECT {} FROM assets WHERE owner_id = $1 AND size_bytes = $2 ORDER BY created_at ASC, id ASC",
            ASSET_COLUMNS
        ))
        .bind(owner_id)
        .bind(size_bytes)
        .fetch_all(&self.pool)
        .await?;
        to_assets(rows)
    }

    #[tracing::instrument(skip(self), fields(db.table = "assets"))]
    async fn referenced_paths(&self, owner_id: Uuid) -> Result<Vec<String>, AppError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT storage_path FROM assets WHERE owner_id = $1
            UNION
            SELECT t.storage_path
            FROM thumbnails t
            JOIN assets a ON a.id = t.asset_id
            WHERE a.owner_id = $1
            ORDER BY 1
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    #[tracing::instrument(skip(self, thumbnail), fields(db.table = "thumbnails", db.record_id = %thumbnail.asset_id, kind = %thumbnail.kind))]
    async fn upsert_thumbnail(&self, thumbnail: &Thumbnail) -> Result<Thumbnail, AppError> {
        let row: ThumbnailRow = sqlx::query_as::<Postgres, ThumbnailRow>(&format!(
            r#"
            INSERT INTO thumbnails (
                id, asset_id, kind, storage_path, content_type, width, height, size_bytes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (asset_id, kind) DO UPDATE SET
                storage_path = EXCLUDED.storage_path,
                content_type = EXCLUDED.content_type,
                width = EXCLUDED.width,
                height = EXCLUDED.height,
                size_bytes = EXCLUDED.size_bytes
            RETURNING {}
            "#,
            THUMBNAIL_COLUMNS
        ))
        .bind(thumbnail.id)
        .bind(thumbnail.asset_id)
        .bind(thumbnail.kind.as_str())
        .bind(&thumbnail.storage_path)
        .bind(&thumbnail.content_type)
        .bind(thumbnail.width)
        .bind(thumbnail.height)
        .bind(thumbnail.size_bytes)
        .bind(thumbnail.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                AppError::NotFound(format!("asset {}", thumbnail.asset_id))
            }
            _ => AppError::from(e),
        })?;
        row.to_thumbnail()
    }

    #[tracing::instrument(skip(self), fields(db.table = "thumbnails", db.record_id = %asset_id))]
    async fn list_thumbnails(&self, asset_id: Uuid) -> Result<Vec<Thumbnail>, AppError> {
        let rows: Vec<ThumbnailRow> = sqlx::query_as::<Postgres, ThumbnailRow>(&format!(
            r#"
            SELECT {}
            FROM thumbnails
            WHERE asset_id = $1
            ORDER BY CASE kind WHEN 'preview' THEN 0 WHEN 'small' THEN 1 ELSE 2 END
            "#,
            THUMBNAIL_COLUMNS
        ))
        .bind(asset_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ThumbnailRow::to_thumbnail).collect()
    }

    #[tracing::instrument(skip(self), fields(db.table = "thumbnails", db.record_id = %asset_id, kind = %kind))]
    async fn get_thumbnail(
        &self,
        asset_id: Uuid,
        kind: ThumbnailKind,
    ) -> Result<Option<Thumbnail>, AppError> {
        let row: Option<ThumbnailRow> = sqlx::query_as::<Postgres, ThumbnailRow>(&format!(
            "SELECT {} FROM thumbnails WHERE asset_id = $1 AND kind = $2",
            THUMBNAIL_COLUMNS
        ))
        .bind(asset_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ThumbnailRow::to_thumbnail).transpose()
    }
}
