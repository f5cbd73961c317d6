use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use super::checksum::Checksum;
use crate::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Image,
    Video,
    Audio,
    Other,
}

impl AssetType {
    /// Classify from a MIME type's top-level type.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let top = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .split('/')
            .next()
            .unwrap_or("")
            .to_lowercase();
        match top.as_str() {
            "image" => Some(AssetType::Image),
            "video" => Some(AssetType::Video),
            "audio" => Some(AssetType::Audio),
            _ => None,
        }
    }

    pub fn from_extension(filename: &str) -> Option<Self> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())?;
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "tif" | "tiff" | "heic"
            | "heif" | "avif" => Some(AssetType::Image),
            "mp4" | "mov" | "m4v" | "avi" | "mkv" | "webm" | "3gp" | "mts" => {
                Some(AssetType::Video)
            }
            "mp3" | "wav" | "flac" | "aac" | "m4a" | "ogg" | "opus" => Some(AssetType::Audio),
            _ => None,
        }
    }

    /// Declared content type wins; the filename extension is the fallback.
    pub fn classify(content_type: &str, filename: &str) -> Self {
        Self::from_content_type(content_type)
            .or_else(|| Self::from_extension(filename))
            .unwrap_or(AssetType::Other)
    }

    /// Content type advertised for downloads when the stored one is unusable.
    pub fn default_content_type(&self) -> &'static str {
        match self {
            AssetType::Image => "image/jpeg",
            AssetType::Video => "video/mp4",
            AssetType::Audio => "audio/mpeg",
            AssetType::Other => "application/octet-stream",
        }
    }
}

impl Display for AssetType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AssetType::Image => write!(f, "image"),
            AssetType::Video => write!(f, "video"),
            AssetType::Audio => write!(f, "audio"),
            AssetType::Other => write!(f, "other"),
        }
    }
}

impl FromStr for AssetType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(AssetType::Image),
            "video" => Ok(AssetType::Video),
            "audio" => Ok(AssetType::Audio),
            "other" => Ok(AssetType::Other),
            _ => Err(anyhow::anyhow!("Invalid asset type: {}", s)),
        }
    }
}

/// Asset lifecycle
///
/// ```text
/// UPLOADING -> PROCESSING -> ACTIVE | FAILED
/// ACTIVE <-> TRASHED
/// ACTIVE | TRASHED | FAILED | UPLOADING -> DELETED
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Uploading,
    Processing,
    Active,
    Failed,
    Trashed,
    Deleted,
}

impl AssetStatus {
    pub fn can_transition_to(self, next: AssetStatus) -> bool {
        use AssetStatus::*;
        matches!(
            (self, next),
            (Uploading, Processing)
                | (Uploading, Deleted)
                | (Processing, Active)
                | (Processing, Failed)
                | (Active, Trashed)
                | (Active, Deleted)
                | (Trashed, Active)
                | (Trashed, Deleted)
                | (Failed, Deleted)
        )
    }

    pub fn ensure_transition(self, next: AssetStatus) -> Result<(), AppError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(AppError::Conflict(format!(
                "asset cannot move from {} to {}",
                self, next
            )))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AssetStatus::Deleted)
    }
}

impl Display for AssetStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AssetStatus::Uploading => write!(f, "uploading"),
            AssetStatus::Processing => write!(f, "processing"),
            AssetStatus::Active => write!(f, "active"),
            AssetStatus::Failed => write!(f, "failed"),
            AssetStatus::Trashed => write!(f, "trashed"),
            AssetStatus::Deleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for AssetStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(AssetStatus::Uploading),
            "processing" => Ok(AssetStatus::Processing),
            "active" => Ok(AssetStatus::Active),
            "failed" => Ok(AssetStatus::Failed),
            "trashed" => Ok(AssetStatus::Trashed),
            "deleted" => Ok(AssetStatus::Deleted),
            _ => Err(anyhow::anyhow!("Invalid asset status: {}", s)),
        }
    }
}

/// Metadata derived from the asset's content. Every field is optional; partial
/// metadata is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_make: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lens_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f_number: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focal_length: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AssetMetadata {
    pub fn is_empty(&self) -> bool {
        *self == AssetMetadata::default()
    }

    /// Fill fields that are still empty from `other`.
    pub fn merge_missing(&mut self, other: AssetMetadata) {
        macro_rules! fill {
            ($($field:ident),*) => {
                $(if self.$field.is_none() { self.$field = other.$field; })*
            };
        }
        fill!(
            captured_at,
            width,
            height,
            duration_secs,
            camera_make,
            camera_model,
            lens_model,
            f_number,
            focal_length,
            iso,
            exposure_time,
            latitude,
            longitude,
            description
        );
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub asset_type: AssetType,
    pub status: AssetStatus,
    pub storage_path: String,
    pub original_filename: String,
    pub content_type: String,
    /// Set at or before the ACTIVE transition.
    pub checksum: Option<Checksum>,
    pub size_bytes: Option<i64>,
    /// Checksum the client declared at initiation, verified once bytes are read.
    pub declared_checksum: Option<Checksum>,
    pub metadata: AssetMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Asset {
    #[allow(clippy::too_many_arguments)]
    pub fn new_uploading(
        id: Uuid,
        owner_id: Uuid,
        asset_type: AssetType,
        storage_path: String,
        original_filename: String,
        content_type: String,
        declared_size: Option<i64>,
        declared_checksum: Option<Checksum>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            asset_type,
            status: AssetStatus::Uploading,
            storage_path,
            original_filename,
            content_type,
            checksum: None,
            size_bytes: declared_size,
            declared_checksum,
            metadata: AssetMetadata::default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_owned_by(&self, owner_id: Uuid) -> bool {
        self.owner_id == owner_id
    }

    /// Apply a legal status change in place, stamping `updated_at` and `deleted_at`.
    pub fn apply_transition(&mut self, next: AssetStatus) -> Result<(), AppError> {
        self.status.ensure_transition(next)?;
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        match next {
            AssetStatus::Trashed | AssetStatus::Deleted => self.deleted_at = Some(now),
            AssetStatus::Active => self.deleted_at = None,
            _ => {}
        }
        Ok(())
    }
}
