use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Named derivative size generated per image asset
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailKind {
    Preview,
    Small,
    Thumb,
}

impl ThumbnailKind {
    pub const ALL: [ThumbnailKind; 3] = [
        ThumbnailKind::Preview,
        ThumbnailKind::Small,
        ThumbnailKind::Thumb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailKind::Preview => "preview",
            ThumbnailKind::Small => "small",
            ThumbnailKind::Thumb => "thumb",
        }
    }
}

impl Display for ThumbnailKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThumbnailKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preview" => Ok(ThumbnailKind::Preview),
            "small" => Ok(ThumbnailKind::Small),
            "thumb" => Ok(ThumbnailKind::Thumb),
            _ => Err(anyhow::anyhow!("Invalid thumbnail kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thumbnail {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub kind: ThumbnailKind,
    pub storage_path: String,
    pub content_type: String,
    pub width: i32,
    pub height: i32,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}
