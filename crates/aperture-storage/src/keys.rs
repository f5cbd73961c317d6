//! Shared key construction for storage backends.

use crate::traits::{StorageError, StorageResult};
use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

/// Directory under an asset's folder holding its derivatives.
pub const THUMBNAIL_DIR: &str = "thumbnails";

/// Reject keys that could escape a backend's root.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("Storage key is empty".to_string()));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(StorageError::InvalidKey(
            "Storage key contains invalid characters".to_string(),
        ));
    }
    if key.split('/').any(|segment| segment == "..") {
        return Err(StorageError::InvalidKey(
            "Storage key contains a parent directory segment".to_string(),
        ));
    }
    Ok(())
}

/// `{owner}/{yyyy}/{mm}/{dd}/{asset}/{filename}`
pub fn asset_path(owner_id: Uuid, asset_id: Uuid, filename: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}/{:04}/{:02}/{:02}/{}/{}",
        owner_id,
        at.year(),
        at.month(),
        at.day(),
        asset_id,
        filename
    )
}

/// Prefix covering every object an owner has stored.
pub fn owner_prefix(owner_id: Uuid) -> String {
    format!("{}/", owner_id)
}

/// Derivative path for `original` and `kind`; the same inputs always give the same path.
pub fn thumbnail_path(original: &str, kind: &str, extension: &str) -> String {
    let (dir, file) = match original.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, original),
    };
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    match dir {
        Some(dir) => format!("{}/{}/{}_{}.{}", dir, THUMBNAIL_DIR, stem, kind, extension),
        None => format!("{}/{}_{}.{}", THUMBNAIL_DIR, stem, kind, extension),
    }
}

/// Best-effort content type from a key's extension.
pub fn content_type_for_key(key: &str) -> &'static str {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        "avif" => "image/avif",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "m4v" => "video/x-m4v",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

/// Split a listing prefix into the directory to enumerate and the prefix to filter on.
pub(crate) fn listing_dir(prefix: &str) -> &str {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.trim_end_matches('/')
    } else {
        prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    }
}
