//! Storage abstraction trait
//!
//! This module defines the Storage trait that all storage backends implement.

use crate::StorageBackend;
use aperture_core::AppError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    /// The object does not exist. Callers treat this as already-clean on delete.
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// The backend lacks the requested capability (e.g. presigned URLs).
    #[error("Operation not supported by {backend} backend: {operation}")]
    Unsupported {
        backend: StorageBackend,
        operation: &'static str,
    },

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => AppError::NotFound(format!("object {}", key)),
            StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
            StorageError::Unsupported { .. } => AppError::Unsupported(err.to_string()),
            other => AppError::Storage(other.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Streamed object content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Upload source
pub type ByteReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Descriptor of a stored object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredObject {
    pub path: String,
    pub size: u64,
    pub content_type: String,
    /// ETag or backend hash, when the backend reports one
    pub checksum: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Time-limited URL a client can upload to directly
#[derive(Debug, Clone, Serialize)]
pub struct PresignedUpload {
    pub url: String,
    pub method: String,
    /// Headers the client must send with the request
    pub headers: HashMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresignedDownload {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Storage abstraction trait
///
/// Implementations are shared across requests and background tasks, so every method
/// takes `&self` and must be safe to call concurrently.
///
/// Callers branch on [`Storage::supports_presigned_urls`] instead of treating
/// [`StorageError::Unsupported`] as a normal path.
#[async_trait]
pub trait Storage: Send + Sync {
    fn backend_type(&self) -> StorageBackend;

    /// Write `reader` to `path`, creating intermediate directories or prefixes.
    ///
    /// `size` is `None` when the length is unknown; the reader is consumed until EOF.
    /// Returns the number of bytes written.
    async fn upload(
        &self,
        path: &str,
        reader: ByteReader,
        size: Option<u64>,
        content_type: &str,
    ) -> StorageResult<u64>;

    /// Convenience for small in-memory payloads such as generated thumbnails.
    async fn upload_bytes(&self, path: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        let size = data.len() as u64;
        let reader: ByteReader = Box::pin(std::io::Cursor::new(data));
        self.upload(path, reader, Some(size), content_type).await?;
        Ok(())
    }

    async fn download(&self, path: &str) -> StorageResult<ByteStream>;

    /// Remove the object. A missing object yields [`StorageError::NotFound`].
    async fn delete(&self, path: &str) -> StorageResult<()>;

    async fn exists(&self, path: &str) -> StorageResult<bool>;

    async fn size(&self, path: &str) -> StorageResult<u64> {
        Ok(self.metadata(path).await?.size)
    }

    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()>;

    /// Move an object. Backends without an atomic rename copy then delete.
    async fn rename(&self, src: &str, dst: &str) -> StorageResult<()> {
        self.copy(src, dst).await?;
        self.delete(src).await
    }

    /// Objects under `prefix`. Non-recursive listings only return direct children.
    async fn list(&self, prefix: &str, recursive: bool) -> StorageResult<Vec<StoredObject>>;

    async fn metadata(&self, path: &str) -> StorageResult<StoredObject>;

    fn supports_presigned_urls(&self) -> bool {
        false
    }

    async fn presigned_upload_url(
        &self,
        _path: &str,
        _content_type: &str,
        _ttl: Duration,
    ) -> StorageResult<PresignedUpload> {
        Err(StorageError::Unsupported {
            backend: self.backend_type(),
            operation: "presigned upload URL",
        })
    }

    async fn presigned_download_url(
        &self,
        _path: &str,
        _ttl: Duration,
    ) -> StorageResult<PresignedDownload> {
        Err(StorageError::Unsupported {
            backend: self.backend_type(),
            operation: "presigned download URL",
        })
    }

    fn public_url(&self, _path: &str) -> StorageResult<String> {
        Err(StorageError::Unsupported {
            backend: self.backend_type(),
            operation: "public URL",
        })
    }
}

/// Drain a download stream into memory.
pub async fn collect_stream(mut stream: ByteStream) -> StorageResult<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Expiry timestamp for a TTL starting now.
pub(crate) fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() + ttl
}
