use crate::keys::{content_type_for_key, listing_dir, validate_key};
use crate::traits::{ByteReader, ByteStream, Storage, StorageError, StorageResult, StoredObject};
use crate::StorageBackend;
use aperture_core::LocalStorageConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Suffix of in-progress writes; never visible to readers or listings.
const PARTIAL_SUFFIX: &str = ".partial";

/// Local filesystem storage implementation
#[derive(Clone, Debug)]
pub struct LocalStorage {
    base_path: PathBuf,
    base_url: Option<String>,
    file_mode: u32,
    dir_mode: u32,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at `config.root_path`, creating the directory.
    pub async fn new(config: &LocalStorageConfig) -> StorageResult<Self> {
        let base_path = config.root_path.clone();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalStorage {
            base_path,
            base_url: config.base_url.clone(),
            file_mode: config.file_mode,
            dir_mode: config.dir_mode,
        })
    }

    /// Shorthand for a root directory with default permissions and no public URL.
    pub async fn with_root(root: impl Into<PathBuf>) -> StorageResult<Self> {
        Self::new(&LocalStorageConfig::new(root)).await
    }

    pub fn root(&self) -> &Path {
        &self.base_path
    }

    /// Convert storage key to filesystem path, refusing anything outside the root.
    fn key_to_path(&self, storage_key: &str) -> StorageResult<PathBuf> {
        validate_key(storage_key)?;

        let path = self.base_path.join(storage_key);

        let base_canonical = self.base_path.canonicalize().map_err(|e| {
            StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
        })?;

        // Symlinks inside the root may still point elsewhere.
        if let Ok(canonical) = path.canonicalize() {
            if canonical.strip_prefix(&base_canonical).is_err() {
                return Err(StorageError::InvalidKey(
                    "Storage key resolves outside storage directory".to_string(),
                ));
            }
        }

        Ok(path)
    }

    fn path_to_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
            self.apply_dir_mode(parent).await;
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn apply_dir_mode(&self, dir: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let mut current = Some(dir);
        while let Some(d) = current {
            if d == self.base_path || !d.starts_with(&self.base_path) {
                break;
            }
            if let Err(e) =
                fs::set_permissions(d, std::fs::Permissions::from_mode(self.dir_mode)).await
            {
                tracing::warn!(dir = %d.display(), error = %e, "Failed to set directory permissions");
            }
            current = d.parent();
        }
    }

    #[cfg(not(unix))]
    async fn apply_dir_mode(&self, _dir: &Path) {}

    #[cfg(unix)]
    async fn apply_file_mode(&self, path: &Path) -> StorageResult<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(self.file_mode)).await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn apply_file_mode(&self, _path: &Path) -> StorageResult<()> {
        Ok(())
    }

    fn partial_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}{}", name, Uuid::new_v4(), PARTIAL_SUFFIX))
    }

    fn stored_object(key: String, meta: &std::fs::Metadata) -> StoredObject {
        let modified_at = meta.modified().ok().map(DateTime::<Utc>::from);
        StoredObject {
            content_type: content_type_for_key(&key).to_string(),
            path: key,
            size: meta.len(),
            checksum: None,
            modified_at,
        }
    }

    fn map_not_found(err: std::io::Error, key: &str) -> StorageError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::IoError(err)
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }

    #[tracing::instrument(skip(self, reader), fields(key = %path))]
    async fn upload(
        &self,
        path: &str,
        mut reader: ByteReader,
        _size: Option<u64>,
        _content_type: &str,
    ) -> StorageResult<u64> {
        let target = self.key_to_path(path)?;
        let start = std::time::Instant::now();

        self.ensure_parent_dir(&target).await?;

        // Write beside the target and rename so readers never observe a partial object.
        let partial = Self::partial_path(&target);
        let result: StorageResult<u64> = async {
            let mut file = fs::File::create(&partial).await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to create file {}: {}",
                    partial.display(),
                    e
                ))
            })?;

            let bytes_copied = tokio::io::copy(&mut reader, &mut file).await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to write stream to file {}: {}",
                    target.display(),
                    e
                ))
            })?;

            file.flush().await?;
            file.sync_all().await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to sync file {}: {}",
                    partial.display(),
                    e
                ))
            })?;
            drop(file);

            self.apply_file_mode(&partial).await?;
            fs::rename(&partial, &target).await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to move upload into place at {}: {}",
                    target.display(),
                    e
                ))
            })?;
            Ok(bytes_copied)
        }
        .await;

        let bytes_copied = match result {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        tracing::info!(
            path = %target.display(),
            key = %path,
            size_bytes = bytes_copied,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage upload successful"
        );

        Ok(bytes_copied)
    }

    async fn download(&self, storage_key: &str) -> StorageResult<ByteStream> {
        let path = self.key_to_path(storage_key)?;
        let start = std::time::Instant::now();

        let file = fs::File::open(&path)
            .await
            .map_err(|e| Self::map_not_found(e, storage_key))?;

        let stream = tokio_util::io::ReaderStream::new(file).map(|result| {
            result.map_err(|e| StorageError::DownloadFailed(format!("Failed to read chunk: {}", e)))
        });

        let key = storage_key.to_string();
        let logged_stream = stream.map(move |item| {
            if let Err(e) = &item {
                tracing::error!(
                    key = %key,
                    error = %e,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Local storage stream download error"
                );
            }
            item
        });

        Ok(Box::pin(logged_stream))
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let path = self.key_to_path(storage_key)?;
        let start = std::time::Instant::now();

        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(storage_key.to_string())
            } else {
                StorageError::DeleteFailed(format!(
                    "Failed to delete file {}: {}",
                    path.display(),
                    e
                ))
            }
        })?;

        tracing::info!(
            path = %path.display(),
            key = %storage_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage delete successful"
        );

        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(storage_key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy(&self, from_key: &str, to_key: &str) -> StorageResult<()> {
        let from_path = self.key_to_path(from_key)?;
        let to_path = self.key_to_path(to_key)?;

        if !fs::try_exists(&from_path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(from_key.to_string()));
        }

        self.ensure_parent_dir(&to_path).await?;

        let partial = Self::partial_path(&to_path);
        if let Err(e) = fs::copy(&from_path, &partial).await {
            let _ = fs::remove_file(&partial).await;
            return Err(StorageError::BackendError(format!(
                "Failed to copy {} to {}: {}",
                from_path.display(),
                to_path.display(),
                e
            )));
        }
        self.apply_file_mode(&partial).await?;
        fs::rename(&partial, &to_path).await?;

        tracing::info!(
            from_key = %from_key,
            to_key = %to_key,
            "Local storage copy successful"
        );

        Ok(())
    }

    async fn rename(&self, from_key: &str, to_key: &str) -> StorageResult<()> {
        let from_path = self.key_to_path(from_key)?;
        let to_path = self.key_to_path(to_key)?;

        self.ensure_parent_dir(&to_path).await?;
        fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| Self::map_not_found(e, from_key))?;

        tracing::info!(from_key = %from_key, to_key = %to_key, "Local storage rename successful");
        Ok(())
    }

    async fn list(&self, prefix: &str, recursive: bool) -> StorageResult<Vec<StoredObject>> {
        let dir_key = listing_dir(prefix);
        let dir = if dir_key.is_empty() {
            self.base_path.clone()
        } else {
            self.key_to_path(dir_key)?
        };

        let mut objects = Vec::new();
        let mut pending = vec![dir];

        while let Some(current) = pending.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let entry_path = entry.path();
                if file_type.is_dir() {
                    if recursive {
                        pending.push(entry_path);
                    }
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                let Some(key) = self.path_to_key(&entry_path) else {
                    continue;
                };
                if !key.starts_with(prefix) {
                    continue;
                }
                let meta = entry.metadata().await?;
                objects.push(Self::stored_object(key, &meta));
            }
        }

        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    async fn metadata(&self, storage_key: &str) -> StorageResult<StoredObject> {
        let path = self.key_to_path(storage_key)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Self::map_not_found(e, storage_key))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(storage_key.to_string()));
        }
        Ok(Self::stored_object(storage_key.to_string(), &meta))
    }

    fn public_url(&self, storage_key: &str) -> StorageResult<String> {
        validate_key(storage_key)?;
        match &self.base_url {
            Some(base) => Ok(format!("{}/{}", base.trim_end_matches('/'), storage_key)),
            None => Err(StorageError::Unsupported {
                backend: StorageBackend::Local,
                operation: "public URL",
            }),
        }
    }
}

#[cfg(all(test, feature = "storage-local"))]
mod tests {
    use super::*;
    use crate::collect_stream;
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn storage(dir: &tempfile::TempDir) -> LocalStorage {
        LocalStorage::with_root(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn test_local_storage_upload_download() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        let data = Bytes::from_static(b"test data");
        storage
            .upload_bytes("owner/2024/01/01/a/test.txt", data.clone(), "text/plain")
            .await
            .unwrap();

        let stream = storage.download("owner/2024/01/01/a/test.txt").await.unwrap();
        assert_eq!(collect_stream(stream).await.unwrap(), data);
        assert_eq!(storage.size("owner/2024/01/01/a/test.txt").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_stream_upload_reports_bytes_written() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        let reader: ByteReader = Box::pin(std::io::Cursor::new(vec![7u8; 100_000]));
        let written = storage.upload("big.bin", reader, None, "application/octet-stream").await;
        assert_eq!(written.unwrap(), 100_000);

        let meta = storage.metadata("big.bin").await.unwrap();
        assert_eq!(meta.size, 100_000);
        assert_eq!(meta.content_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        let result = storage.download("../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.delete("../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.exists("/etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_delete_twice_reports_not_found() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        storage
            .upload_bytes("a/b.txt", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();
        storage.delete("a/b.txt").await.unwrap();

        let second = storage.delete("a/b.txt").await;
        assert!(matches!(second, Err(StorageError::NotFound(_))));
        assert!(!storage.exists("a/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        let result = storage.download("missing.jpg").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_copy_and_rename() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        let data = Bytes::from_static(b"original content");
        storage.upload_bytes("src/original.txt", data.clone(), "text/plain").await.unwrap();

        storage.copy("src/original.txt", "dst/copied.txt").await.unwrap();
        assert!(storage.exists("src/original.txt").await.unwrap());
        let copied = collect_stream(storage.download("dst/copied.txt").await.unwrap()).await;
        assert_eq!(copied.unwrap(), data);

        storage.rename("dst/copied.txt", "moved/final.txt").await.unwrap();
        assert!(!storage.exists("dst/copied.txt").await.unwrap());
        assert!(storage.exists("moved/final.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_prefix_recursive_and_flat() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        for key in ["o/a/1.jpg", "o/a/thumbnails/1_thumb.jpg", "o/b/2.jpg", "p/3.jpg"] {
            storage.upload_bytes(key, Bytes::from_static(b"x"), "image/jpeg").await.unwrap();
        }

        let all: Vec<_> = storage
            .list("o/", true)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.path)
            .collect();
        assert_eq!(all, vec!["o/a/1.jpg", "o/a/thumbnails/1_thumb.jpg", "o/b/2.jpg"]);

        let flat = storage.list("o/a/", false).await.unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].path, "o/a/1.jpg");

        assert!(storage.list("nothing/", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presign_unsupported_without_network() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        assert!(!storage.supports_presigned_urls());
        let result = storage
            .presigned_upload_url("a.jpg", "image/jpeg", Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(StorageError::Unsupported { .. })));
        assert!(matches!(
            storage.public_url("a.jpg"),
            Err(StorageError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_public_url_with_base() {
        let dir = tempdir().unwrap();
        let mut config = LocalStorageConfig::new(dir.path());
        config.base_url = Some("http://localhost:3000/media/".into());
        let storage = LocalStorage::new(&config).await.unwrap();

        assert_eq!(
            storage.public_url("o/a.jpg").unwrap(),
            "http://localhost:3000/media/o/a.jpg"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_mode_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let mut config = LocalStorageConfig::new(dir.path());
        config.file_mode = 0o600;
        let storage = LocalStorage::new(&config).await.unwrap();

        storage.upload_bytes("x/y.txt", Bytes::from_static(b"x"), "text/plain").await.unwrap();
        let meta = std::fs::metadata(dir.path().join("x/y.txt")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
