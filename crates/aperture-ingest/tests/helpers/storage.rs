//! In-memory storage double that supports presigned URLs.

use aperture_core::StorageBackend;
use aperture_storage::{
    keys, ByteReader, ByteStream, PresignedDownload, PresignedUpload, Storage, StorageError,
    StorageResult, StoredObject,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;

#[derive(Clone, Default)]
pub struct MockStorage {
    objects: Arc<Mutex<HashMap<String, (Bytes, String)>>>,
    fail_deletes: Arc<AtomicBool>,
    hang_downloads: Arc<AtomicBool>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// What a client does with a presigned upload URL.
    pub fn put_object(&self, path: &str, data: impl Into<Bytes>, content_type: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), (data.into(), content_type.to_string()));
    }

    pub fn remove_object(&self, path: &str) {
        self.objects.lock().unwrap().remove(path);
    }

    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(path).map(|(b, _)| b.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Downloads return a stream that never yields, like a stalled backend.
    pub fn hang_downloads(&self, hang: bool) {
        self.hang_downloads.store(hang, Ordering::SeqCst);
    }

    fn describe(path: &str, data: &Bytes, content_type: &str) -> StoredObject {
        StoredObject {
            path: path.to_string(),
            size: data.len() as u64,
            content_type: content_type.to_string(),
            checksum: None,
            modified_at: Some(Utc::now()),
        }
    }
}

#[async_trait]
impl Storage for MockStorage {
    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }

    async fn upload(
        &self,
        path: &str,
        mut reader: ByteReader,
        _size: Option<u64>,
        content_type: &str,
    ) -> StorageResult<u64> {
        keys::validate_key(path)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        let written = buf.len() as u64;
        self.put_object(path, buf, content_type);
        Ok(written)
    }

    async fn download(&self, path: &str) -> StorageResult<ByteStream> {
        if self.hang_downloads.load(Ordering::SeqCst) {
            return Ok(Box::pin(futures::stream::pending()));
        }
        let data = self
            .object(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let chunks: Vec<StorageResult<Bytes>> = data
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::DeleteFailed(format!("{}: injected failure", path)));
        }
        self.objects
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(path))
    }

    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        let (data, content_type) = self
            .objects
            .lock()
            .unwrap()
            .get(src)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
        self.put_object(dst, data, &content_type);
        Ok(())
    }

    async fn list(&self, prefix: &str, _recursive: bool) -> StorageResult<Vec<StoredObject>> {
        let objects = self.objects.lock().unwrap();
        let mut listed: Vec<StoredObject> = objects
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, (data, ct))| Self::describe(path, data, ct))
            .collect();
        listed.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listed)
    }

    async fn metadata(&self, path: &str) -> StorageResult<StoredObject> {
        let objects = self.objects.lock().unwrap();
        let (data, ct) = objects
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(Self::describe(path, data, ct))
    }

    fn supports_presigned_urls(&self) -> bool {
        true
    }

    async fn presigned_upload_url(
        &self,
        path: &str,
        content_type: &str,
        ttl: Duration,
    ) -> StorageResult<PresignedUpload> {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), content_type.to_string());
        Ok(PresignedUpload {
            url: format!("https://mock-storage.test/{}?signature=upload", path),
            method: "PUT".to_string(),
            headers,
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap(),
        })
    }

    async fn presigned_download_url(
        &self,
        path: &str,
        ttl: Duration,
    ) -> StorageResult<PresignedDownload> {
        Ok(PresignedDownload {
            url: format!("https://mock-storage.test/{}?signature=download", path),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap(),
        })
    }
}
