use crate::keys::{content_type_for_key, listing_dir, validate_key};
use crate::traits::{
    expiry_after, ByteReader, ByteStream, PresignedDownload, PresignedUpload, Storage,
    StorageError, StorageResult, StoredObject,
};
use crate::StorageBackend;
use aperture_core::S3StorageConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::Method;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::Error as ObjectStoreError;
use object_store::{
    Attribute, Attributes, ObjectMeta, ObjectStore, ObjectStoreExt, PutOptions, PutPayload,
    WriteMultipart,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Payloads up to this size go out as a single PUT; larger ones use multipart upload.
const MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;
const MULTIPART_CONCURRENCY: usize = 8;
const READ_CHUNK: usize = 64 * 1024;

/// S3 storage implementation
#[derive(Clone)]
pub struct S3Storage {
    store: AmazonS3,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    path_style: bool,
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// Credentials missing from `config` are picked up from the standard AWS environment.
    /// `endpoint` selects an S3-compatible provider (MinIO, R2, DigitalOcean Spaces).
    pub fn new(config: &S3StorageConfig) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(config.region.clone())
            .with_bucket_name(config.bucket.clone())
            .with_virtual_hosted_style_request(!config.path_style && config.endpoint.is_none());

        if let Some(ref endpoint) = config.endpoint {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder
                .with_access_key_id(key_id.clone())
                .with_secret_access_key(secret.clone());
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(S3Storage {
            store,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint.clone(),
            path_style: config.path_style,
        })
    }

    fn location(key: &str) -> StorageResult<Path> {
        validate_key(key)?;
        Ok(Path::from(key.to_string()))
    }

    /// Public URL for an object; only meaningful when the bucket allows anonymous reads.
    fn generate_url(&self, key: &str) -> String {
        match &self.endpoint_url {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None if self.path_style => {
                format!("https://s3.{}.amazonaws.com/{}/{}", self.region, self.bucket, key)
            }
            None => format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key),
        }
    }

    fn map_error(err: ObjectStoreError, key: &str, wrap: fn(String) -> StorageError) -> StorageError {
        match err {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.to_string()),
            other => wrap(other.to_string()),
        }
    }

    fn stored_object(meta: ObjectMeta) -> StoredObject {
        let path = meta.location.to_string();
        StoredObject {
            content_type: content_type_for_key(&path).to_string(),
            path,
            size: meta.size,
            checksum: meta.e_tag.map(|tag| tag.trim_matches('"').to_string()),
            modified_at: Some(meta.last_modified),
        }
    }

    /// Read until `limit` bytes are buffered or the reader is exhausted.
    async fn read_up_to(reader: &mut ByteReader, limit: usize) -> StorageResult<(Vec<u8>, bool)> {
        let mut buffer = Vec::with_capacity(limit.min(READ_CHUNK));
        let mut chunk = vec![0u8; READ_CHUNK];
        while buffer.len() < limit {
            let want = (limit - buffer.len()).min(READ_CHUNK);
            let n = reader.read(&mut chunk[..want]).await.map_err(|e| {
                StorageError::UploadFailed(format!("Failed to read from stream: {}", e))
            })?;
            if n == 0 {
                return Ok((buffer, true));
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
        Ok((buffer, false))
    }

    async fn upload_multipart(
        &self,
        location: &Path,
        head: Vec<u8>,
        reader: &mut ByteReader,
    ) -> StorageResult<u64> {
        let upload = self
            .store
            .put_multipart(location)
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
        let mut writer = WriteMultipart::new(upload);

        let mut total = head.len() as u64;
        writer.write(&head);

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(StorageError::UploadFailed(format!(
                        "Failed to read from stream: {}",
                        e
                    )));
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.wait_for_capacity(MULTIPART_CONCURRENCY).await {
                let _ = writer.abort().await;
                return Err(StorageError::UploadFailed(e.to_string()));
            }
            writer.write(&chunk[..n]);
            total += n as u64;
        }

        writer
            .finish()
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
        Ok(total)
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }

    #[tracing::instrument(skip(self, reader), fields(bucket = %self.bucket, key = %path))]
    async fn upload(
        &self,
        path: &str,
        mut reader: ByteReader,
        size: Option<u64>,
        content_type: &str,
    ) -> StorageResult<u64> {
        let location = Self::location(path)?;
        let start = std::time::Instant::now();

        let limit = match size {
            Some(n) if n as usize <= MULTIPART_THRESHOLD => n as usize + 1,
            _ => MULTIPART_THRESHOLD,
        };
        let (head, finished) = Self::read_up_to(&mut reader, limit).await?;

        let result = if finished {
            let written = head.len() as u64;
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
            let opts = PutOptions {
                attributes,
                ..Default::default()
            };
            self.store
                .put_opts(&location, PutPayload::from(Bytes::from(head)), opts)
                .await
                .map(|_| written)
                .map_err(|e| StorageError::UploadFailed(e.to_string()))
        } else {
            self.upload_multipart(&location, head, &mut reader).await
        };

        match result {
            Ok(written) => {
                tracing::info!(
                    bucket = %self.bucket,
                    key = %path,
                    size_bytes = written,
                    multipart = !finished,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload successful"
                );
                Ok(written)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %path,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload failed"
                );
                Err(e)
            }
        }
    }

    async fn download(&self, storage_key: &str) -> StorageResult<ByteStream> {
        let start = std::time::Instant::now();
        let location = Self::location(storage_key)?;

        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| Self::map_error(e, storage_key, StorageError::DownloadFailed))?;

        let bucket = self.bucket.clone();
        let key = storage_key.to_string();

        let stream = result.into_stream().map(move |res| match res {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                tracing::error!(
                    bucket = %bucket,
                    key = %key,
                    error = %e,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 stream download error"
                );
                Err(StorageError::DownloadFailed(e.to_string()))
            }
        });

        Ok(Box::pin(stream))
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let start = std::time::Instant::now();
        let location = Self::location(storage_key)?;

        // S3 deletes succeed for missing keys, so check first to report NotFound.
        self.store
            .head(&location)
            .await
            .map_err(|e| Self::map_error(e, storage_key, StorageError::DeleteFailed))?;

        self.store.delete(&location).await.map_err(|e| {
            tracing::error!(
                error = %e,
                bucket = %self.bucket,
                key = %storage_key,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 delete failed"
            );
            Self::map_error(e, storage_key, StorageError::DeleteFailed)
        })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %storage_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );

        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let location = Self::location(storage_key)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    async fn copy(&self, from_key: &str, to_key: &str) -> StorageResult<()> {
        let start = std::time::Instant::now();
        let from = Self::location(from_key)?;
        let to = Self::location(to_key)?;

        self.store
            .copy(&from, &to)
            .await
            .map_err(|e| Self::map_error(e, from_key, StorageError::BackendError))?;

        tracing::info!(
            from_key = %from_key,
            to_key = %to_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 copy successful"
        );

        Ok(())
    }

    async fn list(&self, prefix: &str, recursive: bool) -> StorageResult<Vec<StoredObject>> {
        let dir = listing_dir(prefix);
        let dir_path = (!dir.is_empty()).then(|| Path::from(dir.to_string()));

        let metas: Vec<ObjectMeta> = if recursive {
            self.store
                .list(dir_path.as_ref())
                .try_collect()
                .await
                .map_err(|e| StorageError::BackendError(e.to_string()))?
        } else {
            self.store
                .list_with_delimiter(dir_path.as_ref())
                .await
                .map_err(|e| StorageError::BackendError(e.to_string()))?
                .objects
        };

        let mut objects: Vec<StoredObject> = metas
            .into_iter()
            .map(Self::stored_object)
            .filter(|o| o.path.starts_with(prefix))
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    async fn metadata(&self, storage_key: &str) -> StorageResult<StoredObject> {
        let location = Self::location(storage_key)?;
        let meta = self
            .store
            .head(&location)
            .await
            .map_err(|e| Self::map_error(e, storage_key, StorageError::BackendError))?;
        Ok(Self::stored_object(meta))
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
        let location = Self::location(path)?;
        let url = self
            .store
            .signed_url(Method::PUT, &location, ttl)
            .await
            .map_err(|e| StorageError::BackendError(e.to_string()))?;

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), content_type.to_string());

        Ok(PresignedUpload {
            url: url.to_string(),
            method: Method::PUT.to_string(),
            headers,
            expires_at: expiry_after(ttl),
        })
    }

    async fn presigned_download_url(
        &self,
        path: &str,
        ttl: Duration,
    ) -> StorageResult<PresignedDownload> {
        let location = Self::location(path)?;
        let url = self
            .store
            .signed_url(Method::GET, &location, ttl)
            .await
            .map_err(|e| StorageError::BackendError(e.to_string()))?;

        Ok(PresignedDownload {
            url: url.to_string(),
            expires_at: expiry_after(ttl),
        })
    }

    fn public_url(&self, path: &str) -> StorageResult<String> {
        validate_key(path)?;
        Ok(self.generate_url(path))
    }
}
