#![allow(dead_code)]

pub mod fixtures;
pub mod storage;

use aperture_core::models::{Asset, AssetStatus};
use aperture_core::{ProcessingConfig, TaskQueueSettings, UploadConfig};
use aperture_db::{AssetRepository, MemoryAssetRepository};
use aperture_ingest::{
    register_handlers, AssetLifecycle, AssetProcessor, DuplicateIndex, IngestSettings,
    IngestionCoordinator,
};
use aperture_processing::{MediaValidator, MetadataExtractor, ThumbnailGenerator};
use aperture_storage::{LocalStorage, Storage};
use aperture_worker::WorkQueue;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub use storage::MockStorage;

pub struct TestApp {
    pub repo: Arc<MemoryAssetRepository>,
    pub storage: Arc<dyn Storage>,
    pub queue: WorkQueue,
    pub coordinator: IngestionCoordinator,
    pub duplicates: DuplicateIndex,
    pub processor: AssetProcessor,
    pub owner: Uuid,
    _temp_dir: Option<TempDir>,
}

pub struct TestOptions {
    pub max_file_size: u64,
    pub trash_retention: chrono::Duration,
    pub stale_upload_after: chrono::Duration,
    pub start_queue: bool,
    pub task_timeout_seconds: i32,
    pub max_retries: i32,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            max_file_size: UploadConfig::default().max_file_size_bytes,
            trash_retention: chrono::Duration::days(30),
            stale_upload_after: chrono::Duration::hours(24),
            start_queue: true,
            task_timeout_seconds: 30,
            max_retries: 1,
        }
    }
}

fn queue_settings(options: &TestOptions) -> TaskQueueSettings {
    TaskQueueSettings {
        max_workers: 2,
        poll_interval_ms: 10,
        default_timeout_seconds: options.task_timeout_seconds,
        max_retries: options.max_retries,
        retry_base_ms: 1,
        finished_retention: 1000,
    }
}

impl TestApp {
    /// A fresh process over the same records and objects: new queue, new coordinator.
    pub async fn restart(&self, options: TestOptions) -> TestApp {
        let mut app = build(self.repo.clone(), self.storage.clone(), None, options).await;
        app.owner = self.owner;
        app
    }
}

async fn build(
    repo: Arc<MemoryAssetRepository>,
    storage: Arc<dyn Storage>,
    temp_dir: Option<TempDir>,
    options: TestOptions,
) -> TestApp {
    let queue = WorkQueue::new(queue_settings(&options));

    let upload = UploadConfig::default();
    let validator = MediaValidator::new(
        options.max_file_size,
        upload.allowed_extensions,
        upload.allowed_content_types,
    );
    let settings = IngestSettings {
        direct_upload: true,
        presign_ttl: Duration::from_secs(600),
        trash_retention: options.trash_retention,
        stale_upload_after: options.stale_upload_after,
    };

    let processor = AssetProcessor::new(
        repo.clone(),
        storage.clone(),
        MetadataExtractor::new(&ProcessingConfig::default()).unwrap(),
        ThumbnailGenerator::default(),
    );
    // Objects are written moments before each sweep in these tests.
    let lifecycle = AssetLifecycle::new(repo.clone(), storage.clone())
        .with_orphan_grace(chrono::Duration::zero());
    register_handlers(&queue, processor.clone(), lifecycle).await;
    if options.start_queue {
        queue.start().await.unwrap();
    }

    let coordinator = IngestionCoordinator::new(
        repo.clone(),
        storage.clone(),
        queue.clone(),
        validator,
        settings,
    );

    TestApp {
        duplicates: DuplicateIndex::new(repo.clone()),
        repo,
        storage,
        queue,
        coordinator,
        processor,
        owner: Uuid::new_v4(),
        _temp_dir: temp_dir,
    }
}

fn repo() -> Arc<MemoryAssetRepository> {
    Arc::new(MemoryAssetRepository::new())
}

/// Local filesystem storage: no presigning, uploads are proxied.
pub async fn setup_local_app(options: TestOptions) -> TestApp {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let storage = LocalStorage::with_root(temp_dir.path())
        .await
        .expect("Failed to create local storage");
    build(repo(), Arc::new(storage), Some(temp_dir), options).await
}

/// Presign-capable in-memory storage: uploads go direct.
pub async fn setup_presigned_app(options: TestOptions) -> (TestApp, MockStorage) {
    let mock = MockStorage::new();
    let app = build(repo(), Arc::new(mock.clone()), None, options).await;
    (app, mock)
}

pub async fn wait_for_status(app: &TestApp, asset_id: Uuid, expected: AssetStatus) -> Asset {
    for _ in 0..1000 {
        let asset = app
            .repo
            .get(asset_id)
            .await
            .unwrap()
            .expect("asset disappeared");
        if asset.status == expected {
            return asset;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("asset {} never reached {}", asset_id, expected);
}

pub fn reader(data: Vec<u8>) -> aperture_storage::ByteReader {
    Box::pin(std::io::Cursor::new(data))
}
