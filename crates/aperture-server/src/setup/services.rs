//! Service wiring

use anyhow::Result;
use aperture_core::Config;
use aperture_db::AssetRepository;
use aperture_ingest::{
    register_handlers, AssetLifecycle, AssetProcessor, DuplicateIndex, IngestSettings,
    IngestionCoordinator,
};
use aperture_processing::{MediaValidator, MetadataExtractor, ThumbnailGenerator};
use aperture_storage::Storage;
use aperture_worker::WorkQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const UPLOAD_REAP_PERIOD: Duration = Duration::from_secs(3600);

/// Long-lived services, shared by whatever transport fronts the pipeline.
#[allow(dead_code)] // coordinator and duplicates are the transport's entry points
pub struct AppState {
    pub coordinator: Arc<IngestionCoordinator>,
    pub duplicates: DuplicateIndex,
    pub queue: WorkQueue,
    worker: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl AppState {
    /// Stop claiming tasks and wait for the pool loop to exit. Running handlers are not awaited.
    pub async fn shutdown(self) {
        self.reaper.abort();
        self.queue.shutdown().await;
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "Work queue pool ended abnormally");
        }
        aperture_infra::shutdown_telemetry().await;
    }
}

pub async fn initialize_services(
    config: &Config,
    repo: Arc<dyn AssetRepository>,
    storage: Arc<dyn Storage>,
) -> Result<AppState> {
    let queue = WorkQueue::new(config.task_queue.clone());

    let processor = AssetProcessor::new(
        repo.clone(),
        storage.clone(),
        MetadataExtractor::new(&config.processing)?,
        ThumbnailGenerator::default(),
    );
    let lifecycle = AssetLifecycle::new(repo.clone(), storage.clone())
        .with_orphan_grace(chrono::Duration::minutes(config.orphan_grace_minutes));
    register_handlers(&queue, processor, lifecycle).await;
    let worker = queue.start().await?;

    let coordinator = Arc::new(IngestionCoordinator::new(
        repo.clone(),
        storage,
        queue.clone(),
        MediaValidator::from_config(&config.upload),
        IngestSettings::from_config(config),
    ));

    // Queue state does not survive a restart; rebuild it from the asset records.
    coordinator.recover().await?;
    let reaper = coordinator.clone().start_upload_reaper(UPLOAD_REAP_PERIOD);

    tracing::info!(
        direct_upload = coordinator.direct_upload_available(),
        max_workers = config.task_queue.max_workers,
        "Ingestion services initialized"
    );

    Ok(AppState {
        coordinator,
        duplicates: DuplicateIndex::new(repo),
        queue,
        worker,
        reaper,
    })
}
