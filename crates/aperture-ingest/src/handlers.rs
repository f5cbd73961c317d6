//! Work queue handlers for the ingestion task types.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use aperture_core::models::{
    ProcessAssetPayload, PurgeTrashedAssetPayload, SweepOrphansPayload, Task, TaskType,
};
use aperture_core::TaskResultExt;
use aperture_worker::{TaskHandler, WorkQueue};

use crate::lifecycle::AssetLifecycle;
use crate::processor::AssetProcessor;

pub struct ProcessAssetHandler {
    processor: AssetProcessor,
}

#[async_trait]
impl TaskHandler for ProcessAssetHandler {
    async fn handle(&self, task: &Task) -> Result<serde_json::Value> {
        let payload: ProcessAssetPayload = task
            .try_payload_as()
            .context("Invalid process_asset payload")
            .unrecoverable()?;
        let summary = self
            .processor
            .process(payload.asset_id, task.is_final_attempt())
            .await?;
        Ok(serde_json::to_value(summary)?)
    }

    /// A timed-out final attempt is dropped mid-run and never fails the asset itself.
    async fn on_dead_letter(&self, task: &Task, error: &str) {
        match task.try_payload_as::<ProcessAssetPayload>() {
            Ok(payload) => self.processor.abandon(payload.asset_id, error).await,
            Err(e) => tracing::warn!(task_id = %task.id, error = %e, "Dead-lettered task has no asset"),
        }
    }
}

pub struct PurgeTrashedAssetHandler {
    lifecycle: AssetLifecycle,
}

#[async_trait]
impl TaskHandler for PurgeTrashedAssetHandler {
    async fn handle(&self, task: &Task) -> Result<serde_json::Value> {
        let payload: PurgeTrashedAssetPayload = task
            .try_payload_as()
            .context("Invalid purge_trashed_asset payload")
            .unrecoverable()?;
        let outcome = self.lifecycle.purge(payload.asset_id).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}

pub struct SweepOrphansHandler {
    lifecycle: AssetLifecycle,
}

#[async_trait]
impl TaskHandler for SweepOrphansHandler {
    async fn handle(&self, task: &Task) -> Result<serde_json::Value> {
        let payload: SweepOrphansPayload = task
            .try_payload_as()
            .context("Invalid sweep_orphans payload")
            .unrecoverable()?;
        let report = self.lifecycle.sweep_orphans(payload.owner_id).await?;
        Ok(serde_json::to_value(report)?)
    }
}

/// Register a handler for every ingestion task type.
pub async fn register_handlers(queue: &WorkQueue, processor: AssetProcessor, lifecycle: AssetLifecycle) {
    queue
        .register_handler(
            TaskType::ProcessAsset,
            Arc::new(ProcessAssetHandler { processor }),
        )
        .await;
    queue
        .register_handler(
            TaskType::PurgeTrashedAsset,
            Arc::new(PurgeTrashedAssetHandler {
                lifecycle: lifecycle.clone(),
            }),
        )
        .await;
    queue
        .register_handler(
            TaskType::SweepOrphans,
            Arc::new(SweepOrphansHandler { lifecycle }),
        )
        .await;
}
