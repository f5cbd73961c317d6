//! Aperture ingestion pipeline
//!
//! [`IngestionCoordinator`] accepts uploads and drives the asset state machine.
//! Processing after an upload runs on the [`WorkQueue`](aperture_worker::WorkQueue)
//! through [`AssetProcessor`]; [`AssetLifecycle`] purges trashed assets and sweeps
//! orphaned objects; [`DuplicateIndex`] answers duplicate queries.

pub mod coordinator;
pub mod duplicates;
pub mod handlers;
pub mod lifecycle;
pub mod processor;
mod spool;

pub use coordinator::{
    AssetDownload, IngestSettings, IngestionCoordinator, InitiateUpload, RecoveryReport,
    UploadTicket,
    MAINTENANCE_QUEUE, MEDIA_QUEUE, ORIGINAL_CACHE_CONTROL, THUMBNAIL_CACHE_CONTROL,
};
pub use duplicates::{DuplicateGroup, DuplicateIndex};
pub use handlers::register_handlers;
pub use lifecycle::{AssetLifecycle, CleanupReport, PurgeOutcome, SweepReport};
pub use processor::{AssetProcessor, ProcessingSummary};
