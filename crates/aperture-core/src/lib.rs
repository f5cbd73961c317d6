//! Aperture Core Library
//!
//! Domain models, error types and configuration shared by every Aperture crate.

pub mod config;
pub mod error;
pub mod models;
pub mod storage_types;
pub mod task_error;

pub use config::{
    Config, LocalStorageConfig, LogFormat, ProcessingConfig, RcloneStorageConfig,
    S3StorageConfig, StorageSettings, TaskQueueSettings, UploadConfig,
};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use storage_types::StorageBackend;
pub use task_error::{TaskError, TaskResultExt};
