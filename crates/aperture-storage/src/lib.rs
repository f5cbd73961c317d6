//! Aperture Storage Library
//!
//! The [`Storage`] trait and its Local filesystem, S3-compatible and rclone-remote
//! implementations.
//!
//! # Storage key format
//!
//! Keys are opaque `/`-separated strings. Asset originals live at
//! `{owner_id}/{yyyy}/{mm}/{dd}/{asset_id}/{filename}` and their thumbnails at
//! `{owner_id}/{yyyy}/{mm}/{dd}/{asset_id}/thumbnails/{stem}_{kind}.{ext}`.
//!
//! Keys must not be empty, contain a `..` segment or start with `/`. Key construction is
//! centralized in the [`keys`] module so every backend agrees on the layout.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-rclone")]
pub mod rclone;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

pub use aperture_core::StorageBackend;
pub use factory::create_storage;
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
#[cfg(feature = "storage-rclone")]
pub use rclone::RcloneStorage;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{
    collect_stream, ByteReader, ByteStream, PresignedDownload, PresignedUpload, Storage,
    StorageError, StorageResult, StoredObject,
};
