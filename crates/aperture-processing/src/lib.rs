//! Aperture media processing
//!
//! Content hashing, metadata extraction (EXIF for images, ffprobe for video),
//! thumbnail generation and upload validation. Nothing in this crate touches storage
//! or persistence; callers hand it bytes or local files.

pub mod checksum;
pub mod metadata;
pub mod thumbnail;
pub mod validator;

pub use checksum::{checksum_bytes, compute_checksum, HashingReader};
pub use metadata::{MetadataExtractor, VideoProbe};
pub use thumbnail::{
    fit_dimensions, GeneratedThumbnail, ThumbnailFormat, ThumbnailGenerator, ThumbnailOutcome,
    ThumbnailSpec,
};
pub use validator::{sanitize_filename, MediaValidator, ValidationError};
