pub mod asset;
pub mod checksum;
pub mod task;
pub mod thumbnail;

pub use asset::{Asset, AssetMetadata, AssetStatus, AssetType};
pub use checksum::{Checksum, ChecksumParseError, CHECKSUM_LEN};
pub use task::{
    Priority, ProcessAssetPayload, PurgeTrashedAssetPayload, SweepOrphansPayload, Task,
    TaskPayload, TaskStatus, TaskType,
};
pub use thumbnail::{Thumbnail, ThumbnailKind};
