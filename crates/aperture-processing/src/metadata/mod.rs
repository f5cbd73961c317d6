//! Metadata extraction dispatched by asset type

pub mod image_exif;
pub mod video;

use aperture_core::models::{AssetMetadata, AssetType};
use aperture_core::ProcessingConfig;
use std::io::BufReader;
use std::path::Path;

pub use image_exif::{extract_image_metadata, extract_image_metadata_from_bytes};
pub use video::VideoProbe;

/// Derives [`AssetMetadata`] from a local copy of an asset.
///
/// Extraction never fails as a whole: unreadable fields are dropped and an asset type
/// without an extractor yields empty metadata.
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    video: VideoProbe,
}

impl MetadataExtractor {
    pub fn new(config: &ProcessingConfig) -> anyhow::Result<Self> {
        Ok(Self {
            video: VideoProbe::new(config)?,
        })
    }

    #[tracing::instrument(skip(self, path), fields(asset_type = %asset_type))]
    pub async fn extract(&self, path: &Path, asset_type: AssetType) -> AssetMetadata {
        match asset_type {
            AssetType::Image => {
                let path = path.to_path_buf();
                let result = tokio::task::spawn_blocking(move || {
                    let file = std::fs::File::open(&path)?;
                    Ok::<_, std::io::Error>(extract_image_metadata(&mut BufReader::new(file)))
                })
                .await;

                match result {
                    Ok(Ok(metadata)) => metadata,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Failed to open image for metadata extraction");
                        AssetMetadata::default()
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Image metadata task panicked");
                        AssetMetadata::default()
                    }
                }
            }
            AssetType::Video => self.video.probe(path).await,
            AssetType::Audio | AssetType::Other => AssetMetadata::default(),
        }
    }
}
