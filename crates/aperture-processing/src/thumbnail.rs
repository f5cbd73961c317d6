//! Thumbnail generation
//!
//! Each [`ThumbnailKind`] has a fixed bounding box and encoding. Originals are never
//! upscaled, and every kind is generated independently so one failing encoder does
//! not cost the others.

use aperture_core::models::ThumbnailKind;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::io::Cursor;
use std::path::Path;

/// Output encoding of a thumbnail kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailFormat {
    Jpeg,
    Webp,
}

impl ThumbnailFormat {
    /// WebP falls back to JPEG when the crate is built without the `webp` feature.
    pub fn effective(self) -> Self {
        match self {
            ThumbnailFormat::Webp if !cfg!(feature = "webp") => ThumbnailFormat::Jpeg,
            other => other,
        }
    }

    pub fn extension(self) -> &'static str {
        match self.effective() {
            ThumbnailFormat::Jpeg => "jpg",
            ThumbnailFormat::Webp => "webp",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self.effective() {
            ThumbnailFormat::Jpeg => "image/jpeg",
            ThumbnailFormat::Webp => "image/webp",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThumbnailSpec {
    pub kind: ThumbnailKind,
    pub max_width: u32,
    pub max_height: u32,
    pub format: ThumbnailFormat,
    pub quality: u8,
}

impl ThumbnailSpec {
    pub fn for_kind(kind: ThumbnailKind) -> Self {
        match kind {
            ThumbnailKind::Preview => Self {
                kind,
                max_width: 1440,
                max_height: 1440,
                format: ThumbnailFormat::Jpeg,
                quality: 85,
            },
            ThumbnailKind::Small => Self {
                kind,
                max_width: 250,
                max_height: 250,
                format: ThumbnailFormat::Jpeg,
                quality: 80,
            },
            ThumbnailKind::Thumb => Self {
                kind,
                max_width: 160,
                max_height: 160,
                format: ThumbnailFormat::Webp,
                quality: 80,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedThumbnail {
    pub kind: ThumbnailKind,
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub content_type: &'static str,
    pub extension: &'static str,
}

/// Result of one kind; failures are reported per kind.
#[derive(Debug)]
pub struct ThumbnailOutcome {
    pub kind: ThumbnailKind,
    pub result: Result<GeneratedThumbnail>,
}

/// Target dimensions for a `width`×`height` original inside a bounding box.
///
/// Returns the original size when it already fits. Otherwise the binding constraint
/// decides: if scaling to `max_width` keeps the height within `max_height` the width
/// is pinned, else the height is. Neither side drops below one pixel.
pub fn fit_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return (width, height);
    }

    let aspect = width as f64 / height as f64;
    if max_width as f64 / aspect <= max_height as f64 {
        let h = (max_width as f64 / aspect).round().max(1.0) as u32;
        (max_width, h.min(max_height))
    } else {
        let w = (max_height as f64 * aspect).round().max(1.0) as u32;
        (w.min(max_width), max_height)
    }
}

#[derive(Debug, Clone)]
pub struct ThumbnailGenerator {
    specs: Vec<ThumbnailSpec>,
}

impl Default for ThumbnailGenerator {
    fn default() -> Self {
        Self::new(ThumbnailKind::ALL.iter().map(|k| ThumbnailSpec::for_kind(*k)).collect())
    }
}

impl ThumbnailGenerator {
    pub fn new(specs: Vec<ThumbnailSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[ThumbnailSpec] {
        &self.specs
    }

    pub fn spec(&self, kind: ThumbnailKind) -> Option<&ThumbnailSpec> {
        self.specs.iter().find(|s| s.kind == kind)
    }

    /// Still-image formats the decoder handles. Video frames are not thumbnailed here.
    pub fn can_generate_thumbnail(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        matches!(
            essence.as_str(),
            "image/jpeg" | "image/jpg" | "image/png" | "image/gif" | "image/webp"
        )
    }

    /// Decode the file at `path` and produce every kind on the blocking pool.
    ///
    /// An undecodable original is an error; per-kind failures are in the outcomes.
    pub async fn generate_from_path(&self, path: &Path) -> Result<Vec<ThumbnailOutcome>> {
        let path = path.to_path_buf();
        let generator = self.clone();
        tokio::task::spawn_blocking(move || {
            let image = ImageReader::open(&path)
                .context("Failed to open original")?
                .with_guessed_format()
                .context("Failed to detect image format")?
                .decode()
                .context("Failed to decode original")?;
            Ok(generator.generate_all(&image))
        })
        .await
        .map_err(|e| anyhow!("Thumbnail task failed: {}", e))?
    }

    pub fn generate_all(&self, source: &DynamicImage) -> Vec<ThumbnailOutcome> {
        self.specs
            .iter()
            .map(|spec| ThumbnailOutcome {
                kind: spec.kind,
                result: Self::generate(source, spec),
            })
            .collect()
    }

    pub fn generate(source: &DynamicImage, spec: &ThumbnailSpec) -> Result<GeneratedThumbnail> {
        let start = std::time::Instant::now();
        let (src_w, src_h) = source.dimensions();
        let (width, height) = fit_dimensions(src_w, src_h, spec.max_width, spec.max_height);

        let resized = if (width, height) == (src_w, src_h) {
            source.clone()
        } else {
            source.resize_exact(width, height, FilterType::Lanczos3)
        };

        let format = spec.format.effective();
        let data = match format {
            ThumbnailFormat::Jpeg => encode_jpeg(&resized, spec.quality)?,
            ThumbnailFormat::Webp => encode_webp(&resized, spec.quality)?,
        };

        tracing::debug!(
            kind = %spec.kind,
            width,
            height,
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Thumbnail generated"
        );

        Ok(GeneratedThumbnail {
            kind: spec.kind,
            data,
            width,
            height,
            content_type: format.content_type(),
            extension: format.extension(),
        })
    }
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Bytes> {
    let rgb = image.to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    rgb.write_with_encoder(encoder)
        .context("JPEG encoding failed")?;
    Ok(Bytes::from(buffer.into_inner()))
}

#[cfg(feature = "webp")]
fn encode_webp(image: &DynamicImage, quality: u8) -> Result<Bytes> {
    let rgba = image.to_rgba8();
    let (w, h) = rgba.dimensions();
    let encoded = webp::Encoder::from_rgba(rgba.as_raw(), w, h).encode(quality as f32);
    Ok(Bytes::copy_from_slice(&encoded))
}

#[cfg(not(feature = "webp"))]
fn encode_webp(image: &DynamicImage, quality: u8) -> Result<Bytes> {
    encode_jpeg(image, quality)
}
