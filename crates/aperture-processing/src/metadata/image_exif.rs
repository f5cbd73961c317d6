//! EXIF tag extraction for still images

use aperture_core::models::AssetMetadata;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use exif::{Exif, Field, In, Rational, Tag, Value};
use image::ImageReader;
use std::io::{BufRead, Cursor, Seek, SeekFrom};

const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Read whatever EXIF fields are present. Missing or unreadable tags are skipped;
/// an image without EXIF yields only its pixel dimensions.
pub fn extract_image_metadata<R: BufRead + Seek>(reader: &mut R) -> AssetMetadata {
    let mut metadata = match exif::Reader::new().read_from_container(reader) {
        Ok(exif) => from_exif(&exif),
        Err(exif::Error::NotFound(_)) | Err(exif::Error::BlankValue(_)) => {
            AssetMetadata::default()
        }
        Err(e) => {
            tracing::debug!(error = %e, "Failed to parse EXIF data");
            AssetMetadata::default()
        }
    };

    if metadata.width.is_none() || metadata.height.is_none() {
        if reader.seek(SeekFrom::Start(0)).is_ok() {
            if let Some((w, h)) = decoded_dimensions(reader) {
                metadata.width = Some(saturate_i32(w));
                metadata.height = Some(saturate_i32(h));
            }
        }
    }

    metadata
}

pub fn extract_image_metadata_from_bytes(data: &[u8]) -> AssetMetadata {
    extract_image_metadata(&mut Cursor::new(data))
}

fn decoded_dimensions<R: BufRead + Seek>(reader: &mut R) -> Option<(u32, u32)> {
    ImageReader::new(reader)
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

fn from_exif(exif: &Exif) -> AssetMetadata {
    let field = |tag: Tag| exif.get_field(tag, In::PRIMARY);

    let mut metadata = AssetMetadata {
        camera_make: field(Tag::Make).and_then(ascii),
        camera_model: field(Tag::Model).and_then(ascii),
        lens_model: field(Tag::LensModel).and_then(ascii),
        description: field(Tag::ImageDescription).and_then(ascii),
        width: field(Tag::PixelXDimension).and_then(uint).map(saturate_i32),
        height: field(Tag::PixelYDimension).and_then(uint).map(saturate_i32),
        f_number: field(Tag::FNumber).and_then(|f| rational(f, 0)),
        focal_length: field(Tag::FocalLength).and_then(|f| rational(f, 0)),
        iso: field(Tag::PhotographicSensitivity)
            .and_then(uint)
            .map(saturate_i32),
        exposure_time: field(Tag::ExposureTime).and_then(exposure),
        captured_at: field(Tag::DateTimeOriginal)
            .or_else(|| field(Tag::DateTimeDigitized))
            .or_else(|| field(Tag::DateTime))
            .and_then(ascii)
            .and_then(|s| parse_exif_datetime(&s)),
        ..Default::default()
    };

    if let (Some(lat), Some(lat_ref)) = (field(Tag::GPSLatitude), field(Tag::GPSLatitudeRef)) {
        metadata.latitude = gps_coordinate(lat, lat_ref, 'S');
    }
    if let (Some(lon), Some(lon_ref)) = (field(Tag::GPSLongitude), field(Tag::GPSLongitudeRef)) {
        metadata.longitude = gps_coordinate(lon, lon_ref, 'W');
    }

    metadata
}

fn ascii(field: &Field) -> Option<String> {
    match &field.value {
        Value::Ascii(values) => values
            .first()
            .map(|v| {
                String::from_utf8_lossy(v)
                    .trim_matches(char::from(0))
                    .trim()
                    .to_string()
            })
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn uint(field: &Field) -> Option<u32> {
    field.value.get_uint(0)
}

/// Values wider than the stored field clamp to `i32::MAX` instead of overflowing.
pub(crate) fn saturate_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn rational_at(field: &Field, index: usize) -> Option<Rational> {
    match &field.value {
        Value::Rational(values) => values.get(index).copied(),
        _ => None,
    }
}

fn rational(field: &Field, index: usize) -> Option<f64> {
    rational_at(field, index)
        .filter(|r| r.denom != 0)
        .map(|r| r.num as f64 / r.denom as f64)
}

/// Exposure is kept as the literal fraction the camera wrote, e.g. `1/125`.
fn exposure(field: &Field) -> Option<String> {
    rational_at(field, 0)
        .filter(|r| r.denom != 0)
        .map(|r| format!("{}/{}", r.num, r.denom))
}

/// Degrees/minutes/seconds plus a hemisphere reference into signed decimal degrees.
fn gps_coordinate(value: &Field, reference: &Field, negative_ref: char) -> Option<f64> {
    let degrees = rational(value, 0)?;
    let minutes = rational(value, 1).unwrap_or(0.0);
    let seconds = rational(value, 2).unwrap_or(0.0);
    let decimal = degrees + minutes / 60.0 + seconds / 3600.0;

    let sign = match ascii(reference) {
        Some(r) if r.starts_with(negative_ref) => -1.0,
        _ => 1.0,
    };
    Some(sign * decimal)
}

/// EXIF timestamps carry no zone; they are stored as UTC.
pub(crate) fn parse_exif_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, EXIF_DATETIME_FORMAT) {
        return Some(dt.and_utc());
    }
    // Some cameras write dashes in the date part or omit the time.
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y:%m:%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
