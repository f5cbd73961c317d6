//! Container probing for video through ffprobe

use aperture_core::models::AssetMetadata;
use aperture_core::ProcessingConfig;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::image_exif::saturate_i32;

const CREATION_TIME_KEYS: &[&str] = &[
    "creation_time",
    "com.apple.quicktime.creationdate",
    "date",
];
const LOCATION_KEYS: &[&str] = &[
    "location",
    "com.apple.quicktime.location.ISO6709",
    "location-eng",
];

#[derive(Debug, Default, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '$', '`', '(', ')', '<', '>'];

/// The configured ffprobe must name a single program, not a command line.
fn check_program(program: &str) -> Result<()> {
    if program.trim().is_empty() {
        return Err(anyhow!("program name is empty"));
    }
    match program
        .chars()
        .find(|c| c.is_control() || SHELL_METACHARACTERS.contains(c))
    {
        Some(c) => Err(anyhow!("{:?} contains {:?}", program, c)),
        None => Ok(()),
    }
}

/// Runs ffprobe against local files. A missing binary disables probing instead of
/// failing: `probe` then returns empty metadata.
#[derive(Debug, Clone)]
pub struct VideoProbe {
    ffprobe_path: String,
    timeout: Duration,
}

impl VideoProbe {
    pub fn new(config: &ProcessingConfig) -> Result<Self> {
        check_program(&config.ffprobe_path).context("Invalid FFPROBE_PATH")?;
        Ok(Self {
            ffprobe_path: config.ffprobe_path.clone(),
            timeout: Duration::from_secs(config.probe_timeout_secs),
        })
    }

    /// Best-effort metadata for the video at `path`.
    #[tracing::instrument(skip(self), fields(
        process.executable.name = "ffprobe",
        process.executable.path = %self.ffprobe_path
    ))]
    pub async fn probe(&self, path: &Path) -> AssetMetadata {
        match self.run(path).await {
            Ok(Some(output)) => metadata_from_probe(&output),
            Ok(None) => AssetMetadata::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Video probe failed, continuing without metadata");
                AssetMetadata::default()
            }
        }
    }

    /// `Ok(None)` when ffprobe is not installed.
    async fn run(&self, path: &Path) -> Result<Option<ProbeOutput>> {
        let start = std::time::Instant::now();

        let child = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(ffprobe = %self.ffprobe_path, "ffprobe not found, skipping video probe");
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to execute ffprobe"),
        };

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("ffprobe timed out after {}s", self.timeout.as_secs()))?
            .context("Failed to wait for ffprobe")?;

        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        let parsed: ProbeOutput =
            serde_json::from_slice(&output.stdout).context("Failed to parse ffprobe output")?;

        tracing::info!(
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            streams = parsed.streams.len(),
            "Video probe completed"
        );

        Ok(Some(parsed))
    }
}

fn metadata_from_probe(output: &ProbeOutput) -> AssetMetadata {
    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    let mut metadata = AssetMetadata::default();

    if let Some(stream) = video {
        metadata.width = stream.width.map(saturate_i64);
        metadata.height = stream.height.map(saturate_i64);
        metadata.duration_secs = stream.duration.as_deref().and_then(parse_duration);
    }
    if metadata.duration_secs.is_none() {
        metadata.duration_secs = output
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(parse_duration);
    }

    let tag_sets: Vec<&HashMap<String, String>> = output
        .format
        .iter()
        .map(|f| &f.tags)
        .chain(video.map(|s| &s.tags))
        .collect();

    metadata.captured_at = CREATION_TIME_KEYS.iter().find_map(|key| {
        tag_sets
            .iter()
            .find_map(|tags| tags.get(*key))
            .and_then(|raw| parse_creation_time(raw))
    });

    if let Some((lat, lon)) = LOCATION_KEYS.iter().find_map(|key| {
        tag_sets
            .iter()
            .find_map(|tags| tags.get(*key))
            .and_then(|raw| parse_iso6709(raw))
    }) {
        metadata.latitude = Some(lat);
        metadata.longitude = Some(lon);
    }

    metadata
}

fn saturate_i64(value: i64) -> i32 {
    if value < 0 {
        return 0;
    }
    saturate_i32(u32::try_from(value).unwrap_or(u32::MAX))
}

fn parse_duration(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
}

/// Containers disagree on timestamp layout; try each known one in turn.
fn parse_creation_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%d %H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, layout) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for layout in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y:%m:%d %H:%M:%S",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// ISO 6709 short form, `±DD.DDDD±DDD.DDDD[±AAA.AAA]/`. Latitude ends where the
/// second sign character starts.
fn parse_iso6709(raw: &str) -> Option<(f64, f64)> {
    let raw = raw.trim().trim_end_matches('/');
    let is_sign = |c: char| c == '+' || c == '-';

    let split = raw.char_indices().skip(1).find(|(_, c)| is_sign(*c))?.0;
    let (lat, rest) = raw.split_at(split);
    let lon = match rest.char_indices().skip(1).find(|(_, c)| is_sign(*c)) {
        Some((end, _)) => &rest[..end],
        None => rest,
    };

    let lat: f64 = lat.parse().ok()?;
    let lon: f64 = lon.parse().ok()?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some((lat, lon))
}
