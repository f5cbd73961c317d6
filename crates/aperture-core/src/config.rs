//! Configuration module
//!
//! Settings are read from the process environment (a `.env` file is loaded first when
//! present). Every optional value has a default constant below; values that fail to
//! parse fall back to that default.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::storage_types::StorageBackend;

const MAX_FILE_SIZE_MB: u64 = 500;
const DEFAULT_ALLOWED_EXTENSIONS: &str =
    "jpg,jpeg,png,gif,webp,bmp,tif,tiff,heic,mp4,mov,m4v,avi,mkv,webm";
const DEFAULT_ALLOWED_CONTENT_TYPES: &str = "image/jpeg,image/png,image/gif,image/webp,image/bmp,image/tiff,image/heic,video/mp4,video/quicktime,video/x-m4v,video/x-msvideo,video/x-matroska,video/webm";
const LOCAL_FILE_MODE: u32 = 0o644;
const LOCAL_DIR_MODE: u32 = 0o755;
const S3_PRESIGN_TTL_SECS: u64 = 900;
const RCLONE_TIMEOUT_SECS: u64 = 300;
const PROBE_TIMEOUT_SECS: u64 = 30;
const TRASH_RETENTION_DAYS: i64 = 30;
const STALE_UPLOAD_HOURS: i64 = 24;
const ORPHAN_GRACE_MINUTES: i64 = 60;
const MAX_CONNECTIONS: u32 = 20;
const TASK_QUEUE_MAX_WORKERS: usize = 4;
const TASK_QUEUE_POLL_INTERVAL_MS: u64 = 1000;
const TASK_QUEUE_DEFAULT_TIMEOUT_SECONDS: i32 = 600;
const TASK_QUEUE_MAX_RETRIES: i32 = 3;
const TASK_QUEUE_RETRY_BASE_MS: u64 = 1000;
const TASK_QUEUE_FINISHED_RETENTION: usize = 10_000;

#[derive(Clone, Debug)]
pub struct LocalStorageConfig {
    pub root_path: PathBuf,
    /// Base URL the root directory is served under, if any
    pub base_url: Option<String>,
    pub file_mode: u32,
    pub dir_mode: u32,
}

impl LocalStorageConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            base_url: None,
            file_mode: LOCAL_FILE_MODE,
            dir_mode: LOCAL_DIR_MODE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct S3StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible providers (MinIO, R2, ...)
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub path_style: bool,
    pub presign_ttl_secs: u64,
    pub direct_upload: bool,
}

#[derive(Clone, Debug)]
pub struct RcloneStorageConfig {
    pub binary: String,
    pub remote: String,
    /// Sub-path inside the remote that acts as the storage root
    pub path: String,
    pub config_file: Option<PathBuf>,
    pub extra_flags: Vec<String>,
    pub timeout_secs: u64,
}

/// Backend selection plus its settings. Resolved once at startup.
#[derive(Clone, Debug)]
pub enum StorageSettings {
    Local(LocalStorageConfig),
    S3(S3StorageConfig),
    Rclone(RcloneStorageConfig),
}

impl StorageSettings {
    pub fn backend(&self) -> StorageBackend {
        match self {
            StorageSettings::Local(_) => StorageBackend::Local,
            StorageSettings::S3(_) => StorageBackend::S3,
            StorageSettings::Rclone(_) => StorageBackend::Rclone,
        }
    }

    /// Direct-to-storage upload is only offered by S3 with the toggle on.
    pub fn direct_upload_enabled(&self) -> bool {
        matches!(self, StorageSettings::S3(s3) if s3.direct_upload)
    }

    pub fn presign_ttl_secs(&self) -> u64 {
        match self {
            StorageSettings::S3(s3) => s3.presign_ttl_secs,
            _ => S3_PRESIGN_TTL_SECS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub max_file_size_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub allowed_content_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: MAX_FILE_SIZE_MB * 1024 * 1024,
            allowed_extensions: split_list(DEFAULT_ALLOWED_EXTENSIONS),
            allowed_content_types: split_list(DEFAULT_ALLOWED_CONTENT_TYPES),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProcessingConfig {
    pub ffprobe_path: String,
    pub probe_timeout_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: "ffprobe".to_string(),
            probe_timeout_secs: PROBE_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskQueueSettings {
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    pub default_timeout_seconds: i32,
    pub max_retries: i32,
    /// First retry delay; doubles per attempt
    pub retry_base_ms: u64,
    /// How many finished tasks stay inspectable
    pub finished_retention: usize,
}

impl Default for TaskQueueSettings {
    fn default() -> Self {
        Self {
            max_workers: TASK_QUEUE_MAX_WORKERS,
            poll_interval_ms: TASK_QUEUE_POLL_INTERVAL_MS,
            default_timeout_seconds: TASK_QUEUE_DEFAULT_TIMEOUT_SECONDS,
            max_retries: TASK_QUEUE_MAX_RETRIES,
            retry_base_ms: TASK_QUEUE_RETRY_BASE_MS,
            finished_retention: TASK_QUEUE_FINISHED_RETENTION,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// Application configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub environment: String,
    pub log_format: LogFormat,
    /// PostgreSQL connection string; `None` selects the in-memory repository
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub storage: StorageSettings,
    pub upload: UploadConfig,
    pub processing: ProcessingConfig,
    pub task_queue: TaskQueueSettings,
    pub trash_retention_days: i64,
    /// Age after which an asset still in UPLOADING is abandoned and reaped
    pub stale_upload_hours: i64,
    /// Objects younger than this are never treated as orphans
    pub orphan_grace_minutes: i64,
}

impl Config {
    /// Build a configuration around explicit storage settings with defaults elsewhere.
    pub fn with_storage(storage: StorageSettings) -> Self {
        Self {
            environment: "development".to_string(),
            log_format: LogFormat::default(),
            database_url: None,
            db_max_connections: MAX_CONNECTIONS,
            storage,
            upload: UploadConfig::default(),
            processing: ProcessingConfig::default(),
            task_queue: TaskQueueSettings::default(),
            trash_retention_days: TRASH_RETENTION_DAYS,
            stale_upload_hours: STALE_UPLOAD_HOURS,
            orphan_grace_minutes: ORPHAN_GRACE_MINUTES,
        }
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let backend: StorageBackend = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .parse()?;

        let storage = match backend {
            StorageBackend::Local => StorageSettings::Local(LocalStorageConfig {
                root_path: env::var("LOCAL_STORAGE_PATH")
                    .map(PathBuf::from)
                    .map_err(|_| {
                        anyhow::anyhow!("LOCAL_STORAGE_PATH must be set for the local backend")
                    })?,
                base_url: env::var("LOCAL_STORAGE_BASE_URL")
                    .ok()
                    .filter(|s| !s.is_empty()),
                file_mode: parse_mode("LOCAL_FILE_MODE", LOCAL_FILE_MODE),
                dir_mode: parse_mode("LOCAL_DIR_MODE", LOCAL_DIR_MODE),
            }),
            StorageBackend::S3 => StorageSettings::S3(S3StorageConfig {
                bucket: env::var("S3_BUCKET").unwrap_or_default(),
                region: env::var("S3_REGION")
                    .or_else(|_| env::var("AWS_REGION"))
                    .unwrap_or_else(|_| "us-east-1".to_string()),
                endpoint: env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
                access_key_id: env::var("S3_ACCESS_KEY_ID").ok().filter(|s| !s.is_empty()),
                secret_access_key: env::var("S3_SECRET_ACCESS_KEY")
                    .ok()
                    .filter(|s| !s.is_empty()),
                path_style: parse_bool("S3_PATH_STYLE", false),
                presign_ttl_secs: parse_or("S3_PRESIGN_TTL_SECS", S3_PRESIGN_TTL_SECS),
                direct_upload: parse_bool("S3_DIRECT_UPLOAD", true),
            }),
            StorageBackend::Rclone => StorageSettings::Rclone(RcloneStorageConfig {
                binary: env::var("RCLONE_BINARY").unwrap_or_else(|_| "rclone".to_string()),
                remote: env::var("RCLONE_REMOTE").unwrap_or_default(),
                path: env::var("RCLONE_PATH").unwrap_or_default(),
                config_file: env::var("RCLONE_CONFIG").ok().map(PathBuf::from),
                extra_flags: env::var("RCLONE_FLAGS")
                    .map(|s| s.split_whitespace().map(String::from).collect())
                    .unwrap_or_default(),
                timeout_secs: parse_or("RCLONE_TIMEOUT_SECS", RCLONE_TIMEOUT_SECS),
            }),
        };

        let upload = UploadConfig {
            max_file_size_bytes: parse_or("MAX_FILE_SIZE_MB", MAX_FILE_SIZE_MB) * 1024 * 1024,
            allowed_extensions: split_list(
                &env::var("ALLOWED_EXTENSIONS")
                    .unwrap_or_else(|_| DEFAULT_ALLOWED_EXTENSIONS.to_string()),
            ),
            allowed_content_types: split_list(
                &env::var("ALLOWED_CONTENT_TYPES")
                    .unwrap_or_else(|_| DEFAULT_ALLOWED_CONTENT_TYPES.to_string()),
            ),
        };

        let config = Config {
            environment: env::var("ENVIRONMENT")
                .or_else(|_| env::var("APP_ENV"))
                .unwrap_or_else(|_| "development".to_string()),
            log_format: env::var("LOG_FORMAT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            storage,
            upload,
            processing: ProcessingConfig {
                ffprobe_path: env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
                probe_timeout_secs: parse_or("PROBE_TIMEOUT_SECS", PROBE_TIMEOUT_SECS),
            },
            task_queue: TaskQueueSettings {
                max_workers: parse_or("TASK_QUEUE_MAX_WORKERS", TASK_QUEUE_MAX_WORKERS),
                poll_interval_ms: parse_or(
                    "TASK_QUEUE_POLL_INTERVAL_MS",
                    TASK_QUEUE_POLL_INTERVAL_MS,
                ),
                default_timeout_seconds: parse_or(
                    "TASK_QUEUE_DEFAULT_TIMEOUT_SECONDS",
                    TASK_QUEUE_DEFAULT_TIMEOUT_SECONDS,
                ),
                max_retries: parse_or("TASK_QUEUE_MAX_RETRIES", TASK_QUEUE_MAX_RETRIES),
                retry_base_ms: parse_or("TASK_QUEUE_RETRY_BASE_MS", TASK_QUEUE_RETRY_BASE_MS),
                finished_retention: parse_or(
                    "TASK_QUEUE_FINISHED_RETENTION",
                    TASK_QUEUE_FINISHED_RETENTION,
                ),
            },
            trash_retention_days: parse_or("TRASH_RETENTION_DAYS", TRASH_RETENTION_DAYS),
            stale_upload_hours: parse_or("STALE_UPLOAD_HOURS", STALE_UPLOAD_HOURS),
            orphan_grace_minutes: parse_or("ORPHAN_GRACE_MINUTES", ORPHAN_GRACE_MINUTES),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        match &self.storage {
            StorageSettings::Local(local) => {
                if local.root_path.as_os_str().is_empty() {
                    return Err(anyhow::anyhow!("LOCAL_STORAGE_PATH must not be empty"));
                }
            }
            StorageSettings::S3(s3) => {
                if s3.bucket.is_empty() {
                    return Err(anyhow::anyhow!(
                        "S3_BUCKET must be set when using S3 storage backend"
                    ));
                }
                if s3.access_key_id.is_some() != s3.secret_access_key.is_some() {
                    return Err(anyhow::anyhow!(
                        "S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together"
                    ));
                }
                if s3.presign_ttl_secs == 0 {
                    return Err(anyhow::anyhow!("S3_PRESIGN_TTL_SECS must be positive"));
                }
            }
            StorageSettings::Rclone(rclone) => {
                if rclone.remote.is_empty() {
                    return Err(anyhow::anyhow!(
                        "RCLONE_REMOTE must be set when using rclone storage backend"
                    ));
                }
                if rclone.timeout_secs == 0 {
                    return Err(anyhow::anyhow!("RCLONE_TIMEOUT_SECS must be positive"));
                }
            }
        }

        if self.upload.max_file_size_bytes == 0 {
            return Err(anyhow::anyhow!("MAX_FILE_SIZE_MB must be positive"));
        }

        if self.processing.probe_timeout_secs == 0 {
            return Err(anyhow::anyhow!("PROBE_TIMEOUT_SECS must be positive"));
        }

        if self.task_queue.max_workers == 0 {
            return Err(anyhow::anyhow!("TASK_QUEUE_MAX_WORKERS must be at least 1"));
        }

        if self.trash_retention_days < 0 {
            return Err(anyhow::anyhow!("TRASH_RETENTION_DAYS must not be negative"));
        }

        if self.stale_upload_hours <= 0 {
            return Err(anyhow::anyhow!("STALE_UPLOAD_HOURS must be positive"));
        }

        if self.orphan_grace_minutes < 0 {
            return Err(anyhow::anyhow!("ORPHAN_GRACE_MINUTES must not be negative"));
        }

        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.to_lowercase().as_str(), "production" | "prod")
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T: FromStr + ToString>(key: &str, default: T) -> T {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        .parse()
        .unwrap_or(default)
}

/// Permission bits are written in octal (`644`, `0755`).
fn parse_mode(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|s| u32::from_str_radix(s.trim().trim_start_matches("0o"), 8).ok())
        .unwrap_or(default)
}
