//! Storage backed by any rclone remote, driven through the `rclone` binary.
//!
//! Each operation runs one rclone subcommand (`rcat`, `cat`, `deletefile`, `lsjson`,
//! `copyto`, `moveto`). Child processes are killed when their future is dropped.

use crate::keys::{content_type_for_key, listing_dir, validate_key};
use crate::traits::{ByteReader, ByteStream, Storage, StorageError, StorageResult, StoredObject};
use crate::StorageBackend;
use aperture_core::RcloneStorageConfig;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

/// rclone exit codes for a missing directory and a missing file.
const EXIT_DIR_NOT_FOUND: i32 = 3;
const EXIT_FILE_NOT_FOUND: i32 = 4;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RcloneEntry {
    path: String,
    size: i64,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    mod_time: Option<DateTime<Utc>>,
    #[serde(default)]
    is_dir: bool,
}

/// Rclone-remote storage implementation
#[derive(Clone, Debug)]
pub struct RcloneStorage {
    binary: String,
    remote: String,
    root: String,
    config_file: Option<std::path::PathBuf>,
    extra_flags: Vec<String>,
    timeout: Duration,
}

impl RcloneStorage {
    pub fn new(config: &RcloneStorageConfig) -> StorageResult<Self> {
        let remote = config.remote.trim().trim_end_matches(':').to_string();
        if remote.is_empty() {
            return Err(StorageError::ConfigError(
                "rclone remote name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            binary: config.binary.clone(),
            remote,
            root: config.path.trim_matches('/').to_string(),
            config_file: config.config_file.clone(),
            extra_flags: config.extra_flags.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// `remote:root/key`
    fn remote_path(&self, key: &str) -> String {
        let key = key.trim_matches('/');
        match (self.root.is_empty(), key.is_empty()) {
            (true, _) => format!("{}:{}", self.remote, key),
            (false, true) => format!("{}:{}", self.remote, self.root),
            (false, false) => format!("{}:{}/{}", self.remote, self.root, key),
        }
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(subcommand);
        if let Some(config_file) = &self.config_file {
            cmd.arg("--config").arg(config_file);
        }
        cmd.args(&self.extra_flags);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run to completion under the configured timeout.
    async fn run(&self, mut cmd: Command, key: &str) -> StorageResult<Output> {
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                StorageError::BackendError(format!(
                    "rclone timed out after {}s for {}",
                    self.timeout.as_secs(),
                    key
                ))
            })?
            .map_err(|e| StorageError::BackendError(format!("Failed to execute rclone: {}", e)))?;
        Ok(output)
    }

    fn check(output: &Output, key: &str, wrap: fn(String) -> StorageError) -> StorageResult<()> {
        Self::check_status(output.status, &output.stderr, key, wrap)
    }

    fn check_status(
        status: ExitStatus,
        stderr: &[u8],
        key: &str,
        wrap: fn(String) -> StorageError,
    ) -> StorageResult<()> {
        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(EXIT_DIR_NOT_FOUND) | Some(EXIT_FILE_NOT_FOUND) => {
                Err(StorageError::NotFound(key.to_string()))
            }
            code => Err(wrap(format!(
                "rclone exited with {:?}: {}",
                code,
                String::from_utf8_lossy(stderr).trim()
            ))),
        }
    }

    async fn stat(&self, key: &str) -> StorageResult<StoredObject> {
        let mut cmd = self.command("lsjson");
        cmd.arg("--stat").arg(self.remote_path(key));
        let output = self.run(cmd, key).await?;
        Self::check(&output, key, StorageError::BackendError)?;

        let entry: RcloneEntry = serde_json::from_slice(&output.stdout).map_err(|e| {
            StorageError::BackendError(format!("Failed to parse rclone lsjson output: {}", e))
        })?;
        if entry.is_dir {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(Self::stored_object(key.to_string(), entry))
    }

    fn stored_object(key: String, entry: RcloneEntry) -> StoredObject {
        let content_type = entry
            .mime_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| content_type_for_key(&key).to_string());
        StoredObject {
            path: key,
            size: entry.size.max(0) as u64,
            content_type,
            checksum: None,
            modified_at: entry.mod_time,
        }
    }
}

/// Collect a child's stderr in the background so a chatty rclone never blocks on it.
fn drain_stderr(stderr: Option<ChildStderr>) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            if let Err(e) = stderr.read_to_end(&mut buf).await {
                tracing::debug!(error = %e, "Failed to read rclone stderr");
            }
        }
        buf
    })
}

/// A running `rclone cat`. The child is owned here, so dropping the stream kills it.
struct CatProcess {
    child: Child,
    stdout: ReaderStream<ChildStdout>,
    stderr: JoinHandle<Vec<u8>>,
    key: String,
}

impl CatProcess {
    async fn next_chunk(mut self) -> Option<(StorageResult<Bytes>, Option<Self>)> {
        match self.stdout.next().await {
            Some(Ok(chunk)) => Some((Ok(chunk), Some(self))),
            Some(Err(e)) => Some((
                Err(StorageError::DownloadFailed(format!("Failed to read chunk: {}", e))),
                None,
            )),
            // EOF only counts as success once rclone has exited cleanly.
            None => self.finish().await.err().map(|e| (Err(e), None)),
        }
    }

    async fn finish(mut self) -> StorageResult<()> {
        let status = self.child.wait().await.map_err(|e| {
            StorageError::DownloadFailed(format!("Failed to wait for rclone: {}", e))
        })?;
        let stderr = self.stderr.await.unwrap_or_default();
        RcloneStorage::check_status(status, &stderr, &self.key, StorageError::DownloadFailed)
    }
}

#[async_trait]
impl Storage for RcloneStorage {
    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Rclone
    }

    #[tracing::instrument(skip(self, reader), fields(remote = %self.remote, key = %path))]
    async fn upload(
        &self,
        path: &str,
        mut reader: ByteReader,
        size: Option<u64>,
        _content_type: &str,
    ) -> StorageResult<u64> {
        validate_key(path)?;
        let start = std::time::Instant::now();

        let mut cmd = self.command("rcat");
        if let Some(size) = size {
            cmd.arg("--size").arg(size.to_string());
        }
        cmd.arg(self.remote_path(path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| StorageError::UploadFailed(format!("Failed to execute rclone: {}", e)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StorageError::UploadFailed("rclone stdin unavailable".to_string()))?;
        let stderr = drain_stderr(child.stderr.take());

        let transfer = async {
            let written = tokio::io::copy(&mut reader, &mut stdin).await?;
            drop(stdin);
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((written, status))
        };

        let (written, status) = tokio::time::timeout(self.timeout, transfer)
            .await
            .map_err(|_| {
                StorageError::UploadFailed(format!(
                    "rclone timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        let stderr = stderr.await.unwrap_or_default();
        Self::check_status(status, &stderr, path, StorageError::UploadFailed)?;

        tracing::info!(
            remote = %self.remote,
            key = %path,
            size_bytes = written,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Rclone upload successful"
        );

        Ok(written)
    }

    async fn download(&self, storage_key: &str) -> StorageResult<ByteStream> {
        validate_key(storage_key)?;
        // `cat` on a missing file only fails after the stream has started, so stat first.
        self.stat(storage_key).await?;

        let mut cmd = self.command("cat");
        cmd.arg(self.remote_path(storage_key));
        let mut child = cmd.spawn().map_err(|e| {
            StorageError::DownloadFailed(format!("Failed to execute rclone: {}", e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StorageError::DownloadFailed("rclone stdout unavailable".to_string()))?;
        let stderr = drain_stderr(child.stderr.take());

        let process = CatProcess {
            child,
            stdout: ReaderStream::new(stdout),
            stderr,
            key: storage_key.to_string(),
        };
        let stream = futures::stream::unfold(Some(process), |process| async move {
            process?.next_chunk().await
        });

        Ok(Box::pin(stream))
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        validate_key(storage_key)?;
        let start = std::time::Instant::now();

        let mut cmd = self.command("deletefile");
        cmd.arg(self.remote_path(storage_key));
        let output = self.run(cmd, storage_key).await?;
        Self::check(&output, storage_key, StorageError::DeleteFailed)?;

        tracing::info!(
            remote = %self.remote,
            key = %storage_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Rclone delete successful"
        );
        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        validate_key(storage_key)?;
        match self.stat(storage_key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn copy(&self, from_key: &str, to_key: &str) -> StorageResult<()> {
        validate_key(from_key)?;
        validate_key(to_key)?;

        let mut cmd = self.command("copyto");
        cmd.arg(self.remote_path(from_key)).arg(self.remote_path(to_key));
        let output = self.run(cmd, from_key).await?;
        Self::check(&output, from_key, StorageError::BackendError)?;

        tracing::info!(from_key = %from_key, to_key = %to_key, "Rclone copy successful");
        Ok(())
    }

    async fn rename(&self, from_key: &str, to_key: &str) -> StorageResult<()> {
        validate_key(from_key)?;
        validate_key(to_key)?;

        let mut cmd = self.command("moveto");
        cmd.arg(self.remote_path(from_key)).arg(self.remote_path(to_key));
        let output = self.run(cmd, from_key).await?;
        Self::check(&output, from_key, StorageError::BackendError)?;

        tracing::info!(from_key = %from_key, to_key = %to_key, "Rclone move successful");
        Ok(())
    }

    async fn list(&self, prefix: &str, recursive: bool) -> StorageResult<Vec<StoredObject>> {
        let dir = listing_dir(prefix);
        if !dir.is_empty() {
            validate_key(dir)?;
        }

        let mut cmd = self.command("lsjson");
        cmd.arg("--files-only");
        if recursive {
            cmd.arg("-R");
        }
        cmd.arg(self.remote_path(dir));

        let output = self.run(cmd, dir).await?;
        match Self::check(&output, dir, StorageError::BackendError) {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let entries: Vec<RcloneEntry> = serde_json::from_slice(&output.stdout).map_err(|e| {
            StorageError::BackendError(format!("Failed to parse rclone lsjson output: {}", e))
        })?;

        let mut objects: Vec<StoredObject> = entries
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .filter_map(|entry| {
                let key = if dir.is_empty() {
                    entry.path.clone()
                } else {
                    format!("{}/{}", dir, entry.path)
                };
                key.starts_with(prefix)
                    .then(|| Self::stored_object(key, entry))
            })
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    async fn metadata(&self, storage_key: &str) -> StorageResult<StoredObject> {
        validate_key(storage_key)?;
        self.stat(storage_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(binary: &str, path: &str) -> RcloneStorageConfig {
        RcloneStorageConfig {
            binary: binary.to_string(),
            remote: "gdrive:".to_string(),
            path: path.to_string(),
            config_file: None,
            extra_flags: vec![],
            timeout_secs: 5,
        }
    }

    #[test]
    fn remote_path_joins_root_and_key() {
        let storage = RcloneStorage::new(&config("rclone", "/media/")).unwrap();
        assert_eq!(storage.remote_path("o/a.jpg"), "gdrive:media/o/a.jpg");
        assert_eq!(storage.remote_path(""), "gdrive:media");

        let bare = RcloneStorage::new(&config("rclone", "")).unwrap();
        assert_eq!(bare.remote_path("o/a.jpg"), "gdrive:o/a.jpg");
    }

    #[test]
    fn empty_remote_is_rejected() {
        let mut cfg = config("rclone", "");
        cfg.remote = " : ".trim().to_string();
        assert!(matches!(
            RcloneStorage::new(&cfg),
            Err(StorageError::ConfigError(_))
        ));
    }

    #[test]
    fn lsjson_entry_parses() {
        let raw = r#"{"Path":"a.jpg","Name":"a.jpg","Size":12,"MimeType":"image/jpeg","ModTime":"2024-05-03T10:00:00.000000000Z","IsDir":false}"#;
        let entry: RcloneEntry = serde_json::from_str(raw).unwrap();
        let object = RcloneStorage::stored_object("o/a.jpg".into(), entry);
        assert_eq!(object.size, 12);
        assert_eq!(object.content_type, "image/jpeg");
        assert!(object.modified_at.is_some());
    }

    #[tokio::test]
    async fn missing_binary_is_backend_error() {
        let storage =
            RcloneStorage::new(&config("/nonexistent/aperture-rclone-binary", "")).unwrap();
        let result = storage.metadata("o/a.jpg").await;
        assert!(matches!(result, Err(StorageError::BackendError(_))));
        assert!(!storage.supports_presigned_urls());
    }

    /// An executable stand-in for rclone whose behaviour per subcommand is `body`.
    #[cfg(unix)]
    fn fake_rclone(dir: &std::path::Path, body: &str) -> RcloneStorage {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("rclone");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        RcloneStorage::new(&config(script.to_str().unwrap(), "")).unwrap()
    }

    #[cfg(unix)]
    const STAT_OK: &str = r#"lsjson) echo '{"Path":"a.jpg","Size":8,"IsDir":false}' ;;"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn not_found_exit_code_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = fake_rclone(dir.path(), "exit 4");
        assert!(matches!(
            storage.delete("o/a.jpg").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(!storage.exists("o/a.jpg").await.unwrap());
        assert!(matches!(
            storage.download("o/a.jpg").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn download_streams_complete_output() {
        let dir = tempfile::tempdir().unwrap();
        let storage = fake_rclone(
            dir.path(),
            &format!(r#"case "$1" in {} cat) printf 'complete' ;; esac"#, STAT_OK),
        );
        let bytes = crate::collect_stream(storage.download("o/a.jpg").await.unwrap())
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), b"complete");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupted_download_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = fake_rclone(
            dir.path(),
            &format!(
                r#"case "$1" in {} cat) printf 'part'; echo 'connection reset' >&2; exit 1 ;; esac"#,
                STAT_OK
            ),
        );
        let result = crate::collect_stream(storage.download("o/a.jpg").await.unwrap()).await;
        match result {
            Err(StorageError::DownloadFailed(message)) => {
                assert!(message.contains("connection reset"), "{}", message)
            }
            other => panic!("expected a download failure, got {:?}", other.map(|b| b.len())),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn object_vanishing_mid_download_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = fake_rclone(
            dir.path(),
            &format!(r#"case "$1" in {} cat) exit 3 ;; esac"#, STAT_OK),
        );
        let result = crate::collect_stream(storage.download("o/a.jpg").await.unwrap()).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn upload_survives_verbose_stderr() {
        let dir = tempfile::tempdir().unwrap();
        // More stderr than a pipe buffer holds, written before stdin is read.
        let storage = fake_rclone(
            dir.path(),
            r#"case "$1" in rcat) head -c 262144 /dev/zero >&2; cat > /dev/null ;; esac"#,
        );
        let data = vec![7u8; 256 * 1024];
        let size = data.len() as u64;
        let written = storage
            .upload("o/a.jpg", Box::pin(std::io::Cursor::new(data)), Some(size), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(written, size);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_upload_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let storage = fake_rclone(
            dir.path(),
            r#"case "$1" in rcat) cat > /dev/null; echo 'quota exceeded' >&2; exit 1 ;; esac"#,
        );
        match storage
            .upload_bytes("o/a.jpg", Bytes::from_static(b"data"), "image/jpeg")
            .await
        {
            Err(StorageError::UploadFailed(message)) => {
                assert!(message.contains("quota exceeded"), "{}", message)
            }
            other => panic!("expected an upload failure, got {:?}", other),
        }
    }
}
