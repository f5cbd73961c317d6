//! Temporary on-disk copies of uploads and originals.

use aperture_core::models::Checksum;
use aperture_processing::HashingReader;
use aperture_storage::ByteStream;
use futures::TryStreamExt;
use std::io;
use std::path::Path;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

/// A hashed copy of a byte stream. The file is removed on drop.
#[derive(Debug)]
pub(crate) struct SpooledFile {
    path: TempPath,
    pub checksum: Checksum,
    pub size: u64,
}

impl SpooledFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn open(&self) -> io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }
}

/// Copy `reader` into a temp file, hashing on the way.
///
/// With a `limit`, at most `limit + 1` bytes are read so an oversized stream is
/// detected without draining it; callers compare `size` against the limit.
pub(crate) async fn spool<R>(reader: R, limit: Option<u64>, suffix: &str) -> io::Result<SpooledFile>
where
    R: AsyncRead + Unpin,
{
    let named = tempfile::Builder::new()
        .prefix("aperture-")
        .suffix(suffix)
        .tempfile()?;
    let (std_file, path) = named.into_parts();
    let mut file = tokio::fs::File::from_std(std_file);

    let mut hashing = HashingReader::new(reader);
    match limit {
        Some(max) => {
            let mut limited = (&mut hashing).take(max.saturating_add(1));
            tokio::io::copy(&mut limited, &mut file).await?;
        }
        None => {
            tokio::io::copy(&mut hashing, &mut file).await?;
        }
    }
    file.flush().await?;
    drop(file);

    let (checksum, size) = hashing.finalize();
    Ok(SpooledFile {
        path,
        checksum,
        size,
    })
}

/// Adapt a storage download into an `AsyncRead`.
pub(crate) fn stream_reader(stream: ByteStream) -> impl AsyncRead + Unpin {
    StreamReader::new(stream.map_err(io::Error::other))
}

/// Filename suffix worth keeping on the temp copy; decoders and ffprobe sniff by it.
pub(crate) fn suffix_for(path: &str) -> String {
    path.rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}
