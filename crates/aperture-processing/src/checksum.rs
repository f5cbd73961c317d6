//! Streaming SHA-256 content hashing

use aperture_core::models::Checksum;
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

const READ_CHUNK: usize = 64 * 1024;

/// Hash of an in-memory buffer.
pub fn checksum_bytes(data: &[u8]) -> Checksum {
    Checksum::from_bytes(Sha256::digest(data).into())
}

/// Hash a reader to EOF without buffering it, returning the digest and byte count.
pub async fn compute_checksum<R: AsyncRead + Unpin>(reader: R) -> io::Result<(Checksum, u64)> {
    let mut hashing = HashingReader::new(reader);
    let mut buf = vec![0u8; READ_CHUNK];
    while hashing.read(&mut buf).await? != 0 {}
    Ok(hashing.finalize())
}

/// Reader adapter that hashes and counts every byte passing through it.
///
/// Used to checksum an upload while it is being written to storage, so the bytes
/// are read exactly once.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn finalize(self) -> (Checksum, u64) {
        (
            Checksum::from_bytes(self.hasher.finalize().into()),
            self.bytes_read,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                this.hasher.update(fresh);
                this.bytes_read += fresh.len() as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn known_digest() {
        assert_eq!(checksum_bytes(b"hello").to_hex(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn streaming_matches_in_memory() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let (streamed, size) = compute_checksum(std::io::Cursor::new(data.clone()))
            .await
            .unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(streamed, checksum_bytes(&data));

        let (again, _) = compute_checksum(std::io::Cursor::new(data)).await.unwrap();
        assert_eq!(streamed, again);
    }

    #[tokio::test]
    async fn hashing_reader_passes_bytes_through() {
        let mut reader = HashingReader::new(std::io::Cursor::new(b"hello".to_vec()));
        let mut out = Vec::new();
        tokio::io::copy(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(reader.bytes_read(), 5);
        let (checksum, size) = reader.finalize();
        assert_eq!(checksum.to_hex(), HELLO_SHA256);
        assert_eq!(size, 5);
    }
}
