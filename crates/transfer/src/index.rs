//! Dataset index: one hex chunk key per line, in tar-stream order.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransferError;
use crate::key::ChunkKey;

/// Writes keys in call order.
pub struct IndexWriter<W> {
    inner: W,
    written: u64,
}

impl<W: AsyncWrite + Unpin> IndexWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Appends `hex(key) + '\n'`.
    pub async fn write_key(&mut self, key: &ChunkKey) -> Result<(), TransferError> {
        let mut line = key.to_hex().into_bytes();
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.written += 1;
        Ok(())
    }

    /// Number of keys written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes and shuts the underlying writer down.
    pub async fn finish(mut self) -> Result<W, TransferError> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(self.inner)
    }
}

/// Reads keys in file order.
pub struct IndexReader<R> {
    inner: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> IndexReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
        }
    }

    /// Returns the next key, or `None` at end of stream.
    ///
    /// A final line without a trailing newline is accepted.
    pub async fn next_key(&mut self) -> Result<Option<ChunkKey>, TransferError> {
        self.line.clear();
        let n = self.inner.read_line(&mut self.line).await?;
        if n == 0 {
            return Ok(None);
        }
        let text = self.line.trim_end_matches(['\n', '\r']);
        ChunkKey::from_hex(text)
            .map(Some)
            .map_err(|e| TransferError::Decode {
                line: text.to_string(),
                reason: e.to_string(),
            })
    }
}
