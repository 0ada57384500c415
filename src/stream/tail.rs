//! Reads a file that another task is still appending to.

use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::trace;

use super::SinkProgress;

/// Follows the session file, never reading past what the writer acknowledged.
#[derive(Debug)]
pub struct TailingReader {
    path: PathBuf,
    file: File,
    position: u64,
    progress: watch::Receiver<SinkProgress>,
}

impl TailingReader {
    /// Opens `path` for tailing.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be opened.
    pub async fn open(path: &Path, progress: watch::Receiver<SinkProgress>) -> io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            position: 0,
            progress,
        })
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads until `limit` bytes are buffered or the file is complete.
    ///
    /// Returns fewer than `limit` bytes only at the end of the file; an empty
    /// buffer means everything has been read.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::UnexpectedEof`] if the writer went away before
    /// closing the file, and any read error.
    pub async fn read_up_to(&mut self, limit: usize) -> io::Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(limit);
        while buffer.len() < limit {
            let state = *self.progress.borrow_and_update();
            if self.position < state.bytes_written {
                let available = state.bytes_written - self.position;
                let want = usize::try_from(available)
                    .unwrap_or(usize::MAX)
                    .min(limit - buffer.len());
                let start = buffer.len();
                buffer.resize(start + want, 0);
                self.file.seek(SeekFrom::Start(self.position)).await?;
                self.file.read_exact(&mut buffer[start..]).await?;
                self.position += want as u64;
                trace!(path = %self.path.display(), position = self.position, "tailed bytes");
                continue;
            }
            if state.closed {
                break;
            }
            if self.progress.changed().await.is_err() {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "download stopped before the file was complete",
                ));
            }
        }
        Ok(buffer.freeze())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_only_acknowledged_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tok");
        std::fs::write(&path, b"abcdef").unwrap();
        let (tx, rx) = watch::channel(SinkProgress {
            bytes_written: 4,
            closed: false,
        });
        let mut reader = TailingReader::open(&path, rx).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), reader.read_up_to(6)).await;
        assert!(pending.is_err(), "must wait for the writer to acknowledge more");

        tx.send_replace(SinkProgress {
            bytes_written: 6,
            closed: true,
        });
        let mut reader = TailingReader::open(&path, tx.subscribe()).await.unwrap();
        assert_eq!(reader.read_up_to(4).await.unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(reader.read_up_to(4).await.unwrap(), Bytes::from_static(b"ef"));
        assert!(reader.read_up_to(4).await.unwrap().is_empty());
        assert_eq!(reader.position(), 6);
    }

    #[tokio::test]
    async fn test_follows_growing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tok");
        std::fs::write(&path, b"").unwrap();
        let (tx, rx) = watch::channel(SinkProgress::default());
        let mut reader = TailingReader::open(&path, rx).await.unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        let writer = tokio::spawn(async move {
            for (index, piece) in [b"12", b"34", b"56"].iter().enumerate() {
                tokio::time::sleep(Duration::from_millis(10)).await;
                file.write_all(*piece).unwrap();
                tx.send_replace(SinkProgress {
                    bytes_written: (index as u64 + 1) * 2,
                    closed: index == 2,
                });
            }
        });

        let all = reader.read_up_to(100).await.unwrap();
        assert_eq!(all, Bytes::from_static(b"123456"));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_gone_before_close_is_eof_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tok");
        std::fs::write(&path, b"ab").unwrap();
        let (tx, rx) = watch::channel(SinkProgress {
            bytes_written: 2,
            closed: false,
        });
        let mut reader = TailingReader::open(&path, rx).await.unwrap();
        drop(tx);

        let error = reader.read_up_to(10).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UnexpectedEof);
    }
}
