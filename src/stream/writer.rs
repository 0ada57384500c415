//! Tees incoming chunks into the session file and the live upload tee.

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::SinkProgress;
use crate::protocol::UploadError;
use crate::session::{Chunk, SessionError, SessionMessage};

/// Writes chunks to every active sink and only returns once all of them
/// have taken the chunk.
///
/// The tee is a capacity-1 channel, so at most one chunk per sink is ever
/// in flight. `bytes_written` counts what the file accepted, never the tee.
#[derive(Debug)]
pub(crate) struct DualStreamWriter {
    path: PathBuf,
    file: Option<File>,
    tee: Option<mpsc::Sender<Chunk>>,
    bytes_written: u64,
    ended: bool,
    progress: watch::Sender<SinkProgress>,
    messages: mpsc::UnboundedSender<SessionMessage>,
}

impl DualStreamWriter {
    /// Creates the session file.
    pub(crate) async fn create(
        path: PathBuf,
        tee: Option<mpsc::Sender<Chunk>>,
        messages: mpsc::UnboundedSender<SessionMessage>,
    ) -> io::Result<(Self, watch::Receiver<SinkProgress>)> {
        let file = File::create(&path).await?;
        let (progress, progress_rx) = watch::channel(SinkProgress::default());
        debug!(path = %path.display(), tee = tee.is_some(), "created session file");
        Ok((
            Self {
                path,
                file: Some(file),
                tee,
                bytes_written: 0,
                ended: false,
                progress,
                messages,
            },
            progress_rx,
        ))
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended
    }

    pub(crate) async fn handle_chunk(&mut self, chunk: Chunk) -> Result<(), SessionError> {
        if self.ended {
            return Err(SessionError::AlreadyEnded);
        }
        match chunk {
            Chunk::Data(bytes) => self.write(bytes).await,
            Chunk::End => self.finish().await,
        }
    }

    async fn write(&mut self, bytes: Bytes) -> Result<(), SessionError> {
        let file = self.file.as_mut().ok_or(SessionError::Terminated)?;
        let len = bytes.len() as u64;

        let persist = async {
            file.write_all(&bytes).await?;
            file.flush().await
        };
        let (persisted, teed) = match &self.tee {
            Some(tee) => {
                let (persisted, teed) = tokio::join!(persist, tee.send(Chunk::Data(bytes.clone())));
                (persisted, teed.is_ok())
            }
            None => (persist.await, true),
        };

        if let Err(source) = persisted {
            return Err(self.fail(source));
        }

        // The chunk is on disk whether or not the tee took it
        self.bytes_written += len;
        self.progress.send_replace(SinkProgress {
            bytes_written: self.bytes_written,
            closed: false,
        });
        let _ = self.messages.send(SessionMessage::Written {
            bytes_written: self.bytes_written,
        });

        if !teed {
            debug!(path = %self.path.display(), "upload driver stopped consuming the tee");
            return Err(SessionError::Terminated);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SessionError> {
        let mut file = self.file.take().ok_or(SessionError::Terminated)?;
        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(source) = synced {
            return Err(self.fail(source));
        }
        drop(file);

        if let Some(tee) = self.tee.take()
            && tee.send(Chunk::End).await.is_err()
        {
            debug!(path = %self.path.display(), "upload driver gone before end of download");
        }

        self.ended = true;
        self.progress.send_replace(SinkProgress {
            bytes_written: self.bytes_written,
            closed: true,
        });
        let _ = self.messages.send(SessionMessage::DownloadEnded {
            bytes_written: self.bytes_written,
        });
        debug!(
            path = %self.path.display(),
            bytes = self.bytes_written,
            "download persisted"
        );
        Ok(())
    }

    /// Closes every sink and reports the write failure as the session outcome.
    fn fail(&mut self, source: io::Error) -> SessionError {
        warn!(path = %self.path.display(), error = %source, "failed to persist chunk");
        self.file = None;
        self.tee = None;
        let report = UploadError::io(
            self.path.clone(),
            io::Error::new(source.kind(), source.to_string()),
        );
        let _ = self.messages.send(SessionMessage::Finished(Err(report)));
        SessionError::Sink {
            path: self.path.clone(),
            source,
        }
    }
}
